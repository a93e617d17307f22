//! Feed synchronization and pagination
//!
//! A [`Feed`] presents one stably-ordered, duplicate-free list of posts:
//! - the newest K items stay live through a [`LiveWindowWatcher`]
//! - older items are paged in through [`PaginationCursor`] as the viewer scrolls,
//!   gated by a [`ScrollTrigger`]
//! - [`FeedMerger`] reconciles both sources into `window ++ tail`
//!
//! The merged sequence and cursor belong to the feed alone. The watcher and
//! the page fetch only produce inputs; consumers read [`FeedView`] snapshots.

mod cursor;
mod merger;
mod trigger;
mod window;

pub use cursor::{advance, fetch_page, Page, PaginationCursor};
pub use merger::{FeedMerger, MergedEntry, PageMerge, WindowMerge};
pub use trigger::{FetchTicket, ScrollTrigger, TriggerDecision};
pub use window::{LiveWindowWatcher, WindowState};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::FeedConfig;
use crate::error::{FeedError, Result};
use crate::store::OrderedStore;
use crate::types::{Cursor, FeedItem, FeedScope, ItemCounters, ItemId};

/// Read-only snapshot of a feed for the presentation layer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedView {
    /// Merged sequence, newest first
    pub items: Vec<FeedItem>,
    /// How many leading items belong to the live window
    pub window_len: usize,
    /// Live window snapshots applied so far
    pub window_generation: u64,
    pub has_more: bool,
    pub loading_more: bool,
    /// The live window is disconnected; items shown are the last known ones
    pub stale: bool,
    /// Items sorted by arrival time because their `createdAt` was unusable
    pub degraded: Vec<ItemId>,
    pub cursor: Option<Cursor>,
    /// Most recent page fetch failure, cleared by the next success
    pub last_error: Option<FeedError>,
}

impl FeedView {
    pub fn ids(&self) -> Vec<&str> {
        self.items.iter().map(|i| i.id.as_str()).collect()
    }
}

/// Why a fetch request did not reach the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InFlight,
    Exhausted,
    Hidden,
}

/// Result of [`Feed::fetch_more`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Loaded {
        appended: usize,
        duplicates: usize,
        /// Items removed upstream after the page was read
        stale: usize,
        has_more: bool,
    },
    Skipped(SkipReason),
}

struct FeedState {
    merger: FeedMerger,
    cursor: PaginationCursor,
    window_generation: u64,
    window_stale: bool,
    last_error: Option<FeedError>,
}

struct FeedInner {
    store: Arc<dyn OrderedStore>,
    scope: FeedScope,
    config: FeedConfig,
    state: Mutex<FeedState>,
    trigger: ScrollTrigger,
    view_tx: watch::Sender<FeedView>,
    closed: AtomicBool,
    watcher: std::sync::Mutex<Option<LiveWindowWatcher>>,
    sync_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// A live, paginated feed view
///
/// Cheap to clone; all clones share one merged sequence.
#[derive(Clone)]
pub struct Feed {
    inner: Arc<FeedInner>,
}

impl Feed {
    /// Open a feed over `scope` and start watching its live window
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(
        store: Arc<dyn OrderedStore>,
        scope: FeedScope,
        config: FeedConfig,
    ) -> Result<Self> {
        config.validate()?;

        let watcher = LiveWindowWatcher::spawn(Arc::clone(&store), scope.clone(), &config);
        let window_rx = watcher.subscribe();
        let (view_tx, _) = watch::channel(FeedView {
            has_more: true,
            ..Default::default()
        });

        let inner = Arc::new(FeedInner {
            store,
            scope,
            state: Mutex::new(FeedState {
                merger: FeedMerger::new(config.window_size),
                cursor: PaginationCursor::new(),
                window_generation: 0,
                window_stale: false,
                last_error: None,
            }),
            config,
            trigger: ScrollTrigger::new(),
            view_tx,
            closed: AtomicBool::new(false),
            watcher: std::sync::Mutex::new(Some(watcher)),
            sync_task: std::sync::Mutex::new(None),
        });

        let task = tokio::spawn(sync_window(Arc::downgrade(&inner), window_rx));
        *lock(&inner.sync_task) = Some(task);

        info!(
            "Opened {:?} feed (window {}, page {})",
            inner.scope, inner.config.window_size, inner.config.page_size
        );
        Ok(Self { inner })
    }

    pub fn scope(&self) -> &FeedScope {
        &self.inner.scope
    }

    pub fn config(&self) -> &FeedConfig {
        &self.inner.config
    }

    /// Receiver for every published view
    pub fn subscribe(&self) -> watch::Receiver<FeedView> {
        self.inner.view_tx.subscribe()
    }

    /// The current view
    pub fn view(&self) -> FeedView {
        self.inner.view_tx.borrow().clone()
    }

    /// Wait until the published view satisfies `predicate`
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<FeedView>
    where
        F: FnMut(&FeedView) -> bool,
    {
        let mut rx = self.subscribe();
        let view = rx
            .wait_for(|view| predicate(view))
            .await
            .map_err(|_| FeedError::Closed)?;
        Ok(view.clone())
    }

    /// Report whether the scroll sentinel is visible; fetches when it is
    pub async fn on_sentinel(&self, visible: bool) -> Result<FetchOutcome> {
        self.request_page(self.inner.trigger.observe(visible)).await
    }

    /// `fetchMore()`: load the next page unless one is in flight or none remain
    pub async fn fetch_more(&self) -> Result<FetchOutcome> {
        self.on_sentinel(true).await
    }

    pub fn loading_more(&self) -> bool {
        self.inner.trigger.loading_more()
    }

    pub fn has_more(&self) -> bool {
        self.inner.trigger.has_more()
    }

    /// Route a live overlay update into the merged sequence without moving the item
    pub async fn apply_counters(&self, id: &str, counters: &ItemCounters) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut state = self.inner.state.lock().await;
        let updated = state.merger.apply_counters(id, counters);
        if updated {
            self.inner.publish(&state);
        }
        updated
    }

    /// Find an item in the merged sequence, falling back to the store
    pub async fn lookup(&self, id: &str) -> Result<FeedItem> {
        {
            let state = self.inner.state.lock().await;
            if let Some(item) = state.merger.get(id) {
                return Ok(item.clone());
            }
        }
        self.inner
            .store
            .get_item(id)
            .await?
            .ok_or_else(|| FeedError::NotFound(id.to_string()))
    }

    /// Tear down the live window; the view is frozen afterwards
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown();
        info!("Closed {:?} feed", self.inner.scope);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    async fn request_page(&self, decision: TriggerDecision) -> Result<FetchOutcome> {
        if self.is_closed() {
            return Err(FeedError::Closed);
        }

        let ticket = match decision {
            TriggerDecision::Fire(ticket) => ticket,
            TriggerDecision::InFlight => {
                debug!("Fetch already in flight, dropping trigger");
                return Ok(FetchOutcome::Skipped(SkipReason::InFlight));
            }
            TriggerDecision::Exhausted => return Ok(FetchOutcome::Skipped(SkipReason::Exhausted)),
            TriggerDecision::Hidden => return Ok(FetchOutcome::Skipped(SkipReason::Hidden)),
        };

        let cursor = {
            let mut state = self.inner.state.lock().await;
            let boundary = state.merger.window_boundary();
            state.cursor.seed(boundary);
            self.inner.publish(&state);
            state.cursor.current().cloned()
        };

        let limit = self.inner.config.page_size;
        let result = fetch_page(
            self.inner.store.as_ref(),
            &self.inner.scope,
            cursor.as_ref(),
            limit,
        )
        .await;

        if self.is_closed() {
            return Err(FeedError::Closed);
        }

        let mut state = self.inner.state.lock().await;
        match result {
            Ok(page) => {
                let has_more = page.has_more;
                state.cursor.commit(&page);
                let merge = state.merger.append_page(page.items);
                state.last_error = None;
                ticket.complete(has_more);
                self.inner.publish(&state);

                debug!(
                    "Page {} merged: {} appended, {} duplicates, {} stale, has_more={}",
                    state.cursor.pages(),
                    merge.appended,
                    merge.duplicates,
                    merge.stale,
                    has_more
                );
                Ok(FetchOutcome::Loaded {
                    appended: merge.appended,
                    duplicates: merge.duplicates,
                    stale: merge.stale,
                    has_more,
                })
            }
            Err(e) => {
                warn!("Page fetch failed, will retry on next trigger: {}", e);
                drop(ticket);
                state.last_error = Some(e.clone());
                self.inner.publish(&state);
                Err(e)
            }
        }
    }
}

impl FeedInner {
    async fn apply_window(&self, window: WindowState) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let mut state = self.state.lock().await;
        if window.generation != state.window_generation {
            let merge = state.merger.apply_window(window.items);
            state.window_generation = window.generation;
            if !merge.dropped.is_empty() {
                debug!("{} items left the window for good", merge.dropped.len());
            }
        }
        if window.stale != state.window_stale {
            if window.stale {
                warn!("Live window for {:?} is stale", self.scope);
            } else {
                info!("Live window for {:?} recovered", self.scope);
            }
            state.window_stale = window.stale;
        }
        self.publish(&state);
    }

    fn publish(&self, state: &FeedState) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let view = FeedView {
            items: state.merger.items(),
            window_len: state.merger.window_len(),
            window_generation: state.window_generation,
            has_more: self.trigger.has_more(),
            loading_more: self.trigger.loading_more(),
            stale: state.window_stale,
            degraded: state.merger.degraded_ids(),
            cursor: state.cursor.current().cloned(),
            last_error: state.last_error.clone(),
        };
        self.view_tx.send_replace(view);
    }

    fn shutdown(&self) {
        if let Some(watcher) = lock(&self.watcher).take() {
            watcher.unsubscribe();
        }
        if let Some(task) = lock(&self.sync_task).take() {
            task.abort();
        }
    }
}

impl Drop for FeedInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Applies every new window state until the watcher or the feed goes away
async fn sync_window(feed: Weak<FeedInner>, mut window_rx: watch::Receiver<WindowState>) {
    loop {
        if window_rx.changed().await.is_err() {
            debug!("Window channel closed, stopping window sync");
            return;
        }
        let window = window_rx.borrow_and_update().clone();
        let Some(inner) = feed.upgrade() else {
            return;
        };
        inner.apply_window(window).await;
    }
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
