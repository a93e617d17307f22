//! Per-item live overlay
//!
//! Likes and comment counts change independently of where an item sits in
//! the feed. The overlay keeps one store subscription per rendered item,
//! shared between every handle watching it and released when the last
//! handle goes away.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::FeedConfig;
use crate::error::{FeedError, Result};
use crate::store::{LikeOp, OrderedStore, SnapshotStream};
use crate::types::{Actor, Comment, ItemCounters, ItemId};

/// Result of [`ItemLiveOverlay::add_comment`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedComment {
    pub comment: Comment,
    /// `false` when the comment was stored but the counter update failed;
    /// the live count catches up on the next store-side correction
    pub count_updated: bool,
}

struct OverlayEntry {
    tx: Arc<watch::Sender<Option<ItemCounters>>>,
    refs: usize,
    task: JoinHandle<()>,
}

type Registry = Arc<DashMap<ItemId, OverlayEntry>>;

/// Live counters for the items currently on screen
pub struct ItemLiveOverlay {
    store: Arc<dyn OrderedStore>,
    entries: Registry,
    reconnect_delay: Duration,
    max_reconnect_attempts: u32,
}

impl ItemLiveOverlay {
    pub fn new(store: Arc<dyn OrderedStore>, config: &FeedConfig) -> Self {
        Self {
            store,
            entries: Arc::new(DashMap::new()),
            reconnect_delay: config.resubscribe_delay(),
            max_reconnect_attempts: config.max_resubscribe_attempts,
        }
    }

    /// `subscribe(id)`: watch an item's counters while it is rendered
    ///
    /// The returned handle already holds the first snapshot. Dropping it
    /// releases the subscription.
    pub async fn subscribe(&self, id: &str) -> Result<OverlayHandle> {
        if let Some(handle) = self.attach(id) {
            return Ok(handle);
        }

        let mut stream = self.store.subscribe_item(id).await?;
        let first = match stream.next().await {
            Some(Ok(counters)) => counters,
            Some(Err(e)) => return Err(e),
            None => return Err(FeedError::SubscriptionDropped(format!("item {}", id))),
        };

        let (tx, rx) = watch::channel(Some(first));
        let tx = Arc::new(tx);
        let task = tokio::spawn(forward_counters(
            Arc::clone(&self.store),
            id.to_string(),
            stream,
            Arc::clone(&tx),
            self.reconnect_delay,
            self.max_reconnect_attempts,
        ));

        match self.entries.entry(id.to_string()) {
            Entry::Occupied(mut occupied) => {
                // Lost a race with another subscriber; share theirs
                task.abort();
                let existing = occupied.get_mut();
                existing.refs += 1;
                Ok(self.handle(id, existing.tx.subscribe()))
            }
            Entry::Vacant(vacant) => {
                info!(item_id = %id, "Overlay subscribed");
                vacant.insert(OverlayEntry { tx, refs: 1, task });
                Ok(self.handle(id, rx))
            }
        }
    }

    /// Drop one reference to `id`; the subscription ends with the last one
    pub fn release(&self, id: &str) {
        release_entry(&self.entries, id);
    }

    pub fn is_watching(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of items with a live subscription
    pub fn active(&self) -> usize {
        self.entries.len()
    }

    /// Latest counters for a watched item
    pub fn latest(&self, id: &str) -> Option<ItemCounters> {
        self.entries.get(id).and_then(|entry| entry.tx.borrow().clone())
    }

    /// `toggleLike(itemId, userId)`: flip the actor's membership in the like-set
    ///
    /// Sent as a single set operation; returns the operation applied.
    pub async fn toggle_like(&self, item_id: &str, actor: &Actor) -> Result<LikeOp> {
        let current = match self.latest(item_id) {
            Some(counters) => counters,
            None => self.read_once(item_id).await?,
        };

        let op = LikeOp::toggle(current.likes.contains(&actor.user_id));
        self.store
            .mutate_like_set(item_id, &actor.user_id, op)
            .await?;

        if let Some(entry) = self.entries.get(item_id) {
            entry.tx.send_if_modified(|counters| {
                reflect_own_toggle(counters, &current, &actor.user_id, op)
            });
        }

        debug!(item_id, user_id = %actor.user_id, ?op, "Like toggled");
        Ok(op)
    }

    /// `addComment(itemId, text, authorId)`: append and bump the counter
    pub async fn add_comment(
        &self,
        item_id: &str,
        text: &str,
        actor: &Actor,
    ) -> Result<AddedComment> {
        let text = text.trim();
        if text.is_empty() {
            return Err(FeedError::InvalidInput("comment text is empty".into()));
        }

        let comment = self.store.append_comment(item_id, text, actor).await?;

        let count_updated = match self.store.increment_comment_count(item_id, 1).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    item_id,
                    comment_id = %comment.id,
                    "Comment stored but counter update failed: {}",
                    e
                );
                false
            }
        };

        Ok(AddedComment {
            comment,
            count_updated,
        })
    }

    /// Live comment thread, oldest first
    pub async fn comments(&self, item_id: &str) -> Result<SnapshotStream<Vec<Comment>>> {
        let stream = self.store.subscribe_comments(item_id).await?;
        Ok(stream
            .map(|snapshot| {
                snapshot.map(|mut thread| {
                    thread.sort_by(|a, b| a.display_cmp(b));
                    thread
                })
            })
            .boxed())
    }

    fn attach(&self, id: &str) -> Option<OverlayHandle> {
        let rx = {
            let mut entry = self.entries.get_mut(id)?;
            entry.refs += 1;
            entry.tx.subscribe()
        };
        Some(self.handle(id, rx))
    }

    fn handle(&self, id: &str, rx: watch::Receiver<Option<ItemCounters>>) -> OverlayHandle {
        OverlayHandle {
            id: id.to_string(),
            rx,
            entries: Arc::clone(&self.entries),
        }
    }

    async fn read_once(&self, item_id: &str) -> Result<ItemCounters> {
        let mut stream = self.store.subscribe_item(item_id).await?;
        match stream.next().await {
            Some(result) => result,
            None => Err(FeedError::SubscriptionDropped(format!("item {}", item_id))),
        }
    }
}

impl Drop for ItemLiveOverlay {
    fn drop(&mut self) {
        for entry in self.entries.iter() {
            entry.task.abort();
        }
        self.entries.clear();
    }
}

/// A rendered item's view of its live counters
pub struct OverlayHandle {
    id: ItemId,
    rx: watch::Receiver<Option<ItemCounters>>,
    entries: Registry,
}

impl OverlayHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Latest counters
    pub fn counters(&self) -> ItemCounters {
        self.rx.borrow().clone().unwrap_or_default()
    }

    /// Wait for the next change
    pub async fn changed(&mut self) -> Result<ItemCounters> {
        self.rx.changed().await.map_err(|_| FeedError::Closed)?;
        Ok(self.counters())
    }

    /// Wait until the counters satisfy `predicate`
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> Result<ItemCounters>
    where
        F: FnMut(&ItemCounters) -> bool,
    {
        let value = self
            .rx
            .wait_for(|counters| counters.as_ref().is_some_and(&mut predicate))
            .await
            .map_err(|_| FeedError::Closed)?;
        Ok(value.clone().unwrap_or_default())
    }
}

impl Drop for OverlayHandle {
    fn drop(&mut self) {
        release_entry(&self.entries, &self.id);
    }
}

/// Show our own like write until the store echoes it back
///
/// Skipped when the snapshot moved on since the toggle was decided: the store
/// has already reported a newer like-set than ours.
fn reflect_own_toggle(
    counters: &mut Option<ItemCounters>,
    decided_from: &ItemCounters,
    user_id: &str,
    op: LikeOp,
) -> bool {
    match counters {
        Some(counters) if counters == decided_from => match op {
            LikeOp::Add => counters.likes.insert(user_id.to_string()),
            LikeOp::Remove => counters.likes.remove(user_id),
        },
        _ => false,
    }
}

fn release_entry(entries: &DashMap<ItemId, OverlayEntry>, id: &str) {
    let removed = entries.remove_if_mut(id, |_, entry| {
        entry.refs = entry.refs.saturating_sub(1);
        entry.refs == 0
    });
    if let Some((_, entry)) = removed {
        entry.task.abort();
        info!(item_id = %id, "Overlay released");
    }
}

async fn forward_counters(
    store: Arc<dyn OrderedStore>,
    id: ItemId,
    first: SnapshotStream<ItemCounters>,
    tx: Arc<watch::Sender<Option<ItemCounters>>>,
    reconnect_delay: Duration,
    max_reconnect_attempts: u32,
) {
    let mut stream = Some(first);
    let mut attempts = 0u32;

    loop {
        if let Some(mut live) = stream.take() {
            while let Some(next) = live.next().await {
                match next {
                    Ok(counters) => {
                        attempts = 0;
                        tx.send_replace(Some(counters));
                    }
                    Err(e) => {
                        warn!(item_id = %id, "Overlay subscription dropped: {}", e);
                        break;
                    }
                }
            }
        }

        attempts += 1;
        if max_reconnect_attempts > 0 && attempts > max_reconnect_attempts {
            warn!(
                item_id = %id,
                "Giving up on overlay after {} resubscribe attempts",
                max_reconnect_attempts
            );
            return;
        }

        sleep(reconnect_delay).await;

        match store.subscribe_item(&id).await {
            Ok(next) => stream = Some(next),
            Err(FeedError::NotFound(_)) => {
                warn!(item_id = %id, "Item disappeared, stopping overlay");
                return;
            }
            Err(e) => warn!(item_id = %id, "Overlay resubscribe failed: {}", e),
        }
    }
}
