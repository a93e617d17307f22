//! Live window watcher
//!
//! Keeps a push subscription to the newest K items of a scope. Every emission
//! is a complete replacement of the window; only the latest snapshot is held,
//! in a `watch` channel. When the subscription drops, the last snapshot is
//! kept but marked stale until a resubscribe delivers a fresh one.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::FeedConfig;
use crate::store::OrderedStore;
use crate::types::{FeedItem, FeedScope};

/// Latest known state of the live window
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowState {
    /// The most recent snapshot, newest first
    pub items: Vec<FeedItem>,
    /// The subscription dropped and has not yet delivered a fresh snapshot
    pub stale: bool,
    /// Number of snapshots received; 0 until the first one arrives
    pub generation: u64,
}

struct WatchSettings {
    scope: FeedScope,
    limit: usize,
    reconnect_delay: Duration,
    max_reconnect_attempts: u32,
}

/// Watches the top-K window of a scope
pub struct LiveWindowWatcher {
    state_rx: watch::Receiver<WindowState>,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl LiveWindowWatcher {
    /// Subscribe to the newest `config.window_size` items of `scope`
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(store: Arc<dyn OrderedStore>, scope: FeedScope, config: &FeedConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(WindowState::default());
        let (shutdown_tx, _) = broadcast::channel(1);

        let settings = WatchSettings {
            scope,
            limit: config.window_size,
            reconnect_delay: config.resubscribe_delay(),
            max_reconnect_attempts: config.max_resubscribe_attempts,
        };
        let shutdown_rx = shutdown_tx.subscribe();
        let task = tokio::spawn(run(store, settings, state_tx, shutdown_rx));

        Self {
            state_rx,
            shutdown_tx,
            task,
        }
    }

    /// Receiver that observes every new window state
    pub fn subscribe(&self) -> watch::Receiver<WindowState> {
        self.state_rx.clone()
    }

    pub fn latest(&self) -> WindowState {
        self.state_rx.borrow().clone()
    }

    /// Tear the subscription down; no state is published afterwards
    pub fn unsubscribe(&self) {
        let _ = self.shutdown_tx.send(());
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for LiveWindowWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    store: Arc<dyn OrderedStore>,
    settings: WatchSettings,
    state_tx: watch::Sender<WindowState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut attempts = 0u32;

    loop {
        info!("Subscribing to top-{} window of {:?}", settings.limit, settings.scope);

        match store.subscribe_top(&settings.scope, settings.limit).await {
            Ok(mut stream) => loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Window watcher shutting down");
                        return;
                    }
                    next = stream.next() => match next {
                        Some(Ok(items)) => {
                            attempts = 0;
                            debug!("Window snapshot with {} items", items.len());
                            state_tx.send_modify(|state| {
                                state.items = items;
                                state.stale = false;
                                state.generation += 1;
                            });
                        }
                        Some(Err(e)) => {
                            warn!("Window subscription dropped: {}", e);
                            break;
                        }
                        None => {
                            warn!("Window subscription ended");
                            break;
                        }
                    }
                }
            },
            Err(e) => {
                error!("Window subscription failed: {}", e);
            }
        }

        state_tx.send_if_modified(|state| {
            let was_stale = state.stale;
            state.stale = true;
            !was_stale
        });

        // Counts resubscribes since the last delivered snapshot
        attempts += 1;
        if settings.max_reconnect_attempts > 0 && attempts > settings.max_reconnect_attempts {
            error!(
                "Max resubscribe attempts ({}) reached, window stays stale",
                settings.max_reconnect_attempts
            );
            return;
        }

        info!(
            "Resubscribing in {:?} (attempt {})",
            settings.reconnect_delay, attempts
        );

        tokio::select! {
            _ = sleep(settings.reconnect_delay) => {}
            _ = shutdown_rx.recv() => {
                info!("Shutdown received during resubscribe wait");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};

    fn item(id: &str, ms: i64) -> FeedItem {
        FeedItem {
            id: id.to_string(),
            author_id: "author".into(),
            author_name: None,
            author_photo: None,
            created_at: Utc.timestamp_millis_opt(ms).single(),
            image_ref: String::new(),
            caption: String::new(),
            likes: Default::default(),
            comment_count: 0,
        }
    }

    fn fast_config(window: usize) -> FeedConfig {
        FeedConfig {
            window_size: window,
            resubscribe_delay_ms: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_first_snapshot_is_published() {
        let store = Arc::new(MemoryStore::new());
        store.insert_many(vec![item("a", 1), item("b", 2), item("c", 3)]);

        let watcher = LiveWindowWatcher::spawn(store, FeedScope::Home, &fast_config(2));
        let mut rx = watcher.subscribe();
        let state = rx.wait_for(|s| s.generation >= 1).await.unwrap().clone();

        let ids: Vec<_> = state.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
        assert!(!state.stale);
    }

    #[tokio::test]
    async fn test_drop_marks_stale_then_recovers() {
        let store = Arc::new(MemoryStore::new());
        store.insert(item("a", 1));

        let watcher = LiveWindowWatcher::spawn(store.clone(), FeedScope::Home, &fast_config(2));
        let mut rx = watcher.subscribe();
        rx.wait_for(|s| s.generation >= 1).await.unwrap();

        store.disconnect_subscribers();
        let stale = rx.wait_for(|s| s.stale).await.unwrap().clone();
        assert_eq!(stale.items.len(), 1, "stale window keeps its items");

        let fresh = rx.wait_for(|s| !s.stale && s.generation >= 2).await.unwrap().clone();
        assert_eq!(fresh.items[0].id, "a");
    }

    #[tokio::test]
    async fn test_refused_subscribe_is_retried() {
        let store = Arc::new(MemoryStore::new());
        store.insert(item("a", 1));
        store.fail_next_subscribes(2);

        let watcher = LiveWindowWatcher::spawn(store, FeedScope::Home, &fast_config(2));
        let mut rx = watcher.subscribe();
        let state = rx.wait_for(|s| s.generation >= 1).await.unwrap().clone();

        assert!(!state.stale);
        assert_eq!(state.items.len(), 1);
    }

    #[tokio::test]
    async fn test_single_attempt_limit_still_recovers_from_a_drop() {
        let store = Arc::new(MemoryStore::new());
        store.insert(item("a", 1));
        let config = FeedConfig {
            max_resubscribe_attempts: 1,
            ..fast_config(2)
        };

        let watcher = LiveWindowWatcher::spawn(store.clone(), FeedScope::Home, &config);
        let mut rx = watcher.subscribe();
        rx.wait_for(|s| s.generation >= 1).await.unwrap();

        store.disconnect_subscribers();
        let state = rx.wait_for(|s| !s.stale && s.generation >= 2).await.unwrap().clone();
        assert_eq!(state.items.len(), 1);
        assert!(!watcher.is_finished());
    }

    #[tokio::test]
    async fn test_gives_up_once_attempts_are_spent() {
        let store = Arc::new(MemoryStore::new());
        store.insert(item("a", 1));
        store.fail_next_subscribes(5);
        let config = FeedConfig {
            max_resubscribe_attempts: 1,
            ..fast_config(2)
        };

        let watcher = LiveWindowWatcher::spawn(store, FeedScope::Home, &config);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !watcher.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let state = watcher.latest();
        assert!(state.stale);
        assert_eq!(state.generation, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_publishing() {
        let store = Arc::new(MemoryStore::new());
        store.insert(item("a", 1));

        let watcher = LiveWindowWatcher::spawn(store.clone(), FeedScope::Home, &fast_config(2));
        let mut rx = watcher.subscribe();
        rx.wait_for(|s| s.generation >= 1).await.unwrap();

        watcher.unsubscribe();
        tokio::task::yield_now().await;
        store.insert(item("b", 2));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(watcher.latest().generation, 1);
    }
}
