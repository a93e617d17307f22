//! In-memory ordered store
//!
//! Backs tests and offline use. Every mutation is announced on a broadcast
//! channel; each live subscription recomputes its snapshot from the shared
//! maps and emits only when the snapshot actually changed.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use super::{LikeOp, NewItem, OrderedStore, SnapshotStream};
use crate::error::{FeedError, Result};
use crate::types::{Actor, Comment, Cursor, FeedItem, FeedScope, ItemCounters, ItemId};

#[derive(Debug, Clone, PartialEq, Eq)]
enum StoreChange {
    Item(ItemId),
    Comments(ItemId),
    /// Sent to simulate a dropped connection; every open stream ends with an error
    Disconnect,
    /// A receiver lagged and must recompute from scratch
    Resync,
}

/// Injected failures for exercising the degraded paths
#[derive(Debug, Default)]
struct FailurePlan {
    fetches: VecDeque<FeedError>,
    counter_increments: u32,
    like_mutations: u32,
    subscribes: u32,
}

/// In-memory [`OrderedStore`]
pub struct MemoryStore {
    items: Arc<DashMap<ItemId, FeedItem>>,
    comments: Arc<DashMap<ItemId, Vec<Comment>>>,
    changes: broadcast::Sender<StoreChange>,
    failures: Mutex<FailurePlan>,
    fetch_gate: watch::Sender<bool>,
    fetch_calls: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1000);
        let (fetch_gate, _) = watch::channel(true);

        Self {
            items: Arc::new(DashMap::new()),
            comments: Arc::new(DashMap::new()),
            changes,
            failures: Mutex::new(FailurePlan::default()),
            fetch_gate,
            fetch_calls: AtomicUsize::new(0),
        }
    }

    /// Insert or replace an item as an external writer would
    pub fn insert(&self, item: FeedItem) {
        let id = item.id.clone();
        self.items.insert(id.clone(), item);
        self.announce(StoreChange::Item(id));
    }

    pub fn insert_many(&self, items: impl IntoIterator<Item = FeedItem>) {
        for item in items {
            self.insert(item);
        }
    }

    /// Remove an item as an external writer would
    pub fn remove(&self, id: &str) -> Option<FeedItem> {
        let removed = self.items.remove(id).map(|(_, item)| item);
        if removed.is_some() {
            self.comments.remove(id);
            self.announce(StoreChange::Item(id.to_string()));
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Current stored copy of an item
    pub fn item(&self, id: &str) -> Option<FeedItem> {
        self.items.get(id).map(|entry| entry.clone())
    }

    /// Number of `fetch_page` calls served (including failed ones)
    pub fn fetch_count(&self) -> usize {
        self.fetch_calls.load(AtomicOrdering::SeqCst)
    }

    /// Make the next `fetch_page` call fail with `err`
    pub fn fail_next_fetch(&self, err: FeedError) {
        self.plan().fetches.push_back(err);
    }

    /// Make the next `increment_comment_count` call fail
    pub fn fail_next_counter_increment(&self) {
        self.plan().counter_increments += 1;
    }

    /// Make the next `mutate_like_set` call fail
    pub fn fail_next_like(&self) {
        self.plan().like_mutations += 1;
    }

    /// Make the next `count` subscription attempts fail
    pub fn fail_next_subscribes(&self, count: u32) {
        self.plan().subscribes += count;
    }

    /// Hold every `fetch_page` response until [`MemoryStore::resume_fetches`];
    /// the items are read when the call is made
    pub fn pause_fetches(&self) {
        self.fetch_gate.send_replace(false);
    }

    pub fn resume_fetches(&self) {
        self.fetch_gate.send_replace(true);
    }

    /// Drop every open subscription, as a lost connection would
    pub fn disconnect_subscribers(&self) {
        warn!("MemoryStore disconnecting {} subscribers", self.changes.receiver_count());
        self.announce(StoreChange::Disconnect);
    }

    fn plan(&self) -> std::sync::MutexGuard<'_, FailurePlan> {
        self.failures.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn announce(&self, change: StoreChange) {
        // No receivers is fine: nobody is subscribed yet
        let _ = self.changes.send(change);
    }

    fn take_subscribe_failure(&self, what: &str) -> Result<()> {
        let mut plan = self.plan();
        if plan.subscribes > 0 {
            plan.subscribes -= 1;
            return Err(FeedError::SubscriptionDropped(format!("{} refused", what)));
        }
        Ok(())
    }

    fn top(items: &DashMap<ItemId, FeedItem>, scope: &FeedScope, limit: usize) -> Vec<FeedItem> {
        let mut selected: Vec<FeedItem> = items
            .iter()
            .filter(|entry| scope.includes(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        selected.sort_by(feed_order);
        selected.truncate(limit);
        selected
    }

    fn counters(items: &DashMap<ItemId, FeedItem>, id: &str) -> Option<ItemCounters> {
        items.get(id).map(|entry| entry.counters())
    }

    fn sorted_comments(comments: &DashMap<ItemId, Vec<Comment>>, id: &str) -> Vec<Comment> {
        let mut thread = comments.get(id).map(|c| c.clone()).unwrap_or_default();
        thread.sort_by(|a, b| a.display_cmp(b));
        thread
    }
}

/// Newest first; items without a usable timestamp sort as pending writes (on top)
fn feed_order(a: &FeedItem, b: &FeedItem) -> Ordering {
    match (a.ordering_key(), b.ordering_key()) {
        (Some(ka), Some(kb)) => kb.cmp(&ka),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => b.id.cmp(&a.id),
    }
}

struct SnapshotState<T> {
    updates: BroadcastStream<StoreChange>,
    pending: Option<T>,
    last: T,
    label: String,
    closed: bool,
}

/// Build a whole-snapshot stream: emits `initial`, then every distinct value
/// `recompute` yields for a relevant change.
fn snapshot_stream<T, F>(
    label: String,
    initial: T,
    rx: broadcast::Receiver<StoreChange>,
    recompute: F,
) -> SnapshotStream<T>
where
    T: Clone + PartialEq + Send + 'static,
    F: Fn(&StoreChange) -> Option<T> + Send + Sync + 'static,
{
    let recompute = Arc::new(recompute);
    let state = SnapshotState {
        updates: BroadcastStream::new(rx),
        pending: Some(initial.clone()),
        last: initial,
        label,
        closed: false,
    };

    stream::unfold(state, move |mut st| {
        let recompute = Arc::clone(&recompute);
        async move {
            if st.closed {
                return None;
            }
            if let Some(first) = st.pending.take() {
                return Some((Ok(first), st));
            }

            loop {
                let change = match st.updates.next().await {
                    Some(Ok(StoreChange::Disconnect)) => {
                        st.closed = true;
                        let err = FeedError::SubscriptionDropped(st.label.clone());
                        return Some((Err(err), st));
                    }
                    Some(Ok(change)) => change,
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        debug!("{} lagged by {} changes, resyncing", st.label, skipped);
                        StoreChange::Resync
                    }
                    None => return None,
                };

                if let Some(next) = recompute(&change) {
                    if next != st.last {
                        st.last = next.clone();
                        return Some((Ok(next), st));
                    }
                }
            }
        }
    })
    .boxed()
}

#[async_trait]
impl OrderedStore for MemoryStore {
    async fn subscribe_top(
        &self,
        scope: &FeedScope,
        limit: usize,
    ) -> Result<SnapshotStream<Vec<FeedItem>>> {
        self.take_subscribe_failure("top window subscription")?;

        let rx = self.changes.subscribe();
        let initial = Self::top(&self.items, scope, limit);
        let items = Arc::clone(&self.items);
        let scope = scope.clone();

        Ok(snapshot_stream(
            format!("top-{} window", limit),
            initial,
            rx,
            move |change| match change {
                StoreChange::Item(_) | StoreChange::Resync => {
                    Some(Self::top(&items, &scope, limit))
                }
                _ => None,
            },
        ))
    }

    async fn fetch_page(
        &self,
        scope: &FeedScope,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Vec<FeedItem>> {
        self.fetch_calls.fetch_add(1, AtomicOrdering::SeqCst);

        // Read now, deliver when the gate opens: a paused fetch is a response in flight
        let mut selected: Vec<FeedItem> = self
            .items
            .iter()
            .filter(|entry| scope.includes(entry.value()))
            .filter(|entry| match (cursor, entry.value().ordering_key()) {
                (None, _) => true,
                (Some(cursor), Some(key)) => cursor.admits(&key),
                (Some(_), None) => false,
            })
            .map(|entry| entry.value().clone())
            .collect();
        selected.sort_by(feed_order);
        selected.truncate(limit);

        let mut gate = self.fetch_gate.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(FeedError::transient("fetch_page", "store shut down"));
        }

        if let Some(err) = self.plan().fetches.pop_front() {
            return Err(err);
        }

        debug!(
            "fetch_page after {} returned {} items",
            cursor.map(|c| c.to_string()).unwrap_or_else(|| "start".into()),
            selected.len()
        );
        Ok(selected)
    }

    async fn get_item(&self, id: &str) -> Result<Option<FeedItem>> {
        Ok(self.item(id))
    }

    async fn subscribe_item(&self, id: &str) -> Result<SnapshotStream<ItemCounters>> {
        self.take_subscribe_failure("item subscription")?;

        let rx = self.changes.subscribe();
        let initial =
            Self::counters(&self.items, id).ok_or_else(|| FeedError::NotFound(id.to_string()))?;
        let items = Arc::clone(&self.items);
        let target = id.to_string();

        Ok(snapshot_stream(
            format!("item {}", id),
            initial,
            rx,
            move |change| match change {
                StoreChange::Item(changed) if *changed == target => Self::counters(&items, &target),
                StoreChange::Resync => Self::counters(&items, &target),
                _ => None,
            },
        ))
    }

    async fn subscribe_comments(&self, id: &str) -> Result<SnapshotStream<Vec<Comment>>> {
        self.take_subscribe_failure("comment subscription")?;

        if !self.items.contains_key(id) {
            return Err(FeedError::NotFound(id.to_string()));
        }

        let rx = self.changes.subscribe();
        let initial = Self::sorted_comments(&self.comments, id);
        let comments = Arc::clone(&self.comments);
        let target = id.to_string();

        Ok(snapshot_stream(
            format!("comments of {}", id),
            initial,
            rx,
            move |change| match change {
                StoreChange::Comments(changed) if *changed == target => {
                    Some(Self::sorted_comments(&comments, &target))
                }
                StoreChange::Resync => Some(Self::sorted_comments(&comments, &target)),
                _ => None,
            },
        ))
    }

    async fn mutate_like_set(&self, id: &str, user_id: &str, op: LikeOp) -> Result<()> {
        {
            let mut plan = self.plan();
            if plan.like_mutations > 0 {
                plan.like_mutations -= 1;
                return Err(FeedError::transient("mutate_like_set", "injected failure"));
            }
        }

        {
            let mut entry = self
                .items
                .get_mut(id)
                .ok_or_else(|| FeedError::NotFound(id.to_string()))?;
            match op {
                LikeOp::Add => entry.likes.insert(user_id.to_string()),
                LikeOp::Remove => entry.likes.remove(user_id),
            };
        }

        self.announce(StoreChange::Item(id.to_string()));
        Ok(())
    }

    async fn append_comment(&self, id: &str, text: &str, author: &Actor) -> Result<Comment> {
        if !self.items.contains_key(id) {
            return Err(FeedError::NotFound(id.to_string()));
        }

        let comment = Comment {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.to_string(),
            author_id: author.user_id.clone(),
            author_name: Some(author.display_label()),
            author_photo: author.photo_url.clone(),
            created_at: Some(Utc::now()),
        };

        self.comments
            .entry(id.to_string())
            .or_default()
            .push(comment.clone());
        self.announce(StoreChange::Comments(id.to_string()));
        Ok(comment)
    }

    async fn increment_comment_count(&self, id: &str, delta: i64) -> Result<()> {
        {
            let mut plan = self.plan();
            if plan.counter_increments > 0 {
                plan.counter_increments -= 1;
                return Err(FeedError::transient("increment_comment_count", "injected failure"));
            }
        }

        {
            let mut entry = self
                .items
                .get_mut(id)
                .ok_or_else(|| FeedError::NotFound(id.to_string()))?;
            entry.comment_count = entry.comment_count.saturating_add_signed(delta);
        }

        self.announce(StoreChange::Item(id.to_string()));
        Ok(())
    }

    async fn create_item(&self, item: NewItem) -> Result<FeedItem> {
        let created = FeedItem {
            id: uuid::Uuid::new_v4().to_string(),
            author_id: item.author_id,
            author_name: item.author_name,
            author_photo: item.author_photo,
            created_at: Some(Utc::now()),
            image_ref: item.image_ref,
            caption: item.caption,
            likes: Default::default(),
            comment_count: 0,
        };

        self.insert(created.clone());
        Ok(created)
    }
}
