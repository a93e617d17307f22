//! Reconciles the live window and paginated pages into one sequence
//!
//! The merged sequence is always `window ++ tail`. Both runs arrive already
//! sorted newest first, so the merger never sorts globally: it only
//! subtracts ids at the seam and, when the window boundary moves, merges the
//! items that fell out of the window into the head of the tail.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::types::{FeedItem, ItemCounters, ItemId, OrderingKey};

/// An item in the merged sequence together with the key it is sorted by
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedEntry {
    pub item: FeedItem,
    /// Stored key, or the arrival-time substitute when `degraded`
    pub key: OrderingKey,
    /// The stored `createdAt` was unusable
    pub degraded: bool,
}

/// What a window snapshot did to the merged sequence
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowMerge {
    /// Ids that left the window and were kept at the head of the tail
    pub demoted: Vec<ItemId>,
    /// Ids that left the window without an older position to fall back to
    pub dropped: Vec<ItemId>,
    /// Ids removed from the tail because the window now owns them
    pub claimed_from_tail: Vec<ItemId>,
    /// Tail ids ranked above the window's last item yet absent from it;
    /// the window is the top of the store, so these no longer exist
    pub pruned: Vec<ItemId>,
}

/// What a page did to the merged sequence
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageMerge {
    pub appended: usize,
    /// Items skipped because their id was already in the window or tail
    pub duplicates: usize,
    /// Items skipped because they sort above the end of the merged sequence
    /// without being part of it; the page was read before they were removed
    pub stale: usize,
}

type Clock = fn() -> DateTime<Utc>;

/// Owns the merged sequence of one feed view
#[derive(Debug)]
pub struct FeedMerger {
    window_limit: usize,
    window: Vec<MergedEntry>,
    tail: Vec<MergedEntry>,
    window_ids: HashSet<ItemId>,
    tail_ids: HashSet<ItemId>,
    /// Arrival times handed out to malformed items, kept stable across snapshots
    substitutes: HashMap<ItemId, DateTime<Utc>>,
    clock: Clock,
}

impl FeedMerger {
    /// Create a merger for a window of at most `window_limit` items
    pub fn new(window_limit: usize) -> Self {
        Self::with_clock(window_limit, Utc::now)
    }

    pub fn with_clock(window_limit: usize, clock: Clock) -> Self {
        Self {
            window_limit,
            window: Vec::new(),
            tail: Vec::new(),
            window_ids: HashSet::new(),
            tail_ids: HashSet::new(),
            substitutes: HashMap::new(),
            clock,
        }
    }

    /// Replace the window with a new live snapshot
    pub fn apply_window(&mut self, snapshot: Vec<FeedItem>) -> WindowMerge {
        let mut merge = WindowMerge::default();

        let mut new_window = Vec::with_capacity(snapshot.len());
        let mut new_ids = HashSet::with_capacity(snapshot.len());
        for item in snapshot {
            if !new_ids.insert(item.id.clone()) {
                warn!(item_id = %item.id, "Duplicate id inside window snapshot, keeping first");
                continue;
            }
            new_window.push(self.normalize(item));
        }

        // A full window means older items may still exist below its boundary;
        // a short one means everything that exists is already in it.
        let boundary = if new_window.len() >= self.window_limit {
            new_window.last().map(|e| e.key.clone())
        } else {
            None
        };

        let old_window = std::mem::take(&mut self.window);
        let mut demoted = Vec::new();
        for entry in old_window {
            if new_ids.contains(&entry.item.id) {
                continue;
            }
            match &boundary {
                Some(edge) if entry.key < *edge => {
                    merge.demoted.push(entry.item.id.clone());
                    demoted.push(entry);
                }
                _ => merge.dropped.push(entry.item.id.clone()),
            }
        }

        let floor = new_window.last().map(|e| e.key.clone());
        let tail = std::mem::take(&mut self.tail);
        let mut kept_tail = Vec::with_capacity(tail.len());
        for entry in tail {
            if new_ids.contains(&entry.item.id) {
                merge.claimed_from_tail.push(entry.item.id.clone());
            } else if floor.as_ref().is_some_and(|f| entry.key > *f) {
                merge.pruned.push(entry.item.id.clone());
            } else {
                kept_tail.push(entry);
            }
        }

        self.tail = merge_runs(demoted, kept_tail);
        self.tail_ids = self.tail.iter().map(|e| e.item.id.clone()).collect();
        self.window = new_window;
        self.window_ids = new_ids;

        for id in merge.dropped.iter().chain(&merge.pruned) {
            self.substitutes.remove(id);
        }

        if !merge.demoted.is_empty()
            || !merge.claimed_from_tail.is_empty()
            || !merge.pruned.is_empty()
        {
            debug!(
                "Window moved: {} demoted, {} claimed from tail, {} dropped, {} pruned",
                merge.demoted.len(),
                merge.claimed_from_tail.len(),
                merge.dropped.len(),
                merge.pruned.len()
            );
        }

        merge
    }

    /// Append a fetched page after removing ids already present
    ///
    /// Everything still alive above the end of the merged sequence is already
    /// in it, so an unknown item sorting there was removed after the page was
    /// read and is skipped.
    pub fn append_page(&mut self, items: Vec<FeedItem>) -> PageMerge {
        let mut merge = PageMerge::default();

        for item in items {
            if self.window_ids.contains(&item.id) || self.tail_ids.contains(&item.id) {
                merge.duplicates += 1;
                continue;
            }
            if let (Some(key), Some(floor)) = (item.ordering_key(), self.sequence_floor()) {
                if key >= *floor {
                    debug!(item_id = %item.id, "Skipping page item removed since the read");
                    merge.stale += 1;
                    continue;
                }
            }
            self.tail_ids.insert(item.id.clone());
            let entry = self.normalize(item);
            self.tail.push(entry);
            merge.appended += 1;
        }

        if merge.duplicates > 0 || merge.stale > 0 {
            debug!(
                "Page overlapped merged sequence by {} items, {} stale",
                merge.duplicates, merge.stale
            );
        }

        merge
    }

    /// Key of the last well-formed entry of `window ++ tail`
    fn sequence_floor(&self) -> Option<&OrderingKey> {
        self.tail
            .iter()
            .rev()
            .chain(self.window.iter().rev())
            .find(|e| !e.degraded)
            .map(|e| &e.key)
    }

    /// Overwrite the live fields of an item without moving it
    pub fn apply_counters(&mut self, id: &str, counters: &ItemCounters) -> bool {
        match self
            .window
            .iter_mut()
            .chain(self.tail.iter_mut())
            .find(|e| e.item.id == id)
        {
            Some(entry) => {
                entry.item.apply_counters(counters);
                true
            }
            None => false,
        }
    }

    /// The merged sequence, `window ++ tail`
    pub fn entries(&self) -> impl Iterator<Item = &MergedEntry> {
        self.window.iter().chain(self.tail.iter())
    }

    pub fn items(&self) -> Vec<FeedItem> {
        self.entries().map(|e| e.item.clone()).collect()
    }

    pub fn ids(&self) -> Vec<ItemId> {
        self.entries().map(|e| e.item.id.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&FeedItem> {
        self.entries().map(|e| &e.item).find(|item| item.id == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.entries().position(|e| e.item.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.window_ids.contains(id) || self.tail_ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.window.len() + self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn tail_len(&self) -> usize {
        self.tail.len()
    }

    /// Ids whose sort key was substituted
    pub fn degraded_ids(&self) -> Vec<ItemId> {
        self.entries()
            .filter(|e| e.degraded)
            .map(|e| e.item.id.clone())
            .collect()
    }

    /// Oldest stored key in the window, where the first page starts
    pub fn window_boundary(&self) -> Option<OrderingKey> {
        self.window
            .iter()
            .rev()
            .find(|e| !e.degraded)
            .map(|e| e.key.clone())
    }

    fn normalize(&mut self, item: FeedItem) -> MergedEntry {
        match item.ordering_key() {
            Some(key) => {
                self.substitutes.remove(&item.id);
                MergedEntry {
                    item,
                    key,
                    degraded: false,
                }
            }
            None => {
                let clock = self.clock;
                let arrived = *self
                    .substitutes
                    .entry(item.id.clone())
                    .or_insert_with(clock);
                warn!(
                    item_id = %item.id,
                    "Item has no usable createdAt, sorting by arrival time {}",
                    arrived
                );
                MergedEntry {
                    key: OrderingKey::new(arrived, item.id.clone()),
                    item,
                    degraded: true,
                }
            }
        }
    }
}

/// Merge two newest-first runs into one, keeping the first occurrence of an id
fn merge_runs(left: Vec<MergedEntry>, right: Vec<MergedEntry>) -> Vec<MergedEntry> {
    if left.is_empty() {
        return right;
    }
    if right.is_empty() {
        return left;
    }

    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut seen = HashSet::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();

    loop {
        let take_left = match (left.peek(), right.peek()) {
            (Some(l), Some(r)) => l.key >= r.key,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        let next = if take_left { left.next() } else { right.next() };
        if let Some(entry) = next {
            if seen.insert(entry.item.id.clone()) {
                merged.push(entry);
            }
        }
    }

    merged
}
