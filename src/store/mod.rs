//! Backing store contract
//!
//! The feed engine never talks to a database directly. Everything it needs
//! from the backing store is expressed by [`OrderedStore`]: ordered live
//! subscriptions, exclusive-cursor page reads and field-level mutations.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Actor, Comment, Cursor, FeedItem, FeedScope, ItemCounters, UserId};

/// A long-lived push source of whole snapshots
///
/// An `Err` item or the end of the stream both mean the subscription dropped;
/// the consumer decides whether to resubscribe.
pub type SnapshotStream<T> = BoxStream<'static, Result<T>>;

/// Set-membership mutation on an item's like-set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LikeOp {
    Add,
    Remove,
}

impl LikeOp {
    /// The operation that flips the current membership
    pub fn toggle(currently_member: bool) -> Self {
        if currently_member {
            LikeOp::Remove
        } else {
            LikeOp::Add
        }
    }
}

/// A post to be created; the store assigns `id` and `createdAt`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewItem {
    pub author_id: UserId,
    pub author_name: Option<String>,
    pub author_photo: Option<String>,
    pub image_ref: String,
    pub caption: String,
}

/// Abstract backing store for the feed
///
/// Every ordered read uses `(createdAt desc, id desc)`; items whose stored
/// `createdAt` is unusable may appear anywhere and are normalized by the
/// merger.
#[async_trait]
pub trait OrderedStore: Send + Sync + 'static {
    /// Live top-`limit` window; emits on open and on every change to that range
    async fn subscribe_top(&self, scope: &FeedScope, limit: usize)
        -> Result<SnapshotStream<Vec<FeedItem>>>;

    /// Up to `limit` items strictly older than `cursor` (or the newest when `None`)
    async fn fetch_page(
        &self,
        scope: &FeedScope,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Vec<FeedItem>>;

    /// Single item lookup
    async fn get_item(&self, id: &str) -> Result<Option<FeedItem>>;

    /// Live counters for one item
    async fn subscribe_item(&self, id: &str) -> Result<SnapshotStream<ItemCounters>>;

    /// Live comment thread for one item
    async fn subscribe_comments(&self, id: &str) -> Result<SnapshotStream<Vec<Comment>>>;

    /// Atomic set operation on the like-set; never a read-modify-write
    async fn mutate_like_set(&self, id: &str, user_id: &str, op: LikeOp) -> Result<()>;

    /// Append a comment; the store assigns the ordering timestamp
    async fn append_comment(&self, id: &str, text: &str, author: &Actor) -> Result<Comment>;

    /// Adjust the denormalized comment counter
    async fn increment_comment_count(&self, id: &str, delta: i64) -> Result<()>;

    /// Create a post with a server-assigned id and timestamp
    async fn create_item(&self, item: NewItem) -> Result<FeedItem>;
}
