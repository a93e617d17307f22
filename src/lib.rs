//! Feed Sync - live, paginated social feed engine
//!
//! Keeps a client's view of a post collection consistent while the
//! collection changes underneath it.
//!
//! # Architecture
//!
//! A feed is assembled from two sources over one [`OrderedStore`]:
//! - **Live window**: a push subscription to the newest K posts, replaced
//!   wholesale on every change
//! - **Tail**: older posts pulled page by page with an exclusive cursor as
//!   the viewer scrolls
//!
//! [`Feed`] merges both into a single sequence ordered by `(createdAt, id)`
//! descending with no duplicates. Likes and comment counts are tracked per
//! rendered item by [`ItemLiveOverlay`], so they update without reordering
//! the feed.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use feed_sync::{Feed, FeedConfig, FeedScope, MemoryStore};
//!
//! let store = Arc::new(MemoryStore::new());
//! let feed = Feed::open(store, FeedScope::Home, FeedConfig::from_env())?;
//!
//! // Sentinel scrolled into view
//! feed.on_sentinel(true).await?;
//! for item in feed.view().items {
//!     println!("{} by {}", item.id, item.author_id);
//! }
//! ```

// Error types
pub mod error;

// Configuration
pub mod config;

// Domain types and ordering
pub mod types;

// Backing store contract and the in-memory implementation
pub mod store;

// Window, pagination and merge
pub mod feed;

// Per-item live counters and mutations
pub mod overlay;

// Post creation
pub mod compose;

// Re-export error types
pub use error::{FeedError, Result};

pub use config::FeedConfig;

pub use types::{
    Actor, Comment, Cursor, FeedItem, FeedScope, ItemCounters, ItemId, OrderingKey, UserId,
};

pub use store::{LikeOp, MemoryStore, NewItem, OrderedStore, SnapshotStream};

pub use feed::{Feed, FeedView, FetchOutcome, SkipReason};

pub use overlay::{AddedComment, ItemLiveOverlay, OverlayHandle};

pub use compose::{publish_post, PostDraft};
