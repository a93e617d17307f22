//! Feed data model
//!
//! Items are ordered newest first by their [`OrderingKey`]. The natural
//! `Ord` on the key is ascending (older < newer), so a feed is a sequence of
//! strictly decreasing keys.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub type ItemId = String;
pub type UserId = String;

/// The `(createdAt, id)` pair defining the feed's total order
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderingKey {
    pub created_at: DateTime<Utc>,
    pub id: ItemId,
}

impl OrderingKey {
    pub fn new(created_at: DateTime<Utc>, id: impl Into<ItemId>) -> Self {
        Self {
            created_at,
            id: id.into(),
        }
    }
}

/// Exclusive bookmark for the next page: the key of the last item consumed
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cursor(OrderingKey);

impl Cursor {
    pub fn key(&self) -> &OrderingKey {
        &self.0
    }

    /// Whether `key` lies strictly past this cursor (older in feed order)
    pub fn admits(&self, key: &OrderingKey) -> bool {
        key < &self.0
    }
}

impl From<OrderingKey> for Cursor {
    fn from(key: OrderingKey) -> Self {
        Cursor(key)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.0.id, self.0.created_at.timestamp_millis())
    }
}

/// A post in the feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedItem {
    pub id: ItemId,
    pub author_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_photo: Option<String>,
    /// `None` when the store returned a value that is not a timestamp
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    pub image_ref: String,
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub likes: BTreeSet<UserId>,
    #[serde(default)]
    pub comment_count: u64,
}

impl FeedItem {
    /// Stored ordering key, if the stored `createdAt` is usable
    pub fn ordering_key(&self) -> Option<OrderingKey> {
        self.created_at.map(|ts| OrderingKey::new(ts, self.id.clone()))
    }

    pub fn counters(&self) -> ItemCounters {
        ItemCounters {
            likes: self.likes.clone(),
            comment_count: self.comment_count,
        }
    }

    pub fn apply_counters(&mut self, counters: &ItemCounters) {
        self.likes = counters.likes.clone();
        self.comment_count = counters.comment_count;
    }

    pub fn is_liked_by(&self, user_id: &str) -> bool {
        self.likes.contains(user_id)
    }
}

/// The independently-mutating fields of an item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemCounters {
    #[serde(default)]
    pub likes: BTreeSet<UserId>,
    #[serde(default)]
    pub comment_count: u64,
}

impl ItemCounters {
    pub fn like_count(&self) -> usize {
        self.likes.len()
    }
}

/// A comment on an item; append-only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub text: String,
    pub author_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_photo: Option<String>,
    /// `None` while the server timestamp is pending
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Comment {
    /// Display order: oldest first, pending timestamps last, id tie-break
    pub fn display_cmp(&self, other: &Comment) -> Ordering {
        match (self.created_at, other.created_at) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.id.cmp(&other.id)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.id.cmp(&other.id),
        }
    }
}

/// The authenticated user performing a mutation
///
/// Passed explicitly into every write instead of being read from session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub user_id: UserId,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, rename = "photoURL")]
    pub photo_url: Option<String>,
}

impl Actor {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
            email: None,
            photo_url: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_photo_url(mut self, url: impl Into<String>) -> Self {
        self.photo_url = Some(url.into());
        self
    }

    /// Name shown next to the actor's posts and comments
    pub fn display_label(&self) -> String {
        if let Some(name) = self.display_name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.to_string();
        }
        if let Some(local) = self
            .email
            .as_deref()
            .and_then(|e| e.split('@').next())
            .filter(|l| !l.is_empty())
        {
            return local.to_string();
        }
        "Anonymous".to_string()
    }
}

/// Which slice of the post collection a feed shows
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "userId", rename_all = "lowercase")]
pub enum FeedScope {
    /// Every post
    #[default]
    Home,
    /// Posts by a single author
    Author(UserId),
}

impl FeedScope {
    pub fn includes(&self, item: &FeedItem) -> bool {
        match self {
            FeedScope::Home => true,
            FeedScope::Author(author) => item.author_id == *author,
        }
    }
}

/// Accepts RFC 3339 strings, epoch milliseconds and `{seconds, nanoseconds}`
/// objects; anything else (including null) becomes `None`.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(parse_timestamp(&value))
}

pub(crate) fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        serde_json::Value::Object(map) => {
            let seconds = map.get("seconds")?.as_i64()?;
            let nanos = map
                .get("nanoseconds")
                .and_then(|n| n.as_u64())
                .unwrap_or(0);
            Utc.timestamp_opt(seconds, u32::try_from(nanos).ok()?).single()
        }
        _ => None,
    }
}
