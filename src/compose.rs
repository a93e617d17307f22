//! Publishing new posts
//!
//! Media upload happens elsewhere; a draft carries the reference to an
//! already uploaded image. The store assigns the id and `createdAt`, so a new
//! post reaches every open feed through its live window like any other write.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FeedError, Result};
use crate::store::{NewItem, OrderedStore};
use crate::types::{Actor, FeedItem};

/// A post ready to be published
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostDraft {
    /// Reference to the uploaded image
    pub image_ref: String,
    #[serde(default)]
    pub caption: String,
}

impl PostDraft {
    pub fn new(image_ref: impl Into<String>) -> Self {
        Self {
            image_ref: image_ref.into(),
            caption: String::new(),
        }
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = caption.into();
        self
    }
}

/// Create a post authored by `actor`
pub async fn publish_post(
    store: &dyn OrderedStore,
    actor: &Actor,
    draft: PostDraft,
) -> Result<FeedItem> {
    let image_ref = draft.image_ref.trim();
    if image_ref.is_empty() {
        return Err(FeedError::InvalidInput("a post needs an image".into()));
    }

    let item = store
        .create_item(NewItem {
            author_id: actor.user_id.clone(),
            author_name: Some(actor.display_label()),
            author_photo: actor.photo_url.clone(),
            image_ref: image_ref.to_string(),
            caption: draft.caption.trim().to_string(),
        })
        .await?;

    info!("Published post {} by {}", item.id, item.author_id);
    Ok(item)
}
