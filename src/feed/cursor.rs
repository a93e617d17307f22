//! Cursor arithmetic for fetching older pages

use tracing::{debug, warn};

use crate::error::Result;
use crate::store::OrderedStore;
use crate::types::{Cursor, FeedItem, FeedScope, OrderingKey};

/// Result of one page fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub items: Vec<FeedItem>,
    /// Key of the last item returned; the request cursor if the page was empty
    pub new_cursor: Option<Cursor>,
    /// `false` once a page comes back short
    pub has_more: bool,
}

impl Page {
    /// Build a page from a raw store response to a request made at `cursor`
    pub fn from_response(mut items: Vec<FeedItem>, cursor: Option<&Cursor>, limit: usize) -> Self {
        if items.len() > limit {
            warn!("Store returned {} items for a page of {}, truncating", items.len(), limit);
            items.truncate(limit);
        }

        let has_more = limit > 0 && items.len() == limit;
        let new_cursor = advance(cursor, &items);

        Self {
            items,
            new_cursor,
            has_more,
        }
    }
}

/// Cursor after consuming `items`: the last item with a usable stored key
///
/// Never moves backwards: a candidate newer than `previous` is ignored.
pub fn advance(previous: Option<&Cursor>, items: &[FeedItem]) -> Option<Cursor> {
    let candidate = items
        .iter()
        .rev()
        .find_map(FeedItem::ordering_key)
        .map(Cursor::from);

    match (previous, candidate) {
        (Some(prev), Some(next)) if next >= *prev => {
            warn!("Ignoring non-decreasing cursor {} (previous {})", next, prev);
            Some(prev.clone())
        }
        (_, Some(next)) => Some(next),
        (prev, None) => prev.cloned(),
    }
}

/// `fetchPage(cursor | null, limit)`
pub async fn fetch_page(
    store: &dyn OrderedStore,
    scope: &FeedScope,
    cursor: Option<&Cursor>,
    limit: usize,
) -> Result<Page> {
    debug!(
        "Fetching page of {} after {}",
        limit,
        cursor.map(|c| c.to_string()).unwrap_or_else(|| "start".into())
    );
    let items = store.fetch_page(scope, cursor, limit).await?;
    Ok(Page::from_response(items, cursor, limit))
}

/// Pagination position and termination state for one feed
#[derive(Debug, Clone)]
pub struct PaginationCursor {
    current: Option<Cursor>,
    has_more: bool,
    pages: u64,
}

impl Default for PaginationCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl PaginationCursor {
    pub fn new() -> Self {
        Self {
            current: None,
            has_more: true,
            pages: 0,
        }
    }

    pub fn current(&self) -> Option<&Cursor> {
        self.current.as_ref()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Pages committed so far
    pub fn pages(&self) -> u64 {
        self.pages
    }

    /// Start paging after `key` unless a cursor already exists
    pub fn seed(&mut self, key: Option<OrderingKey>) {
        if self.current.is_none() {
            if let Some(key) = key {
                debug!("Seeding cursor from window boundary {}", key.id);
                self.current = Some(Cursor::from(key));
            }
        }
    }

    /// Record a fetched page
    pub fn commit(&mut self, page: &Page) {
        self.current = advance(self.current.as_ref(), &page.items);
        self.has_more = page.has_more;
        self.pages += 1;
    }
}
