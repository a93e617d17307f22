//! End-to-end feed behavior against the in-memory store

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::StreamExt;
use tokio::time::{sleep, timeout};

use feed_sync::{
    Actor, Feed, FeedConfig, FeedError, FeedItem, FeedScope, FeedView, FetchOutcome,
    ItemLiveOverlay, MemoryStore, SkipReason,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn post(id: &str, author: &str, ms: i64) -> FeedItem {
    FeedItem {
        id: id.to_string(),
        author_id: author.to_string(),
        author_name: Some(author.to_string()),
        author_photo: None,
        created_at: Utc.timestamp_millis_opt(ms).single(),
        image_ref: format!("https://img/{}.jpg", id),
        caption: String::new(),
        likes: Default::default(),
        comment_count: 0,
    }
}

fn config(window: usize, page: usize) -> FeedConfig {
    FeedConfig {
        window_size: window,
        page_size: page,
        resubscribe_delay_ms: 10,
        max_resubscribe_attempts: 0,
    }
}

async fn settle<F>(feed: &Feed, predicate: F) -> FeedView
where
    F: FnMut(&FeedView) -> bool,
{
    timeout(Duration::from_secs(5), feed.wait_for(predicate))
        .await
        .expect("feed view never settled")
        .expect("feed closed while waiting")
}

fn assert_strictly_descending(view: &FeedView) {
    let keys: Vec<_> = view
        .items
        .iter()
        .map(|i| i.ordering_key().expect("well-formed item"))
        .collect();
    for pair in keys.windows(2) {
        assert!(pair[0] > pair[1], "{:?} is not after {:?}", pair[0], pair[1]);
    }
}

fn assert_unique(view: &FeedView) {
    let ids: HashSet<_> = view.ids().into_iter().collect();
    assert_eq!(ids.len(), view.items.len(), "duplicate ids in {:?}", view.ids());
}

#[tokio::test]
async fn test_scrolls_to_the_end_without_gaps_or_duplicates() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    store.insert_many((1..=30).map(|n| post(&format!("p{:02}", n), "alice", n)));

    let feed = Feed::open(store.clone(), FeedScope::Home, config(5, 5)).unwrap();
    let view = settle(&feed, |v| v.window_generation >= 1).await;
    assert_eq!(view.ids(), vec!["p30", "p29", "p28", "p27", "p26"]);

    let mut pages = 0;
    loop {
        match feed.fetch_more().await.unwrap() {
            FetchOutcome::Loaded { has_more, duplicates, .. } => {
                assert_eq!(duplicates, 0);
                pages += 1;
                if !has_more {
                    break;
                }
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    // Five full pages, then an empty one ends pagination
    assert_eq!(pages, 6);
    assert_eq!(
        feed.fetch_more().await.unwrap(),
        FetchOutcome::Skipped(SkipReason::Exhausted)
    );

    let view = feed.view();
    assert_eq!(view.items.len(), 30);
    assert!(!view.has_more);
    assert_unique(&view);
    assert_strictly_descending(&view);
}

#[tokio::test]
async fn test_item_pushed_out_of_window_moves_into_tail() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    store.insert_many((1..=6).map(|n| post(&format!("a{}", n), "alice", n)));

    let feed = Feed::open(store.clone(), FeedScope::Home, config(3, 3)).unwrap();
    settle(&feed, |v| v.window_generation >= 1).await;
    feed.fetch_more().await.unwrap();
    assert_eq!(feed.view().ids(), vec!["a6", "a5", "a4", "a3", "a2", "a1"]);

    store.insert(post("a7", "bob", 7));
    let view = settle(&feed, |v| v.ids().first() == Some(&"a7")).await;

    assert_eq!(view.ids(), vec!["a7", "a6", "a5", "a4", "a3", "a2", "a1"]);
    assert_eq!(view.window_len, 3);
    assert_unique(&view);
    assert_strictly_descending(&view);
}

#[tokio::test]
async fn test_sentinel_while_loading_is_dropped() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    store.insert_many((1..=10).map(|n| post(&format!("p{:02}", n), "alice", n)));

    let feed = Feed::open(store.clone(), FeedScope::Home, config(3, 3)).unwrap();
    settle(&feed, |v| v.window_generation >= 1).await;

    store.pause_fetches();
    let background = feed.clone();
    let first = tokio::spawn(async move { background.fetch_more().await });

    settle(&feed, |v| v.loading_more).await;
    assert_eq!(
        feed.on_sentinel(true).await.unwrap(),
        FetchOutcome::Skipped(SkipReason::InFlight)
    );
    assert_eq!(
        feed.on_sentinel(false).await.unwrap(),
        FetchOutcome::Skipped(SkipReason::Hidden)
    );

    store.resume_fetches();
    let outcome = first.await.unwrap().unwrap();
    assert!(matches!(outcome, FetchOutcome::Loaded { appended: 3, .. }));
    assert_eq!(store.fetch_count(), 1);
    assert!(!feed.loading_more());
}

async fn wait_for_fetch_call(store: &MemoryStore, calls: usize) {
    timeout(Duration::from_secs(5), async {
        while store.fetch_count() < calls {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("fetch never reached the store");
}

#[tokio::test]
async fn test_page_in_flight_while_window_moves() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    store.insert_many((1..=10).map(|n| post(&format!("p{:02}", n), "alice", n)));

    let feed = Feed::open(store.clone(), FeedScope::Home, config(3, 3)).unwrap();
    settle(&feed, |v| v.window_generation >= 1).await;

    // The page after p08 is read as [p07, p06, p05] and held
    store.pause_fetches();
    let background = feed.clone();
    let pending = tokio::spawn(async move { background.fetch_more().await });
    wait_for_fetch_call(&store, 1).await;

    store.remove("p09");
    settle(&feed, |v| v.ids() == vec!["p10", "p08", "p07"]).await;
    store.remove("p07");
    settle(&feed, |v| v.ids() == vec!["p10", "p08", "p06"]).await;
    store.insert(post("p11", "bob", 11));
    settle(&feed, |v| v.ids() == vec!["p11", "p10", "p08", "p06"]).await;

    store.resume_fetches();
    let outcome = pending.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        FetchOutcome::Loaded {
            appended: 1,
            duplicates: 1,
            stale: 1,
            has_more: true
        }
    );

    let view = feed.view();
    assert_eq!(view.ids(), vec!["p11", "p10", "p08", "p06", "p05"]);
    assert_unique(&view);
    assert_strictly_descending(&view);
}

#[tokio::test]
async fn test_failed_fetch_keeps_cursor_and_allows_retry() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    store.insert_many((1..=8).map(|n| post(&format!("p{}", n), "alice", n)));

    let feed = Feed::open(store.clone(), FeedScope::Home, config(3, 3)).unwrap();
    settle(&feed, |v| v.window_generation >= 1).await;

    store.fail_next_fetch(FeedError::transient("fetch_page", "timeout"));
    let err = feed.fetch_more().await.unwrap_err();
    assert!(err.is_retryable());

    let view = feed.view();
    assert_eq!(view.last_error, Some(err));
    assert!(!view.loading_more);
    assert!(view.has_more);
    assert_eq!(view.items.len(), 3);
    let cursor_after_failure = view.cursor.clone();

    let outcome = feed.fetch_more().await.unwrap();
    assert!(matches!(outcome, FetchOutcome::Loaded { appended: 3, .. }));

    let view = feed.view();
    assert!(view.last_error.is_none());
    assert_eq!(view.ids(), vec!["p8", "p7", "p6", "p5", "p4", "p3"]);
    assert!(view.cursor.unwrap().key() < cursor_after_failure.unwrap().key());
}

#[tokio::test]
async fn test_dropped_window_goes_stale_then_recovers() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    store.insert_many((1..=4).map(|n| post(&format!("p{}", n), "alice", n)));

    let cfg = FeedConfig {
        resubscribe_delay_ms: 300,
        ..config(3, 3)
    };
    let feed = Feed::open(store.clone(), FeedScope::Home, cfg).unwrap();
    let before = settle(&feed, |v| v.window_generation >= 1).await;

    store.disconnect_subscribers();
    let stale = settle(&feed, |v| v.stale).await;
    assert_eq!(stale.ids(), before.ids(), "stale window keeps last items");

    let recovered = settle(&feed, |v| !v.stale).await;
    assert_eq!(recovered.ids(), before.ids());
    assert!(recovered.window_generation >= 2);
}

#[tokio::test]
async fn test_closed_feed_stops_updating() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    store.insert_many((1..=4).map(|n| post(&format!("p{}", n), "alice", n)));

    let feed = Feed::open(store.clone(), FeedScope::Home, config(3, 3)).unwrap();
    let before = settle(&feed, |v| v.window_generation >= 1).await;

    feed.close();
    assert!(feed.is_closed());
    store.insert(post("p9", "bob", 9));
    sleep(Duration::from_millis(50)).await;

    assert_eq!(feed.view(), before);
    assert_eq!(feed.fetch_more().await, Err(FeedError::Closed));
}

#[tokio::test]
async fn test_item_without_timestamp_is_flagged_not_fatal() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    store.insert_many((1..=5).map(|n| post(&format!("p{}", n), "alice", n)));
    let mut broken = post("broken", "bob", 0);
    broken.created_at = None;
    store.insert(broken);

    let feed = Feed::open(store.clone(), FeedScope::Home, config(3, 3)).unwrap();
    let view = settle(&feed, |v| v.window_generation >= 1).await;
    assert_eq!(view.degraded, vec!["broken".to_string()]);
    assert!(view.ids().contains(&"broken"));

    while feed.has_more() {
        feed.fetch_more().await.unwrap();
    }

    let view = feed.view();
    assert_eq!(view.items.len(), 6);
    assert_unique(&view);
}

#[tokio::test]
async fn test_author_feed_only_shows_that_author() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    store.insert_many(vec![
        post("a1", "alice", 1),
        post("b2", "bob", 2),
        post("a3", "alice", 3),
        post("b4", "bob", 4),
        post("a5", "alice", 5),
    ]);

    let scope = FeedScope::Author("alice".into());
    let feed = Feed::open(store.clone(), scope, config(2, 2)).unwrap();
    settle(&feed, |v| v.window_generation >= 1).await;

    let outcome = feed.fetch_more().await.unwrap();
    assert_eq!(
        outcome,
        FetchOutcome::Loaded {
            appended: 1,
            duplicates: 0,
            stale: 0,
            has_more: false
        }
    );
    assert_eq!(feed.view().ids(), vec!["a5", "a3", "a1"]);
}

#[tokio::test]
async fn test_lookup_falls_back_to_store() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    store.insert_many((1..=5).map(|n| post(&format!("p{}", n), "alice", n)));

    let feed = Feed::open(store.clone(), FeedScope::Home, config(2, 2)).unwrap();
    settle(&feed, |v| v.window_generation >= 1).await;

    assert_eq!(feed.lookup("p5").await.unwrap().id, "p5");
    assert_eq!(feed.lookup("p1").await.unwrap().id, "p1");
    assert_eq!(
        feed.lookup("missing").await,
        Err(FeedError::NotFound("missing".into()))
    );
}

#[tokio::test]
async fn test_like_on_tail_item_updates_in_place() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    store.insert_many((1..=6).map(|n| post(&format!("x{}", n), "alice", n)));

    let feed = Feed::open(store.clone(), FeedScope::Home, config(3, 3)).unwrap();
    settle(&feed, |v| v.window_generation >= 1).await;
    feed.fetch_more().await.unwrap();
    let before = feed.view();
    assert_eq!(before.ids(), vec!["x6", "x5", "x4", "x3", "x2", "x1"]);
    let fetches = store.fetch_count();

    let overlay = ItemLiveOverlay::new(store.clone(), feed.config());
    let mut handle = overlay.subscribe("x2").await.unwrap();
    let actor = Actor::new("u1");

    overlay.toggle_like("x2", &actor).await.unwrap();
    let counters = timeout(Duration::from_secs(5), handle.wait_for(|c| c.like_count() == 1))
        .await
        .unwrap()
        .unwrap();
    assert!(feed.apply_counters("x2", &counters).await);

    // Neither the window nor the tail is reloaded
    let view = feed.view();
    assert_eq!(view.ids(), before.ids());
    assert_eq!(view.window_len, 3);
    assert!(view.items[4].is_liked_by("u1"));
    assert_eq!(view.items[4].id, "x2");
    assert_eq!(store.fetch_count(), fetches);

    overlay.toggle_like("x2", &actor).await.unwrap();
    let counters = timeout(Duration::from_secs(5), handle.wait_for(|c| c.like_count() == 0))
        .await
        .unwrap()
        .unwrap();
    assert!(counters.likes.is_empty());
    assert!(feed.apply_counters("x2", &counters).await);
    assert!(!feed.view().items[4].is_liked_by("u1"));
    assert_eq!(store.fetch_count(), fetches);
}

#[tokio::test]
async fn test_comment_reaches_thread_and_counter() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    store.insert(post("x1", "alice", 1));

    let overlay = ItemLiveOverlay::new(store.clone(), &config(3, 3));
    let mut handle = overlay.subscribe("x1").await.unwrap();
    let actor = Actor::new("u2").with_display_name("Bea");

    let added = overlay.add_comment("x1", " nice shot ", &actor).await.unwrap();
    assert!(added.count_updated);
    assert_eq!(added.comment.text, "nice shot");
    assert_eq!(added.comment.author_name.as_deref(), Some("Bea"));

    let counters = timeout(Duration::from_secs(5), handle.wait_for(|c| c.comment_count == 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(counters.comment_count, 1);

    let mut thread = overlay.comments("x1").await.unwrap();
    let comments = thread.next().await.unwrap().unwrap();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].id, added.comment.id);
}
