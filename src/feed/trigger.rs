//! Scroll-driven page requests
//!
//! Level-triggered: every observation of a visible sentinel asks for a page.
//! At most one fetch is in flight; observations made while one is running are
//! dropped, not queued, and the next observation after it completes fires again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct TriggerState {
    loading_more: AtomicBool,
    has_more: AtomicBool,
}

/// Outcome of observing the sentinel
#[derive(Debug)]
pub enum TriggerDecision {
    /// Issue a fetch; the ticket must be completed or dropped
    Fire(FetchTicket),
    /// A fetch is already running; this observation is dropped
    InFlight,
    /// The last page came back short
    Exhausted,
    /// The sentinel is not visible
    Hidden,
}

/// Serializes page fetches for one feed
#[derive(Debug, Clone)]
pub struct ScrollTrigger {
    state: Arc<TriggerState>,
}

impl Default for ScrollTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl ScrollTrigger {
    pub fn new() -> Self {
        Self {
            state: Arc::new(TriggerState {
                loading_more: AtomicBool::new(false),
                has_more: AtomicBool::new(true),
            }),
        }
    }

    /// Observe the sentinel position
    pub fn observe(&self, sentinel_visible: bool) -> TriggerDecision {
        if !sentinel_visible {
            return TriggerDecision::Hidden;
        }
        if !self.state.has_more.load(Ordering::SeqCst) {
            return TriggerDecision::Exhausted;
        }
        match self.state.loading_more.compare_exchange(
            false,
            true,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => TriggerDecision::Fire(FetchTicket {
                state: Arc::clone(&self.state),
                completed: false,
            }),
            Err(_) => TriggerDecision::InFlight,
        }
    }

    pub fn loading_more(&self) -> bool {
        self.state.loading_more.load(Ordering::SeqCst)
    }

    pub fn has_more(&self) -> bool {
        self.state.has_more.load(Ordering::SeqCst)
    }
}

/// Proof that the caller owns the single in-flight fetch
///
/// Dropping an uncompleted ticket (the fetch failed) clears `loading_more`
/// and leaves `has_more` untouched so the next observation retries.
#[derive(Debug)]
pub struct FetchTicket {
    state: Arc<TriggerState>,
    completed: bool,
}

impl FetchTicket {
    /// Finish the fetch with the page's termination flag
    pub fn complete(mut self, has_more: bool) {
        self.state.has_more.store(has_more, Ordering::SeqCst);
        self.state.loading_more.store(false, Ordering::SeqCst);
        self.completed = true;
    }
}

impl Drop for FetchTicket {
    fn drop(&mut self) {
        if !self.completed {
            self.state.loading_more.store(false, Ordering::SeqCst);
        }
    }
}
