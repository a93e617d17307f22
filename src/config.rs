//! Feed configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FeedError, Result};

/// Configuration for a single feed view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Size of the live-subscribed window (K)
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Items requested per page fetch (M)
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Delay before resubscribing after a dropped live subscription
    #[serde(default = "default_resubscribe_delay")]
    pub resubscribe_delay_ms: u64,

    /// Resubscribe attempts allowed after a drop before giving up (0 = infinite);
    /// a delivered snapshot resets the count
    #[serde(default)]
    pub max_resubscribe_attempts: u32,
}

fn default_window_size() -> usize {
    20
}

fn default_page_size() -> usize {
    20
}

fn default_resubscribe_delay() -> u64 {
    2000
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            page_size: default_page_size(),
            resubscribe_delay_ms: default_resubscribe_delay(),
            max_resubscribe_attempts: 0,
        }
    }
}

impl FeedConfig {
    /// Configuration for a phone-sized home feed (small window, short pages)
    pub fn for_mobile() -> Self {
        Self {
            window_size: 10,
            page_size: 10,
            ..Default::default()
        }
    }

    /// Configuration for an author's post grid (rows of three)
    pub fn for_profile_grid() -> Self {
        Self {
            window_size: 12,
            page_size: 24,
            ..Default::default()
        }
    }

    /// Create config from environment, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            window_size: env_or("FEED_WINDOW_SIZE", defaults.window_size),
            page_size: env_or("FEED_PAGE_SIZE", defaults.page_size),
            resubscribe_delay_ms: env_or(
                "FEED_RESUBSCRIBE_DELAY_MS",
                defaults.resubscribe_delay_ms,
            ),
            max_resubscribe_attempts: env_or(
                "FEED_MAX_RESUBSCRIBE",
                defaults.max_resubscribe_attempts,
            ),
        }
    }

    /// Parse a TOML document into a validated config
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: FeedConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(FeedError::Config("window_size must be at least 1".into()));
        }
        if self.page_size == 0 {
            return Err(FeedError::Config("page_size must be at least 1".into()));
        }
        Ok(())
    }

    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
