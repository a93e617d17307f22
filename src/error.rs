//! Error types for the feed engine

use thiserror::Error;

/// Result type for feed operations
pub type Result<T> = std::result::Result<T, FeedError>;

/// Feed error types
///
/// None of these are fatal to the process. Every error is scoped to a single
/// feed view and leaves it in a degraded but retryable state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// A page fetch or mutation request failed; safe to retry
    #[error("{operation} failed: {message}")]
    Transient { operation: String, message: String },

    /// A live subscription disconnected
    #[error("Subscription dropped: {0}")]
    SubscriptionDropped(String),

    /// Item not found
    #[error("Item not found: {0}")]
    NotFound(String),

    /// Caller supplied an unusable value
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The feed was torn down
    #[error("Feed is closed")]
    Closed,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl FeedError {
    /// Shorthand for a transient failure of `operation`
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        FeedError::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Whether the caller can retry the operation that produced this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FeedError::Transient { .. } | FeedError::SubscriptionDropped(_)
        )
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for FeedError {
    fn from(err: toml::de::Error) -> Self {
        FeedError::Config(err.to_string())
    }
}
