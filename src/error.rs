//! Error types for the Tollgate admission engine.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The counter backend could not be reached, timed out, or was closed
    #[error("Counter backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A glob pattern could not be compiled
    #[error("Invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// No configured rule covers the key
    #[error("No rate limit rule matches key {0:?}")]
    NoMatchingRule(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TollgateError {
    /// Whether this error came from the counter backend rather than the caller.
    pub fn is_backend(&self) -> bool {
        matches!(self, TollgateError::BackendUnavailable(_))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for TollgateError {
    fn from(err: redis::RedisError) -> Self {
        TollgateError::BackendUnavailable(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
