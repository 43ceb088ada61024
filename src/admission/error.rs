//! Counter Store Error Types
//!
//! Errors raised by counter store adapters. Admission operations never surface
//! these to callers; they are folded into `redis_unavailable` results.

/// Error types for counter store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Request never reached the store or timed out
    #[error("Transport error: {0}")]
    Transport(String),

    /// Store answered with a non-success HTTP status
    #[error("Store returned HTTP status {0}")]
    Status(u16),

    /// Store rejected the command
    #[error("Store error: {0}")]
    Server(String),

    /// Store reply could not be interpreted
    #[error("Malformed store reply: {0}")]
    Decode(String),

    /// No store is configured or reachable
    #[error("Counter store unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => StoreError::Status(status.as_u16()),
            None => StoreError::Transport(err.to_string()),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
