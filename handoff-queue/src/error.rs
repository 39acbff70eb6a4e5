//! Error types for queue operations.

use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-specific errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Transport-level failure (connection lost, timeout talking to the store)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Redis connectivity error
    #[error("Redis error: {0}")]
    Connection(#[from] handoff_redis::RedisError),

    /// Redis command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A log entry is missing fields or holds malformed values
    #[error("Malformed log entry {id}: {reason}")]
    MalformedEntry { id: String, reason: String },

    /// Invalid task id
    #[error("Invalid task id: {0}")]
    InvalidTaskId(String),

    /// Unknown status value read from the store
    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    /// Submission rejected by the duplicate policy
    #[error("Task {0} is already pending or processing")]
    Duplicate(String),

    /// Work function execution failed
    #[error("Task execution failed: {0}")]
    ExecutionFailed(String),

    /// Work function exceeded its timeout
    #[error("Operation timeout")]
    Timeout,

    /// Queue was shut down or its transport never came up
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl QueueError {
    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Unavailable(_) => true,
            Self::Connection(e) => e.is_retryable(),
            Self::Redis(e) => {
                e.is_timeout()
                    || e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
            }
            _ => false,
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
