//! Errors raised while reaching Redis.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RedisError>;

#[derive(Debug, Error)]
pub enum RedisError {
    /// The server could not be reached or dropped the connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Connect did not finish within the configured timeout.
    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    /// The server answered with something the caller cannot use.
    #[error("Unexpected reply to {command}: {reply}")]
    UnexpectedReply { command: &'static str, reply: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl RedisError {
    /// Whether the same call may succeed if attempted again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout(_) => true,
            Self::Redis(e) => e.is_timeout() || Self::lost_connection(e),
            Self::UnexpectedReply { .. } | Self::Config(_) => false,
        }
    }

    /// Whether the connection itself is gone, as opposed to a slow or
    /// rejected command.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Redis(e) => Self::lost_connection(e),
            _ => false,
        }
    }

    fn lost_connection(e: &redis::RedisError) -> bool {
        e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal()
    }
}
