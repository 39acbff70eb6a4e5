//! Redis connectivity for the handoff task queue.
//!
//! ```rust,no_run
//! use handoff_redis::{Connector, RedisConfig};
//!
//! # async fn example() -> handoff_redis::Result<()> {
//! let config = RedisConfig::from_env().build();
//! let connector = Connector::new(config)?;
//! let mut conn = connector.connect().await?;
//! handoff_redis::ping(&mut conn).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connector;
pub mod error;

pub use config::{RedisConfig, RedisConfigBuilder};
pub use connector::{BLOCKING_MARGIN, Connector, ping};
pub use error::{RedisError, Result};

// Re-export redis for downstream transports
pub use redis;
