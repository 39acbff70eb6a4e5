//! Connection factory.

use crate::config::RedisConfig;
use crate::error::{RedisError, Result};
use redis::Client;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use std::time::Duration;
use tracing::{debug, info};

/// Extra response time granted on top of a blocking command's own timeout.
pub const BLOCKING_MARGIN: Duration = Duration::from_secs(2);

/// Opens Redis connections from a [`RedisConfig`].
///
/// Every connection is a [`ConnectionManager`], which reconnects on its own
/// after the first successful connect. The manager's internal retries are
/// kept to one attempt; callers own the retry policy.
#[derive(Clone)]
pub struct Connector {
    client: Client,
    config: RedisConfig,
}

impl Connector {
    /// Validate the configuration and create the client. No I/O happens here.
    pub fn new(config: RedisConfig) -> Result<Self> {
        let client = Client::open(config.connection_url()?)
            .map_err(|e| RedisError::Config(e.to_string()))?;
        Ok(Self { client, config })
    }

    /// The configuration this connector was built from.
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Connection for ordinary commands.
    pub async fn connect(&self) -> Result<ConnectionManager> {
        self.open(Some(self.config.response_timeout)).await
    }

    /// Connection dedicated to blocking reads of up to `block`.
    ///
    /// Its response timeout exceeds `block` by [`BLOCKING_MARGIN`] so the
    /// client never abandons a read the server is still allowed to hold.
    pub async fn connect_blocking(&self, block: Duration) -> Result<ConnectionManager> {
        self.open(Some(block + BLOCKING_MARGIN)).await
    }

    async fn open(&self, response_timeout: Option<Duration>) -> Result<ConnectionManager> {
        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(Some(self.config.connection_timeout))
            .set_response_timeout(response_timeout)
            .set_number_of_retries(1);

        debug!(url = %self.config.redacted_url(), "Opening Redis connection");

        let connection = ConnectionManager::new_with_config(self.client.clone(), manager_config)
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RedisError::Timeout(self.config.connection_timeout)
                } else if e.is_io_error() || e.is_connection_refusal() {
                    RedisError::Connection(e.to_string())
                } else {
                    RedisError::Redis(e)
                }
            })?;

        info!(url = %self.config.redacted_url(), "Redis connection established");
        Ok(connection)
    }
}

/// Round-trip a PING on `connection`.
pub async fn ping(connection: &mut ConnectionManager) -> Result<()> {
    let reply: String = redis::cmd("PING").query_async(connection).await?;
    if reply == "PONG" {
        Ok(())
    } else {
        Err(RedisError::UnexpectedReply {
            command: "PING",
            reply,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_invalid_config() {
        let result = Connector::new(RedisConfig::new("http://localhost:6379"));
        assert!(matches!(result, Err(RedisError::Config(_))));
    }

    #[test]
    fn test_new_does_not_connect() {
        let connector = Connector::new(RedisConfig::new("redis://127.0.0.1:1")).unwrap();
        assert_eq!(connector.config().url, "redis://127.0.0.1:1");
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let config = RedisConfig::builder()
            .url("redis://127.0.0.1:1")
            .connection_timeout(Duration::from_millis(200))
            .build();
        let connector = Connector::new(config).unwrap();

        assert!(connector.connect().await.is_err());
    }
}
