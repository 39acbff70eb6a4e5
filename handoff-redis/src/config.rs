//! Connection settings.

use crate::error::{RedisError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

const SCHEMES: &[&str] = &["redis", "rediss", "unix", "redis+unix"];

/// Where and how to reach Redis.
///
/// Credentials and the database index may be given either inside `url` or
/// as separate fields; the fields win when both are present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// Time allowed for the TCP connect and handshake.
    #[serde(with = "fractional_secs")]
    pub connection_timeout: Duration,
    /// Client-side timeout for non-blocking commands. Blocking reads get
    /// their own connections with a longer timeout.
    #[serde(with = "fractional_secs")]
    pub response_timeout: Duration,
    pub database: Option<u8>,
    /// ACL user (Redis 6+).
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            connection_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
            database: None,
            username: None,
            password: None,
        }
    }
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn builder() -> RedisConfigBuilder {
        RedisConfigBuilder::default()
    }

    /// Builder seeded from `REDIS_URL`, `REDIS_DATABASE`, `REDIS_USERNAME`,
    /// `REDIS_PASSWORD` and `REDIS_CONNECT_TIMEOUT_SECS`.
    ///
    /// Values that fail to parse are ignored.
    pub fn from_env() -> RedisConfigBuilder {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// [`RedisConfig::from_env`] over an arbitrary lookup.
    pub fn from_lookup<F>(lookup: F) -> RedisConfigBuilder
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = RedisConfig::default();

        if let Some(url) = lookup("REDIS_URL").filter(|u| !u.trim().is_empty()) {
            config.url = url.trim().to_string();
        }
        config.database = lookup("REDIS_DATABASE").and_then(|v| v.trim().parse().ok());
        config.username = lookup("REDIS_USERNAME");
        config.password = lookup("REDIS_PASSWORD");
        if let Some(secs) = lookup("REDIS_CONNECT_TIMEOUT_SECS")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|s| s.is_finite() && *s > 0.0)
        {
            config.connection_timeout = Duration::from_secs_f64(secs);
        }

        RedisConfigBuilder { config }
    }

    /// Check that the URL parses, uses a Redis scheme and names a valid
    /// database.
    pub fn validate(&self) -> Result<()> {
        self.parsed_url().map(|_| ())
    }

    /// URL handed to the client, with the separate credential and database
    /// fields folded in.
    pub fn connection_url(&self) -> Result<String> {
        self.parsed_url().map(String::from)
    }

    /// [`RedisConfig::connection_url`] with the password masked, for logs.
    pub fn redacted_url(&self) -> String {
        match self.parsed_url() {
            Ok(mut url) => {
                if url.password().is_some() {
                    let _ = url.set_password(Some("****"));
                }
                url.into()
            }
            Err(_) => "<invalid redis url>".to_string(),
        }
    }

    fn parsed_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| RedisError::Config(format!("invalid url {:?}: {}", self.url, e)))?;

        if !SCHEMES.contains(&url.scheme()) {
            return Err(RedisError::Config(format!(
                "unsupported scheme {:?}",
                url.scheme()
            )));
        }

        if let Some(password) = &self.password {
            let username = self.username.as_deref().unwrap_or("");
            url.set_username(username)
                .and_then(|_| url.set_password(Some(password.as_str())))
                .map_err(|_| RedisError::Config("url cannot carry credentials".into()))?;
        }

        if let Some(db) = self.database {
            if db > 15 {
                return Err(RedisError::Config(format!("database {} is out of range 0-15", db)));
            }
            // A database already in the path is kept
            if matches!(url.path(), "" | "/") {
                url.set_path(&format!("/{}", db));
            }
        }

        Ok(url)
    }
}

/// Fluent construction of a [`RedisConfig`].
#[derive(Debug, Default)]
pub struct RedisConfigBuilder {
    config: RedisConfig,
}

impl RedisConfigBuilder {
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    pub fn database(mut self, db: u8) -> Self {
        self.config.database = Some(db);
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = Some(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    pub fn build(self) -> RedisConfig {
        self.config
    }
}

/// Durations as (possibly fractional) seconds.
mod fractional_secs {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}
