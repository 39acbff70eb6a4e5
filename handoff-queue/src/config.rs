//! Queue configuration.

use crate::error::{QueueError, QueueResult};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// What `submit` does when the id already has a live PENDING or PROCESSING
/// status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    /// Reset the status to PENDING and append another entry. Submission is
    /// at-least-once; a worker that later sees the id already terminal skips
    /// the extra entry.
    #[default]
    Allow,
    /// Refuse the submission while an earlier one is still in flight.
    RejectActive,
}

impl FromStr for DuplicatePolicy {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(Self::Allow),
            "reject-active" | "reject_active" | "reject" => Ok(Self::RejectActive),
            other => Err(QueueError::Config(format!("unknown duplicate policy {:?}", other))),
        }
    }
}

/// Redelivery of entries whose consumer went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimPolicy {
    /// An entry pending longer than this is considered abandoned.
    pub min_idle: Duration,
    /// Deliveries after which an abandoned entry is failed instead of
    /// redelivered.
    pub max_deliveries: u64,
    /// Pending entries inspected per pass.
    pub batch: usize,
    /// Minimum time between automatic passes run by `next`.
    pub interval: Duration,
}

impl Default for ReclaimPolicy {
    fn default() -> Self {
        Self {
            min_idle: Duration::from_secs(60),
            max_deliveries: 3,
            batch: 16,
            interval: Duration::from_secs(5),
        }
    }
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Log (stream) name
    pub stream: String,

    /// Consumer group shared by all workers
    pub group: String,

    /// Consumer name of this process
    pub consumer: String,

    /// Prefix of status keys
    pub status_prefix: String,

    /// Prefix of result keys
    pub result_prefix: String,

    /// Expiry of status and result records, refreshed on every write
    pub ttl: Duration,

    /// Default wait of `next` when no entry is available
    pub block_timeout: Duration,

    pub reclaim: ReclaimPolicy,

    pub duplicate_policy: DuplicatePolicy,

    /// Retry policy of the connect phase
    pub connect_retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stream: "handoff:tasks".to_string(),
            group: "handoff-workers".to_string(),
            consumer: generate_consumer_name(),
            status_prefix: "handoff:status:".to_string(),
            result_prefix: "handoff:result:".to_string(),
            ttl: Duration::from_secs(86400), // 24 hours
            block_timeout: Duration::from_secs(1),
            reclaim: ReclaimPolicy::default(),
            duplicate_policy: DuplicatePolicy::default(),
            connect_retry: RetryPolicy::default(),
        }
    }
}

/// `worker_` plus eight hex characters.
pub fn generate_consumer_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("worker_{}", &id[..8])
}

impl QueueConfig {
    /// Configuration whose keys all live under `handoff:<namespace>:`.
    pub fn new(namespace: impl AsRef<str>) -> Self {
        let ns = namespace.as_ref();
        Self {
            stream: format!("handoff:{}:tasks", ns),
            group: format!("{}-workers", ns),
            status_prefix: format!("handoff:{}:status:", ns),
            result_prefix: format!("handoff:{}:result:", ns),
            ..Default::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// `HANDOFF_NAMESPACE`, `HANDOFF_CONSUMER`, `RESULT_TTL` (seconds),
    /// `BLOCK_TIMEOUT_MS`, `RECLAIM_IDLE_SECS`, `MAX_DELIVERIES`,
    /// `DUPLICATE_POLICY`, `CONNECT_MAX_WAIT_SECS`.
    pub fn from_env() -> QueueResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`QueueConfig::from_env`] over an arbitrary lookup.
    pub fn from_lookup<F>(lookup: F) -> QueueResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup("HANDOFF_NAMESPACE") {
            Some(ns) if !ns.trim().is_empty() => Self::new(ns.trim()),
            _ => Self::default(),
        };

        if let Some(consumer) = lookup("HANDOFF_CONSUMER") {
            config.consumer = consumer;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "RESULT_TTL")? {
            config.ttl = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "BLOCK_TIMEOUT_MS")? {
            config.block_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "RECLAIM_IDLE_SECS")? {
            config.reclaim.min_idle = Duration::from_secs(secs);
        }
        if let Some(max) = parse_var::<u64>(&lookup, "MAX_DELIVERIES")? {
            config.reclaim.max_deliveries = max;
        }
        if let Some(policy) = parse_var::<DuplicatePolicy>(&lookup, "DUPLICATE_POLICY")? {
            config.duplicate_policy = policy;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "CONNECT_MAX_WAIT_SECS")? {
            config.connect_retry.max_elapsed = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the consumer name.
    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    /// Set the record expiry.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the default blocking wait of `next`.
    pub fn with_block_timeout(mut self, block_timeout: Duration) -> Self {
        self.block_timeout = block_timeout;
        self
    }

    /// Set the reclaim policy.
    pub fn with_reclaim(mut self, reclaim: ReclaimPolicy) -> Self {
        self.reclaim = reclaim;
        self
    }

    /// Set the duplicate submission policy.
    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    /// Set the connect retry policy.
    pub fn with_connect_retry(mut self, retry: RetryPolicy) -> Self {
        self.connect_retry = retry;
        self
    }

    /// Reject settings the queue cannot run with.
    pub fn validate(&self) -> QueueResult<()> {
        let names = [
            ("stream", &self.stream),
            ("group", &self.group),
            ("consumer", &self.consumer),
            ("status prefix", &self.status_prefix),
            ("result prefix", &self.result_prefix),
        ];
        for (what, value) in names {
            if value.is_empty() {
                return Err(QueueError::Config(format!("{} must not be empty", what)));
            }
        }
        if self.status_prefix == self.result_prefix {
            return Err(QueueError::Config(
                "status and result prefixes must differ".to_string(),
            ));
        }
        if self.ttl < Duration::from_secs(1) {
            return Err(QueueError::Config("ttl must be at least one second".to_string()));
        }
        if self.reclaim.max_deliveries == 0 {
            return Err(QueueError::Config("max deliveries must be positive".to_string()));
        }
        if self.reclaim.batch == 0 {
            return Err(QueueError::Config("reclaim batch must be positive".to_string()));
        }
        Ok(())
    }

    /// Status key of `task_id`.
    pub fn status_key(&self, task_id: &str) -> String {
        format!("{}{}", self.status_prefix, task_id)
    }

    /// Result key of `task_id`.
    pub fn result_key(&self, task_id: &str) -> String {
        format!("{}{}", self.result_prefix, task_id)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> QueueResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| QueueError::Config(format!("{}={:?}: {}", key, raw, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.stream, "handoff:tasks");
        assert_eq!(config.ttl, Duration::from_secs(86400));
        assert_eq!(config.block_timeout, Duration::from_secs(1));
        assert_eq!(config.duplicate_policy, DuplicatePolicy::Allow);
        assert_eq!(config.reclaim.max_deliveries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_consumer_names() {
        let a = generate_consumer_name();
        let b = generate_consumer_name();
        assert!(a.starts_with("worker_"));
        assert_eq!(a.len(), "worker_".len() + 8);
        assert_ne!(a, b);
    }

    #[test]
    fn test_namespace_keys() {
        let config = QueueConfig::new("predictions");
        assert_eq!(config.stream, "handoff:predictions:tasks");
        assert_eq!(config.group, "predictions-workers");
        assert_eq!(config.status_key("t1"), "handoff:predictions:status:t1");
        assert_eq!(config.result_key("t1"), "handoff:predictions:result:t1");
    }

    #[test]
    fn test_from_lookup() {
        let config = QueueConfig::from_lookup(lookup(&[
            ("HANDOFF_NAMESPACE", "jobs"),
            ("HANDOFF_CONSUMER", "worker_fixed"),
            ("RESULT_TTL", "3600"),
            ("BLOCK_TIMEOUT_MS", "250"),
            ("MAX_DELIVERIES", "5"),
            ("DUPLICATE_POLICY", "reject-active"),
            ("CONNECT_MAX_WAIT_SECS", "3"),
        ]))
        .unwrap();

        assert_eq!(config.stream, "handoff:jobs:tasks");
        assert_eq!(config.consumer, "worker_fixed");
        assert_eq!(config.ttl, Duration::from_secs(3600));
        assert_eq!(config.block_timeout, Duration::from_millis(250));
        assert_eq!(config.reclaim.max_deliveries, 5);
        assert_eq!(config.duplicate_policy, DuplicatePolicy::RejectActive);
        assert_eq!(config.connect_retry.max_elapsed, Duration::from_secs(3));
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = QueueConfig::from_lookup(lookup(&[("RESULT_TTL", "a day")])).unwrap_err();
        assert!(matches!(err, QueueError::Config(_)));

        let err = QueueConfig::from_lookup(lookup(&[("DUPLICATE_POLICY", "maybe")])).unwrap_err();
        assert!(err.to_string().contains("DUPLICATE_POLICY"));

        let err = QueueConfig::from_lookup(lookup(&[("RESULT_TTL", "0")])).unwrap_err();
        assert!(err.to_string().contains("ttl"));
    }

    #[test]
    fn test_validate() {
        let mut config = QueueConfig::default();
        config.result_prefix = config.status_prefix.clone();
        assert!(config.validate().is_err());

        let config = QueueConfig::default().with_reclaim(ReclaimPolicy {
            max_deliveries: 0,
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }
}
