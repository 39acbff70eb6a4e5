//! Queue health.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether the queue can currently reach its store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    /// The store was unreachable at the last check; operations return
    /// `false`/`None` until it comes back.
    Degraded { reason: String },
}

impl HealthState {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthState::Healthy)
    }
}

/// Snapshot returned by `TaskQueue::health_report`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub transport: String,
    pub transport_alive: bool,
    pub group_registered: bool,
    pub consumer: String,
    pub state: HealthState,
    /// Entries delivered but not yet acknowledged, if the store answered
    pub pending: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_value(HealthState::Degraded {
            reason: "connection refused".into(),
        })
        .unwrap();
        assert_eq!(json["state"], "degraded");
        assert_eq!(json["reason"], "connection refused");

        let json = serde_json::to_value(HealthState::Healthy).unwrap();
        assert_eq!(json["state"], "healthy");
    }
}
