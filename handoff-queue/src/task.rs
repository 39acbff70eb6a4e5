//! Task and delivery types.

use crate::error::{QueueError, QueueResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Log field holding the task id.
pub const FIELD_TASK_ID: &str = "task_id";
/// Log field holding the payload.
pub const FIELD_PAYLOAD: &str = "payload";
/// Log field holding the creation time (RFC 3339).
pub const FIELD_CREATED_AT: &str = "created_at";

const MAX_TASK_ID_LEN: usize = 512;

/// Caller-supplied task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

impl TaskId {
    /// Validate and wrap an identifier.
    ///
    /// Ids must be non-empty, at most 512 bytes and free of whitespace and
    /// control characters, since they are spliced into storage keys.
    pub fn new(id: impl Into<String>) -> QueueResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(QueueError::InvalidTaskId("empty".to_string()));
        }
        if id.len() > MAX_TASK_ID_LEN {
            return Err(QueueError::InvalidTaskId(format!(
                "longer than {} bytes",
                MAX_TASK_ID_LEN
            )));
        }
        if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(QueueError::InvalidTaskId(format!("{:?}", id)));
        }
        Ok(Self(id))
    }

    /// Random v4 UUID id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TaskId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TaskId {
    type Error = QueueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Position of an entry in the log, `<millis>-<sequence>`.
///
/// Positions are strictly increasing in append order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    /// Smallest possible position.
    pub const MIN: EntryId = EntryId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Next position strictly after `self` for an append at `now_ms`.
    pub fn successor(&self, now_ms: u64) -> Self {
        if now_ms > self.ms {
            Self { ms: now_ms, seq: 0 }
        } else {
            Self {
                ms: self.ms,
                seq: self.seq + 1,
            }
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || QueueError::MalformedEntry {
            id: s.to_string(),
            reason: "entry id must be <ms>-<seq>".to_string(),
        };
        let (ms, seq) = s.split_once('-').ok_or_else(malformed)?;
        Ok(Self {
            ms: ms.parse().map_err(|_| malformed())?,
            seq: seq.parse().map_err(|_| malformed())?,
        })
    }
}

impl Serialize for EntryId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntryId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A unit of work as recorded in the log. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub payload: String,
    pub created_at: DateTime<Utc>,
    /// Log position, assigned at append time
    pub entry_id: EntryId,
}

impl Task {
    /// Flat field set written to the log.
    pub fn fields(id: &TaskId, payload: &str, created_at: DateTime<Utc>) -> Vec<(String, String)> {
        vec![
            (FIELD_TASK_ID.to_string(), id.to_string()),
            (FIELD_PAYLOAD.to_string(), payload.to_string()),
            (FIELD_CREATED_AT.to_string(), created_at.to_rfc3339()),
        ]
    }

    /// Rebuild a task from a log entry's field set.
    pub fn from_fields(entry_id: EntryId, fields: &HashMap<String, String>) -> QueueResult<Self> {
        let malformed = |reason: String| QueueError::MalformedEntry {
            id: entry_id.to_string(),
            reason,
        };
        let field = |name: &str| {
            fields
                .get(name)
                .ok_or_else(|| malformed(format!("missing {}", name)))
        };

        let id = TaskId::new(field(FIELD_TASK_ID)?.clone())
            .map_err(|e| malformed(e.to_string()))?;
        let payload = field(FIELD_PAYLOAD)?.clone();
        let created_at = DateTime::parse_from_rfc3339(field(FIELD_CREATED_AT)?)
            .map_err(|e| malformed(format!("bad created_at: {}", e)))?
            .with_timezone(&Utc);

        Ok(Self {
            id,
            payload,
            created_at,
            entry_id,
        })
    }
}

/// One delivery attempt of one log entry to one consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryHandle {
    pub entry_id: EntryId,
    pub consumer: String,
    pub delivered_at: DateTime<Utc>,
    /// 1 for the first delivery, incremented on each reclaim
    pub delivery_count: u64,
}

/// What `next` hands to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub handle: DeliveryHandle,
    pub task: Task,
}

impl Delivery {
    /// Whether this entry was handed out before.
    pub fn is_redelivery(&self) -> bool {
        self.handle.delivery_count > 1
    }
}
