//! Task status state machine.

use crate::error::QueueError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a task.
///
/// Transitions only move forward along
/// `Pending -> Processing -> {Completed, Failed}`. A terminal state is never
/// left except by resubmitting the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    /// Wire representation stored under the status key.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether a record currently holding `self` may be overwritten with
    /// `next`. Rewriting the same value is allowed and refreshes the expiry.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        !next.forbidden_predecessors().contains(self)
    }

    /// Current values that must block a write of `self`.
    pub fn forbidden_predecessors(&self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Pending => &[
                TaskStatus::Processing,
                TaskStatus::Completed,
                TaskStatus::Failed,
            ],
            TaskStatus::Processing => &[TaskStatus::Completed, TaskStatus::Failed],
            TaskStatus::Completed => &[TaskStatus::Failed],
            TaskStatus::Failed => &[TaskStatus::Completed],
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(QueueError::InvalidStatus(other.to_string())),
        }
    }
}

/// What a poller learns about a task id.
///
/// Every variant is a distinct outcome at the caller boundary: not found,
/// still running, failed, done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "result", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Never submitted, or its records expired
    Unknown,
    Pending,
    Processing,
    Completed(String),
    Failed,
    /// Status reads completed but the result could not be read; retry
    ResultUnavailable,
}

impl TaskOutcome {
    /// Whether polling again can change the answer.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TaskOutcome::Completed(_) | TaskOutcome::Failed | TaskOutcome::Unknown
        )
    }
}
