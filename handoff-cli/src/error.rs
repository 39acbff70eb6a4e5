//! Error types for the handoff CLI.

use handoff_queue::QueueError;
use thiserror::Error;

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

/// CLI error types.
#[derive(Debug, Error)]
pub enum CliError {
    /// Queue or transport error
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The task id has no status record (never submitted or expired)
    #[error("Task {0} not found")]
    NotFound(String),

    /// The task has not finished yet
    #[error("Task {0} is still processing")]
    StillProcessing(String),

    /// The work function failed for this task
    #[error("Task {0} failed")]
    TaskFailed(String),

    /// Status reads completed but the result could not be read
    #[error("Task {0} completed but its result is unavailable")]
    ResultUnavailable(String),

    /// The store did not answer the health probe
    #[error("Health check failed")]
    Unhealthy,

    /// IO error (signals, stdout)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON output error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Process exit code for this error.
    ///
    /// Pollers script against these: 2 still processing, 3 not found,
    /// 4 failed, 5 result missing; anything else is 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::StillProcessing(_) => 2,
            CliError::NotFound(_) => 3,
            CliError::TaskFailed(_) => 4,
            CliError::ResultUnavailable(_) => 5,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let codes = [
            CliError::StillProcessing("t".into()).exit_code(),
            CliError::NotFound("t".into()).exit_code(),
            CliError::TaskFailed("t".into()).exit_code(),
            CliError::ResultUnavailable("t".into()).exit_code(),
            CliError::Unhealthy.exit_code(),
        ];
        let mut unique = codes.to_vec();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), codes.len());
    }

    #[test]
    fn test_queue_errors_pass_through() {
        let err: CliError = QueueError::Timeout.into();
        assert_eq!(err.to_string(), "Operation timeout");
        assert_eq!(err.exit_code(), 1);
    }
}
