//! Asynchronous task handoff for request/response services.
//!
//! A producer submits a task under its own id and returns immediately;
//! workers in a consumer group pick tasks off a shared log, run them and
//! record a result; the producer polls for the outcome.
//!
//! - Log-backed queue with consumer groups (each entry goes to one consumer)
//! - Status per task: `pending` → `processing` → `completed` | `failed`
//! - Results and statuses expire after a TTL
//! - Redelivery of abandoned entries, failing tasks that keep crashing workers
//! - Redis Streams or in-process transport
//!
//! ## Status Transitions
//!
//! ```
//! use handoff_queue::TaskStatus;
//!
//! assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Processing));
//! assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Completed));
//! assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Processing));
//! assert!(TaskStatus::Failed.is_terminal());
//! ```
//!
//! ## Queue Configuration
//!
//! ```
//! use handoff_queue::{DuplicatePolicy, QueueConfig};
//! use std::time::Duration;
//!
//! let config = QueueConfig::new("predictions")
//!     .with_ttl(Duration::from_secs(3600))
//!     .with_duplicate_policy(DuplicatePolicy::RejectActive);
//!
//! assert_eq!(config.stream, "handoff:predictions:tasks");
//! assert_eq!(config.status_key("t1"), "handoff:predictions:status:t1");
//! ```
//!
//! ## Complete Example
//!
//! ```
//! use handoff_queue::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> QueueResult<()> {
//! let transport = Arc::new(InMemoryTransport::new());
//! let config = QueueConfig::new("docs").with_block_timeout(Duration::ZERO);
//! let queue = Arc::new(TaskQueue::connect(transport, config).await?);
//!
//! assert!(queue.submit("t1", "hello").await);
//!
//! let work = work_fn(|task| async move { Ok(task.payload.len().to_string()) });
//! let worker = WorkerLoop::new(queue.clone(), work, WorkerConfig::default());
//! worker.run_once().await;
//!
//! assert_eq!(queue.try_poll("t1").await?, TaskOutcome::Completed("5".into()));
//! queue.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod health;
pub mod queue;
pub mod retry;
pub mod status;
pub mod task;
pub mod transport;
pub mod worker;

pub use config::{DuplicatePolicy, QueueConfig, ReclaimPolicy, generate_consumer_name};
pub use error::{QueueError, QueueResult};
pub use health::{HealthReport, HealthState};
pub use queue::{ReclaimReport, TaskQueue};
pub use retry::RetryPolicy;
pub use status::{TaskOutcome, TaskStatus};
pub use task::{Delivery, DeliveryHandle, EntryId, Task, TaskId};
pub use transport::{InMemoryTransport, RedisTransport, Transport};
pub use worker::{
    Iteration, StatsSnapshot, WorkFn, WorkerConfig, WorkerLoop, WorkerPool, WorkerState,
    WorkerStats, execute_sync, work_fn,
};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{DuplicatePolicy, QueueConfig};
    pub use crate::error::{QueueError, QueueResult};
    pub use crate::queue::TaskQueue;
    pub use crate::status::{TaskOutcome, TaskStatus};
    pub use crate::task::{Delivery, Task, TaskId};
    pub use crate::transport::{InMemoryTransport, RedisTransport, Transport};
    pub use crate::worker::{WorkFn, WorkerConfig, WorkerLoop, WorkerPool, work_fn};
}
