// handoff - asynchronous task handoff for request/response services
//
// A producer submits work under its own id and polls for the outcome; workers
// in a consumer group take tasks off a shared log and record results with an
// expiry.

// Re-export the queue
pub use handoff_queue::*;

// Re-export supporting crates
pub use handoff_log;
pub use handoff_redis;

/// Prelude for common imports.
///
/// ```
/// use handoff::prelude::*;
/// ```
pub mod prelude {
    pub use handoff_queue::prelude::*;
    pub use handoff_queue::{HealthState, Iteration, ReclaimPolicy, RetryPolicy, execute_sync};
    pub use handoff_redis::RedisConfig;
}
