//! Storage transports.
//!
//! A transport provides two things: an append-only log with consumer groups,
//! and a key/value store with expiry. [`TaskQueue`](crate::TaskQueue) builds
//! every queue operation from these primitives and never talks to a backend
//! directly.

pub mod memory;
pub mod redis_streams;

pub use self::memory::InMemoryTransport;
pub use self::redis_streams::RedisTransport;

use crate::error::QueueResult;
use crate::task::EntryId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Result of registering a consumer group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCreation {
    Created,
    AlreadyExists,
}

/// An entry read from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: EntryId,
    pub fields: HashMap<String, String>,
    /// Times this entry has been delivered, including this delivery
    pub delivery_count: u64,
}

/// A delivered but unacknowledged entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: EntryId,
    pub consumer: String,
    /// Time since the entry was last delivered
    pub idle: Duration,
    pub delivery_count: u64,
}

/// Expiry state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    /// Key exists without an expiry
    Persistent,
    Expires(Duration),
}

/// Storage collaborator of the task queue.
///
/// Log operations follow consumer-group semantics: every entry appended
/// after a group's cursor is handed to exactly one consumer of that group
/// and stays in the group's pending list until acknowledged.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short backend name for logs and health reports.
    fn name(&self) -> &'static str;

    /// Liveness probe.
    async fn ping(&self) -> QueueResult<()>;

    /// Create `group` on `stream` with its cursor at the start of the log,
    /// creating the stream if needed.
    async fn create_group(&self, stream: &str, group: &str) -> QueueResult<GroupCreation>;

    /// Append an entry, returning its position.
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> QueueResult<EntryId>;

    /// Claim the next never-delivered entry for `consumer`, waiting up to
    /// `block` for one to arrive. A zero `block` does not wait.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> QueueResult<Option<LogEntry>>;

    /// Remove an entry from the pending list. Returns whether it was pending.
    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> QueueResult<bool>;

    /// Up to `count` pending entries, oldest first.
    async fn pending(&self, stream: &str, group: &str, count: usize)
    -> QueueResult<Vec<PendingEntry>>;

    /// Reassign pending entries to `consumer` if they are still idle for at
    /// least `min_idle`. Each claim bumps the delivery count. Entries that a
    /// concurrent claimer took first, or that no longer exist, are skipped.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        entries: &[PendingEntry],
    ) -> QueueResult<Vec<LogEntry>>;

    /// Reset the idle time of an entry `consumer` still holds, without
    /// counting a delivery. Returns false if the entry was acknowledged or
    /// now belongs to another consumer.
    async fn touch(&self, stream: &str, group: &str, consumer: &str, id: EntryId)
    -> QueueResult<bool>;

    async fn get(&self, key: &str) -> QueueResult<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<()>;

    /// Write every pair in `writes` with `ttl`, as one atomic step, unless
    /// the current value of `guard_key` is one of `forbidden`. Returns
    /// whether the write happened.
    async fn set_ex_if(
        &self,
        guard_key: &str,
        forbidden: &[&str],
        writes: &[(String, String)],
        ttl: Duration,
    ) -> QueueResult<bool>;

    /// Keys starting with `prefix`. Used by maintenance only.
    async fn keys_with_prefix(&self, prefix: &str) -> QueueResult<Vec<String>>;

    async fn ttl(&self, key: &str) -> QueueResult<KeyTtl>;

    /// Set the expiry of an existing key. Returns false if the key is gone.
    async fn expire(&self, key: &str, ttl: Duration) -> QueueResult<bool>;

    /// Release connections. Later calls may fail.
    async fn close(&self) -> QueueResult<()> {
        Ok(())
    }
}
