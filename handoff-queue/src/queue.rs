//! The task queue.

use crate::config::{DuplicatePolicy, QueueConfig};
use crate::error::{QueueError, QueueResult};
use crate::health::{HealthReport, HealthState};
use crate::status::{TaskOutcome, TaskStatus};
use crate::task::{Delivery, DeliveryHandle, EntryId, Task, TaskId};
use crate::transport::{GroupCreation, KeyTtl, LogEntry, PendingEntry, Transport};
use chrono::Utc;
use handoff_log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

/// Pending entries counted at most by [`TaskQueue::health_report`].
const HEALTH_PENDING_LIMIT: usize = 10_000;

/// Outcome of one reclaim pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    /// Pending entries inspected
    pub inspected: usize,
    /// Abandoned entries newly queued for redelivery through `next`
    pub reclaimed: Vec<EntryId>,
    /// Tasks failed because they reached the delivery limit
    pub poisoned: Vec<TaskId>,
}

/// Abandoned entries found by a reclaim pass. They stay owned by their
/// original consumer until `next` claims one for its caller.
#[derive(Debug, Default)]
struct Abandoned {
    entries: VecDeque<PendingEntry>,
    queued: HashSet<EntryId>,
}

impl Abandoned {
    fn push(&mut self, entry: PendingEntry) -> bool {
        if !self.queued.insert(entry.id) {
            return false;
        }
        self.entries.push_back(entry);
        true
    }

    fn pop(&mut self) -> Option<PendingEntry> {
        let entry = self.entries.pop_front()?;
        self.queued.remove(&entry.id);
        Some(entry)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Task queue over a [`Transport`].
///
/// Construct one with [`TaskQueue::connect`], share it as `Arc<TaskQueue>`
/// and call [`TaskQueue::shutdown`] when done.
pub struct TaskQueue {
    transport: Arc<dyn Transport>,
    config: QueueConfig,
    group_ready: AtomicBool,
    closed: AtomicBool,
    health: RwLock<HealthState>,
    abandoned: Mutex<Abandoned>,
    last_reclaim: Mutex<Option<Instant>>,
}

impl TaskQueue {
    /// Connect, verify the transport and register the consumer group.
    ///
    /// The transport is pinged under `config.connect_retry`. When the retry
    /// budget runs out the queue is still returned, in degraded health, and
    /// group registration is retried by later calls. Only an invalid
    /// configuration is an error.
    pub async fn connect(transport: Arc<dyn Transport>, config: QueueConfig) -> QueueResult<Self> {
        config.validate()?;
        info!(
            "Initializing task queue on {} (stream {}, group {}, consumer {})",
            transport.name(),
            config.stream,
            config.group,
            config.consumer
        );

        let queue = Self {
            transport,
            config,
            group_ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            health: RwLock::new(HealthState::Healthy),
            abandoned: Mutex::new(Abandoned::default()),
            last_reclaim: Mutex::new(None),
        };

        let verified = queue
            .config
            .connect_retry
            .retry("transport ping", || queue.transport.ping())
            .await;

        match verified {
            Ok(()) => match queue.ensure_group().await {
                Ok(()) => info!("Task queue ready"),
                Err(e) => queue.degrade(format!("group registration failed: {}", e)).await,
            },
            Err(e) => queue.degrade(format!("transport unreachable: {}", e)).await,
        }

        Ok(queue)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Consumer name used when none is given.
    pub fn consumer(&self) -> &str {
        &self.config.consumer
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.is_closed() {
            return Err(QueueError::Unavailable("queue is shut down".to_string()));
        }
        Ok(())
    }

    async fn ensure_group(&self) -> QueueResult<()> {
        if self.group_ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        match self
            .transport
            .create_group(&self.config.stream, &self.config.group)
            .await?
        {
            GroupCreation::Created => info!(
                "Created consumer group {} on {}",
                self.config.group, self.config.stream
            ),
            GroupCreation::AlreadyExists => info!(
                "Consumer group {} already exists on {}",
                self.config.group, self.config.stream
            ),
        }
        self.group_ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn degrade(&self, reason: String) {
        let mut health = self.health.write().await;
        if health.is_healthy() {
            error!("Task queue degraded: {}", reason);
        }
        *health = HealthState::Degraded { reason };
    }

    async fn recover(&self) {
        if self.health.read().await.is_healthy() {
            return;
        }
        let mut health = self.health.write().await;
        if !health.is_healthy() {
            info!("Task queue recovered");
            *health = HealthState::Healthy;
        }
    }

    /// Record the effect of a transport call on health.
    async fn observe<T>(&self, result: &QueueResult<T>) {
        match result {
            Ok(_) => self.recover().await,
            Err(e) if e.is_retryable() => self.degrade(e.to_string()).await,
            Err(_) => {}
        }
    }

    // ------------------------------------------------------------------
    // Producer side
    // ------------------------------------------------------------------

    /// Submit a task, returning its log position.
    ///
    /// Writes PENDING, then appends `{task_id, payload, created_at}`. Under
    /// [`DuplicatePolicy::RejectActive`] the status write fails with
    /// [`QueueError::Duplicate`] while the id is PENDING or PROCESSING.
    pub async fn try_submit(&self, task_id: &str, payload: &str) -> QueueResult<EntryId> {
        self.ensure_open()?;
        let id = TaskId::new(task_id)?;
        let status_key = self.config.status_key(id.as_str());
        let pending = TaskStatus::Pending.as_str();

        let result = async {
            match self.config.duplicate_policy {
                DuplicatePolicy::Allow => {
                    self.transport
                        .set_ex(&status_key, pending, self.config.ttl)
                        .await?;
                }
                DuplicatePolicy::RejectActive => {
                    let active = [TaskStatus::Pending.as_str(), TaskStatus::Processing.as_str()];
                    let written = self
                        .transport
                        .set_ex_if(
                            &status_key,
                            &active,
                            &[(status_key.clone(), pending.to_string())],
                            self.config.ttl,
                        )
                        .await?;
                    if !written {
                        return Err(QueueError::Duplicate(id.to_string()));
                    }
                }
            }

            let fields = Task::fields(&id, payload, Utc::now());
            self.transport.append(&self.config.stream, &fields).await
        }
        .await;

        self.observe(&result).await;
        if let Ok(entry_id) = &result {
            debug!("Submitted task {} at {}", id, entry_id);
        }
        result
    }

    /// Submit a task. Returns true only if both the status write and the
    /// append succeeded; resubmitting after `false` is safe.
    pub async fn submit(&self, task_id: &str, payload: &str) -> bool {
        match self.try_submit(task_id, payload).await {
            Ok(_) => true,
            Err(QueueError::Duplicate(id)) => {
                info!("Rejected duplicate submission of {}", id);
                false
            }
            Err(e) => {
                warn!("Failed to submit task {}: {}", task_id, e);
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Consumer side
    // ------------------------------------------------------------------

    /// Next delivery for the default consumer. See [`TaskQueue::try_next_as`].
    pub async fn try_next(&self, block: Duration) -> QueueResult<Option<Delivery>> {
        let consumer = self.config.consumer.clone();
        self.try_next_as(&consumer, block).await
    }

    /// Hand out one entry to `consumer`, waiting up to `block` for one.
    ///
    /// Entries recovered by a reclaim pass are handed out before new ones.
    /// A pass runs automatically at most once per reclaim interval.
    pub async fn try_next_as(&self, consumer: &str, block: Duration) -> QueueResult<Option<Delivery>> {
        self.ensure_open()?;
        let ready = self.ensure_group().await;
        self.observe(&ready).await;
        ready?;

        self.maybe_reclaim(consumer).await;

        if let Some(entry) = self.claim_abandoned(consumer).await? {
            return self.into_delivery(consumer.to_string(), entry).await;
        }

        let read = self
            .transport
            .read_group(&self.config.stream, &self.config.group, consumer, block)
            .await;
        self.observe(&read).await;
        match read {
            Ok(Some(entry)) => self.into_delivery(consumer.to_string(), entry).await,
            Ok(None) => Ok(None),
            Err(e) => {
                if is_missing_group(&e) {
                    warn!("Consumer group {} vanished, recreating", self.config.group);
                    self.group_ready.store(false, Ordering::SeqCst);
                }
                Err(e)
            }
        }
    }

    /// Claim the oldest queued abandoned entry for `consumer`.
    ///
    /// Entries acknowledged or taken by another consumer since the reclaim
    /// pass are skipped.
    async fn claim_abandoned(&self, consumer: &str) -> QueueResult<Option<LogEntry>> {
        let policy = &self.config.reclaim;
        loop {
            let Some(candidate) = self.abandoned.lock().await.pop() else {
                return Ok(None);
            };

            let claimed = self
                .transport
                .claim(
                    &self.config.stream,
                    &self.config.group,
                    consumer,
                    policy.min_idle,
                    std::slice::from_ref(&candidate),
                )
                .await;
            self.observe(&claimed).await;

            let Some(entry) = claimed?.pop() else {
                debug!("Entry {} no longer abandoned", candidate.id);
                continue;
            };
            if entry.delivery_count > policy.max_deliveries {
                self.fail_poisoned(&entry).await?;
                continue;
            }
            info!(
                "Claimed abandoned entry {} from {} for {}",
                entry.id, candidate.consumer, consumer
            );
            return Ok(Some(entry));
        }
    }

    /// Next delivery, or `None` on timeout or any transport error (logged).
    pub async fn next(&self, block: Duration) -> Option<Delivery> {
        match self.try_next(block).await {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!("Failed to read next task: {}", e);
                None
            }
        }
    }

    async fn into_delivery(&self, consumer: String, entry: LogEntry) -> QueueResult<Option<Delivery>> {
        let task = match Task::from_fields(entry.id, &entry.fields) {
            Ok(task) => task,
            Err(e) => {
                // Never processable: drop it from the pending list
                error!("Discarding malformed entry {}: {}", entry.id, e);
                self.transport
                    .ack(&self.config.stream, &self.config.group, entry.id)
                    .await?;
                return Ok(None);
            }
        };

        debug!(
            "Delivered task {} (entry {}, delivery {}) to {}",
            task.id, entry.id, entry.delivery_count, consumer
        );

        Ok(Some(Delivery {
            handle: DeliveryHandle {
                entry_id: entry.id,
                consumer,
                delivered_at: Utc::now(),
                delivery_count: entry.delivery_count,
            },
            task,
        }))
    }

    /// Keep a delivery from looking abandoned while it is being worked on.
    ///
    /// Returns `Ok(false)` if the entry was acknowledged or claimed by
    /// another consumer in the meantime.
    pub async fn try_touch(&self, handle: &DeliveryHandle) -> QueueResult<bool> {
        self.ensure_open()?;
        self.transport
            .touch(
                &self.config.stream,
                &self.config.group,
                &handle.consumer,
                handle.entry_id,
            )
            .await
    }

    /// Acknowledge a delivery. Acknowledging twice is a no-op.
    pub async fn try_ack(&self, handle: &DeliveryHandle) -> QueueResult<()> {
        self.ensure_open()?;
        let removed = self
            .transport
            .ack(&self.config.stream, &self.config.group, handle.entry_id)
            .await?;
        if !removed {
            debug!("Entry {} was not pending, ack ignored", handle.entry_id);
        }
        Ok(())
    }

    /// Acknowledge a delivery; false only on transport failure.
    pub async fn ack(&self, handle: &DeliveryHandle) -> bool {
        match self.try_ack(handle).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to ack entry {}: {}", handle.entry_id, e);
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Status and results
    // ------------------------------------------------------------------

    /// Write `status` for `task_id`, refreshing its expiry.
    ///
    /// Returns `Ok(false)` when the write would move the task backwards,
    /// for example out of a terminal state.
    pub async fn try_set_status(&self, task_id: &str, status: TaskStatus) -> QueueResult<bool> {
        self.ensure_open()?;
        let task_id = TaskId::new(task_id)?;
        let key = self.config.status_key(task_id.as_str());
        let forbidden: Vec<&str> = status
            .forbidden_predecessors()
            .iter()
            .map(|s| s.as_str())
            .collect();

        let written = self
            .transport
            .set_ex_if(
                &key,
                &forbidden,
                &[(key.clone(), status.as_str().to_string())],
                self.config.ttl,
            )
            .await?;

        if !written {
            debug!("Refused status {} for task {}", status, task_id);
        }
        Ok(written)
    }

    /// Write `status`; false if refused or on transport failure.
    pub async fn set_status(&self, task_id: &str, status: TaskStatus) -> bool {
        match self.try_set_status(task_id, status).await {
            Ok(written) => written,
            Err(e) => {
                warn!("Failed to set status of {}: {}", task_id, e);
                false
            }
        }
    }

    /// Current status; `None` for unknown or expired ids.
    ///
    /// A stored result with no status record reads as COMPLETED.
    pub async fn try_get_status(&self, task_id: &str) -> QueueResult<Option<TaskStatus>> {
        self.ensure_open()?;
        let task_id = TaskId::new(task_id)?;
        let task_id = task_id.as_str();
        let raw = self.transport.get(&self.config.status_key(task_id)).await?;
        match raw {
            Some(raw) => Ok(Some(raw.parse()?)),
            None => {
                let result = self.transport.get(&self.config.result_key(task_id)).await?;
                Ok(result.map(|_| TaskStatus::Completed))
            }
        }
    }

    pub async fn get_status(&self, task_id: &str) -> Option<TaskStatus> {
        match self.try_get_status(task_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!("Failed to get status of {}: {}", task_id, e);
                None
            }
        }
    }

    /// Store the result and mark the task COMPLETED in one atomic write.
    ///
    /// Returns `Ok(false)` if the task is already FAILED; the result is not
    /// written in that case. A second store replaces the first.
    pub async fn try_store_result(&self, task_id: &str, result: &str) -> QueueResult<bool> {
        self.ensure_open()?;
        let task_id = TaskId::new(task_id)?;
        let task_id = task_id.as_str();
        let status_key = self.config.status_key(task_id);
        let writes = [
            (self.config.result_key(task_id), result.to_string()),
            (status_key.clone(), TaskStatus::Completed.as_str().to_string()),
        ];
        let forbidden: Vec<&str> = TaskStatus::Completed
            .forbidden_predecessors()
            .iter()
            .map(|s| s.as_str())
            .collect();

        let written = self
            .transport
            .set_ex_if(&status_key, &forbidden, &writes, self.config.ttl)
            .await?;

        if written {
            debug!("Stored result for task {}", task_id);
        } else {
            warn!("Result for task {} refused, task already failed", task_id);
        }
        Ok(written)
    }

    pub async fn store_result(&self, task_id: &str, result: &str) -> bool {
        match self.try_store_result(task_id, result).await {
            Ok(written) => written,
            Err(e) => {
                error!("Failed to store result for {}: {}", task_id, e);
                false
            }
        }
    }

    pub async fn try_get_result(&self, task_id: &str) -> QueueResult<Option<String>> {
        self.ensure_open()?;
        let task_id = TaskId::new(task_id)?;
        self.transport.get(&self.config.result_key(task_id.as_str())).await
    }

    /// Stored result; `None` if never written or expired.
    pub async fn get_result(&self, task_id: &str) -> Option<String> {
        match self.try_get_result(task_id).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Failed to get result of {}: {}", task_id, e);
                None
            }
        }
    }

    /// Everything a poller needs in one call.
    pub async fn try_poll(&self, task_id: &str) -> QueueResult<TaskOutcome> {
        Ok(match self.try_get_status(task_id).await? {
            None => TaskOutcome::Unknown,
            Some(TaskStatus::Pending) => TaskOutcome::Pending,
            Some(TaskStatus::Processing) => TaskOutcome::Processing,
            Some(TaskStatus::Failed) => TaskOutcome::Failed,
            Some(TaskStatus::Completed) => match self.try_get_result(task_id).await? {
                Some(result) => TaskOutcome::Completed(result),
                None => TaskOutcome::ResultUnavailable,
            },
        })
    }

    // ------------------------------------------------------------------
    // Reclaim
    // ------------------------------------------------------------------

    async fn maybe_reclaim(&self, consumer: &str) {
        {
            let mut last = self.last_reclaim.lock().await;
            let now = Instant::now();
            if last.is_some_and(|at| now.duration_since(at) < self.config.reclaim.interval) {
                return;
            }
            *last = Some(now);
        }

        if let Err(e) = self.reclaim_as(consumer).await {
            warn!("Reclaim pass failed: {}", e);
        }
    }

    /// Reclaim pass for the default consumer.
    pub async fn reclaim(&self) -> QueueResult<ReclaimReport> {
        let consumer = self.config.consumer.clone();
        self.reclaim_as(&consumer).await
    }

    /// Find entries abandoned by their consumer.
    ///
    /// Entries pending for at least `reclaim.min_idle` and already
    /// delivered `reclaim.max_deliveries` times are poison: `consumer`
    /// claims them, marks their task FAILED and acknowledges them. The
    /// rest are queued for redelivery; `next` claims each one for its own
    /// caller when handing it out, so a queued entry is never claimed
    /// twice by repeated passes.
    pub async fn reclaim_as(&self, consumer: &str) -> QueueResult<ReclaimReport> {
        self.ensure_open()?;
        self.ensure_group().await?;
        let policy = &self.config.reclaim;
        let (stream, group) = (&self.config.stream, &self.config.group);

        let pending = self.transport.pending(stream, group, policy.batch).await?;
        let mut report = ReclaimReport {
            inspected: pending.len(),
            ..Default::default()
        };

        let stale: Vec<_> = pending
            .into_iter()
            .filter(|p| p.idle >= policy.min_idle)
            .collect();
        if stale.is_empty() {
            return Ok(report);
        }

        let (exhausted, retry): (Vec<_>, Vec<_>) = stale
            .into_iter()
            .partition(|p| p.delivery_count >= policy.max_deliveries);

        if !exhausted.is_empty() {
            let claimed = self
                .transport
                .claim(stream, group, consumer, policy.min_idle, &exhausted)
                .await?;
            for entry in claimed {
                let task_id = self.fail_poisoned(&entry).await?;
                report.poisoned.extend(task_id);
            }
        }

        {
            let mut abandoned = self.abandoned.lock().await;
            for entry in retry {
                let id = entry.id;
                if abandoned.push(entry) {
                    report.reclaimed.push(id);
                }
            }
        }

        if !report.reclaimed.is_empty() {
            info!("Queued {} abandoned entries for redelivery", report.reclaimed.len());
        }
        Ok(report)
    }

    async fn fail_poisoned(&self, entry: &LogEntry) -> QueueResult<Option<TaskId>> {
        let task_id = Task::from_fields(entry.id, &entry.fields).ok().map(|t| t.id);
        match &task_id {
            Some(id) => {
                let failed = self.try_set_status(id.as_str(), TaskStatus::Failed).await?;
                warn!(
                    "Task {} abandoned {} times, {}",
                    id,
                    entry.delivery_count.saturating_sub(1),
                    if failed { "marked failed" } else { "already finished" }
                );
            }
            None => error!("Discarding malformed abandoned entry {}", entry.id),
        }
        self.transport
            .ack(&self.config.stream, &self.config.group, entry.id)
            .await?;
        Ok(task_id)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Give every status and result key without an expiry the configured
    /// TTL. Returns the number of keys fixed.
    pub async fn sweep_expiries(&self) -> QueueResult<usize> {
        self.ensure_open()?;
        let mut fixed = 0;

        for prefix in [&self.config.status_prefix, &self.config.result_prefix] {
            for key in self.transport.keys_with_prefix(prefix).await? {
                if self.transport.ttl(&key).await? == KeyTtl::Persistent
                    && self.transport.expire(&key, self.config.ttl).await?
                {
                    fixed += 1;
                }
            }
        }

        if fixed > 0 {
            info!("Applied expiry to {} keys", fixed);
        }
        Ok(fixed)
    }

    // ------------------------------------------------------------------
    // Health and lifecycle
    // ------------------------------------------------------------------

    /// Ping the transport. Independent of queue state otherwise, but a
    /// successful ping also retries a group registration that failed.
    pub async fn health(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let ping = self.transport.ping().await;
        self.observe(&ping).await;
        if let Err(e) = &ping {
            self.degrade(e.to_string()).await;
            return false;
        }
        if let Err(e) = self.ensure_group().await {
            warn!("Consumer group registration still failing: {}", e);
        }
        true
    }

    /// Health as of the last transport call.
    pub async fn health_state(&self) -> HealthState {
        if self.is_closed() {
            return HealthState::Degraded {
                reason: "shut down".to_string(),
            };
        }
        self.health.read().await.clone()
    }

    /// Ping and collect a health snapshot.
    pub async fn health_report(&self) -> HealthReport {
        let alive = self.health().await;
        let pending = if alive {
            match self
                .transport
                .pending(&self.config.stream, &self.config.group, HEALTH_PENDING_LIMIT)
                .await
            {
                Ok(pending) => Some(pending.len()),
                Err(e) => {
                    debug!("Pending count unavailable for health report: {}", e);
                    None
                }
            }
        } else {
            None
        };

        HealthReport {
            timestamp: Utc::now(),
            transport: self.transport.name().to_string(),
            transport_alive: alive,
            group_registered: self.group_ready.load(Ordering::SeqCst),
            consumer: self.config.consumer.clone(),
            state: self.health_state().await,
            pending,
        }
    }

    /// Close the queue and its transport. Later calls fail with
    /// [`QueueError::Unavailable`]; calling it twice is harmless.
    pub async fn shutdown(&self) -> QueueResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let abandoned = self.abandoned.lock().await.len();
        if abandoned > 0 {
            // Still pending in the group; another consumer will reclaim them
            info!("Leaving {} abandoned entries for other consumers", abandoned);
        }
        self.transport.close().await?;
        info!("Task queue shut down");
        Ok(())
    }
}

fn is_missing_group(err: &QueueError) -> bool {
    match err {
        QueueError::Redis(e) => e.code() == Some("NOGROUP"),
        QueueError::Transport(msg) => msg.starts_with("NOGROUP"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReclaimPolicy;
    use crate::retry::RetryPolicy;
    use crate::transport::InMemoryTransport;

    fn config() -> QueueConfig {
        QueueConfig::new("test")
            .with_consumer("worker_test")
            .with_block_timeout(Duration::ZERO)
            .with_connect_retry(RetryPolicy::none())
    }

    async fn queue_with(config: QueueConfig) -> (TaskQueue, Arc<InMemoryTransport>) {
        let transport = Arc::new(InMemoryTransport::new());
        let queue = TaskQueue::connect(transport.clone(), config).await.unwrap();
        (queue, transport)
    }

    async fn queue() -> (TaskQueue, Arc<InMemoryTransport>) {
        queue_with(config()).await
    }

    #[tokio::test]
    async fn test_unknown_before_submit_pending_after() {
        let (queue, _) = queue().await;
        assert_eq!(queue.get_status("t1").await, None);

        assert!(queue.submit("t1", "hello").await);
        assert_eq!(queue.get_status("t1").await, Some(TaskStatus::Pending));
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_id() {
        let (queue, _) = queue().await;
        assert!(!queue.submit("", "x").await);
        assert!(matches!(
            queue.try_submit("a b", "x").await,
            Err(QueueError::InvalidTaskId(_))
        ));
    }

    #[tokio::test]
    async fn test_next_returns_task_fields() {
        let (queue, _) = queue().await;
        let entry_id = queue.try_submit("t1", "payload").await.unwrap();

        let delivery = queue.next(Duration::ZERO).await.unwrap();
        assert_eq!(delivery.task.id.as_str(), "t1");
        assert_eq!(delivery.task.payload, "payload");
        assert_eq!(delivery.task.entry_id, entry_id);
        assert_eq!(delivery.handle.entry_id, entry_id);
        assert_eq!(delivery.handle.consumer, "worker_test");
        assert_eq!(delivery.handle.delivery_count, 1);

        // next does not touch status
        assert_eq!(queue.get_status("t1").await, Some(TaskStatus::Pending));
        assert!(queue.next(Duration::ZERO).await.is_none());
    }

    #[tokio::test]
    async fn test_ack_is_idempotent() {
        let (queue, transport) = queue().await;
        queue.submit("t1", "x").await;
        let delivery = queue.next(Duration::ZERO).await.unwrap();

        assert!(queue.ack(&delivery.handle).await);
        assert!(queue.ack(&delivery.handle).await);
        let pending = transport
            .pending(&queue.config().stream, &queue.config().group, 10)
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_store_result_completes() {
        let (queue, _) = queue().await;
        queue.submit("t1", "x").await;
        assert!(queue.set_status("t1", TaskStatus::Processing).await);
        assert!(queue.store_result("t1", "42").await);

        assert_eq!(queue.get_status("t1").await, Some(TaskStatus::Completed));
        assert_eq!(queue.get_result("t1").await.as_deref(), Some("42"));
        assert_eq!(queue.try_poll("t1").await.unwrap(), TaskOutcome::Completed("42".into()));
    }

    #[tokio::test]
    async fn test_status_never_leaves_terminal_state() {
        let (queue, _) = queue().await;
        queue.submit("t1", "x").await;
        assert!(queue.set_status("t1", TaskStatus::Failed).await);

        assert!(!queue.set_status("t1", TaskStatus::Processing).await);
        assert!(!queue.set_status("t1", TaskStatus::Pending).await);
        assert!(!queue.store_result("t1", "late").await);

        assert_eq!(queue.get_status("t1").await, Some(TaskStatus::Failed));
        assert_eq!(queue.get_result("t1").await, None);
    }

    #[tokio::test]
    async fn test_result_without_status_reads_completed() {
        let (queue, transport) = queue().await;
        transport
            .set_ex(&queue.config().result_key("t1"), "42", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(queue.get_status("t1").await, Some(TaskStatus::Completed));
        assert_eq!(queue.try_poll("t1").await.unwrap(), TaskOutcome::Completed("42".into()));
    }

    #[tokio::test]
    async fn test_completed_without_result_is_distinct() {
        let (queue, transport) = queue().await;
        transport
            .set_ex(&queue.config().status_key("t1"), "completed", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(queue.try_poll("t1").await.unwrap(), TaskOutcome::ResultUnavailable);
    }

    #[tokio::test]
    async fn test_poll_outcomes() {
        let (queue, _) = queue().await;
        assert_eq!(queue.try_poll("nope").await.unwrap(), TaskOutcome::Unknown);

        queue.submit("t1", "x").await;
        assert_eq!(queue.try_poll("t1").await.unwrap(), TaskOutcome::Pending);
        queue.set_status("t1", TaskStatus::Processing).await;
        assert_eq!(queue.try_poll("t1").await.unwrap(), TaskOutcome::Processing);
        queue.set_status("t1", TaskStatus::Failed).await;
        assert_eq!(queue.try_poll("t1").await.unwrap(), TaskOutcome::Failed);
    }

    #[tokio::test]
    async fn test_resubmit_before_claim_resets_to_pending() {
        let (queue, transport) = queue().await;
        assert!(queue.submit("t1", "a").await);
        assert!(queue.submit("t1", "b").await);

        assert_eq!(queue.get_status("t1").await, Some(TaskStatus::Pending));
        assert_eq!(transport.stream_len(&queue.config().stream).await, 2);
    }

    #[tokio::test]
    async fn test_reject_active_policy() {
        let (queue, _) =
            queue_with(config().with_duplicate_policy(DuplicatePolicy::RejectActive)).await;

        assert!(queue.submit("t1", "a").await);
        assert!(matches!(
            queue.try_submit("t1", "b").await,
            Err(QueueError::Duplicate(_))
        ));

        queue.set_status("t1", TaskStatus::Processing).await;
        assert!(!queue.submit("t1", "c").await);

        queue.store_result("t1", "done").await;
        assert!(queue.submit("t1", "d").await);
        assert_eq!(queue.get_status("t1").await, Some(TaskStatus::Pending));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reclaim_redelivers_abandoned_entry() {
        let reclaim = ReclaimPolicy {
            min_idle: Duration::from_secs(30),
            max_deliveries: 3,
            batch: 10,
            interval: Duration::from_secs(3600),
        };
        let (queue, _) = queue_with(config().with_reclaim(reclaim)).await;
        queue.submit("t1", "x").await;

        let first = queue.try_next_as("crashed", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.handle.delivery_count, 1);

        // Not idle long enough yet
        let report = queue.reclaim_as("rescuer").await.unwrap();
        assert_eq!(report.inspected, 1);
        assert!(report.reclaimed.is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        let report = queue.reclaim_as("rescuer").await.unwrap();
        assert_eq!(report.reclaimed, vec![first.handle.entry_id]);

        let again = queue.try_next_as("rescuer", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.task.id.as_str(), "t1");
        assert_eq!(again.handle.delivery_count, 2);
        assert_eq!(again.handle.consumer, "rescuer");
    }

    #[tokio::test(start_paused = true)]
    async fn test_poison_task_fails_after_max_deliveries() {
        let reclaim = ReclaimPolicy {
            min_idle: Duration::from_secs(10),
            max_deliveries: 2,
            batch: 10,
            interval: Duration::from_secs(3600),
        };
        let (queue, transport) = queue_with(config().with_reclaim(reclaim)).await;
        queue.submit("poison", "x").await;

        // Delivery 1, abandoned
        queue.try_next_as("a", Duration::ZERO).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;

        // Delivery 2 through reclaim, abandoned again
        let report = queue.reclaim_as("b").await.unwrap();
        assert_eq!(report.reclaimed.len(), 1);
        let second = queue.try_next_as("b", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(second.handle.delivery_count, 2);
        tokio::time::advance(Duration::from_secs(11)).await;

        // Limit reached: failed and acknowledged instead of redelivered
        let report = queue.reclaim_as("c").await.unwrap();
        assert!(report.reclaimed.is_empty());
        assert_eq!(report.poisoned, vec![TaskId::new("poison").unwrap()]);
        assert_eq!(queue.get_status("poison").await, Some(TaskStatus::Failed));

        let pending = transport
            .pending(&queue.config().stream, &queue.config().group, 10)
            .await
            .unwrap();
        assert!(pending.is_empty());
        assert!(queue.try_next_as("c", Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_entry_is_not_claimed_twice() {
        let reclaim = ReclaimPolicy {
            min_idle: Duration::from_secs(10),
            max_deliveries: 2,
            batch: 10,
            interval: Duration::from_secs(3600),
        };
        let (queue, transport) = queue_with(config().with_reclaim(reclaim)).await;
        queue.submit("a", "x").await;
        queue.submit("b", "y").await;

        queue.try_next_as("dead", Duration::ZERO).await.unwrap().unwrap();
        queue.try_next_as("dead", Duration::ZERO).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;

        let report = queue.reclaim_as("w").await.unwrap();
        assert_eq!(report.reclaimed.len(), 2);
        let first = queue.try_next_as("w", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.task.id.as_str(), "a");
        tokio::time::advance(Duration::from_secs(11)).await;

        // a was delivered twice and abandoned again; b is still waiting
        let report = queue.reclaim_as("w").await.unwrap();
        assert!(report.reclaimed.is_empty());
        assert_eq!(report.poisoned, vec![TaskId::new("a").unwrap()]);
        assert_eq!(queue.get_status("b").await, Some(TaskStatus::Pending));

        let second = queue.try_next_as("w", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(second.task.id.as_str(), "b");
        assert_eq!(second.handle.delivery_count, 2);
        assert!(queue.try_next_as("w", Duration::ZERO).await.unwrap().is_none());

        let pending = transport
            .pending(&queue.config().stream, &queue.config().group, 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].delivery_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_entry_goes_to_the_caller() {
        let reclaim = ReclaimPolicy {
            min_idle: Duration::from_secs(10),
            max_deliveries: 3,
            batch: 10,
            interval: Duration::from_secs(3600),
        };
        let (queue, transport) = queue_with(config().with_reclaim(reclaim)).await;
        queue.submit("t1", "x").await;

        queue.try_next_as("dead", Duration::ZERO).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;

        // One loop runs the pass, a sibling picks the entry up
        queue.reclaim_as("loop-0").await.unwrap();
        let delivery = queue.try_next_as("loop-1", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(delivery.handle.consumer, "loop-1");

        let pending = transport
            .pending(&queue.config().stream, &queue.config().group, 10)
            .await
            .unwrap();
        assert_eq!(pending[0].consumer, "loop-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_acked_entry_is_dropped_from_abandoned() {
        let reclaim = ReclaimPolicy {
            min_idle: Duration::from_secs(10),
            max_deliveries: 3,
            batch: 10,
            interval: Duration::from_secs(3600),
        };
        let (queue, _) = queue_with(config().with_reclaim(reclaim)).await;
        queue.submit("t1", "x").await;

        let slow = queue.try_next_as("slow", Duration::ZERO).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(queue.reclaim().await.unwrap().reclaimed.len(), 1);

        // The original holder finishes before anyone claims it
        assert!(queue.ack(&slow.handle).await);
        assert!(queue.try_next_as("w", Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_keeps_delivery_alive() {
        let reclaim = ReclaimPolicy {
            min_idle: Duration::from_secs(10),
            max_deliveries: 3,
            batch: 10,
            interval: Duration::from_secs(3600),
        };
        let (queue, _) = queue_with(config().with_reclaim(reclaim)).await;
        queue.submit("t1", "x").await;

        let delivery = queue.try_next_as("busy", Duration::ZERO).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(queue.try_touch(&delivery.handle).await.unwrap());
        tokio::time::advance(Duration::from_secs(8)).await;

        let report = queue.reclaim().await.unwrap();
        assert_eq!(report.inspected, 1);
        assert!(report.reclaimed.is_empty());

        queue.ack(&delivery.handle).await;
        assert!(!queue.try_touch(&delivery.handle).await.unwrap());
    }

    #[tokio::test]
    async fn test_status_and_result_reject_invalid_ids() {
        let (queue, _) = queue().await;
        for id in ["", "a b", "line\nbreak"] {
            assert!(matches!(
                queue.try_set_status(id, TaskStatus::Failed).await,
                Err(QueueError::InvalidTaskId(_))
            ));
            assert!(matches!(
                queue.try_get_status(id).await,
                Err(QueueError::InvalidTaskId(_))
            ));
            assert!(matches!(
                queue.try_store_result(id, "r").await,
                Err(QueueError::InvalidTaskId(_))
            ));
            assert!(matches!(
                queue.try_get_result(id).await,
                Err(QueueError::InvalidTaskId(_))
            ));
        }
        assert!(!queue.set_status("a b", TaskStatus::Pending).await);
        assert_eq!(queue.get_result("a b").await, None);
    }

    #[tokio::test]
    async fn test_malformed_entry_is_discarded() {
        let (queue, transport) = queue().await;
        transport
            .append(
                &queue.config().stream,
                &[("garbage".to_string(), "1".to_string())],
            )
            .await
            .unwrap();
        queue.submit("t1", "x").await;

        assert!(queue.try_next(Duration::ZERO).await.unwrap().is_none());
        let delivery = queue.try_next(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(delivery.task.id.as_str(), "t1");
    }

    #[tokio::test]
    async fn test_sweep_applies_missing_expiries() {
        let (queue, transport) = queue().await;
        queue.submit("t1", "x").await;
        transport
            .set_persistent(&queue.config().status_key("legacy"), "completed")
            .await
            .unwrap();
        transport
            .set_persistent(&queue.config().result_key("legacy"), "1")
            .await
            .unwrap();

        assert_eq!(queue.sweep_expiries().await.unwrap(), 2);
        assert_eq!(queue.sweep_expiries().await.unwrap(), 0);
        assert!(matches!(
            transport.ttl(&queue.config().status_key("legacy")).await.unwrap(),
            KeyTtl::Expires(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_expire_after_ttl() {
        let (queue, _) = queue_with(config().with_ttl(Duration::from_secs(60))).await;
        queue.submit("t1", "x").await;
        queue.store_result("t1", "42").await;

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(queue.get_status("t1").await, None);
        assert_eq!(queue.get_result("t1").await, None);
    }

    #[tokio::test]
    async fn test_connect_degraded_then_recovers() {
        let transport = Arc::new(InMemoryTransport::new());
        transport.set_offline(true);

        let queue = TaskQueue::connect(transport.clone(), config()).await.unwrap();
        assert!(!queue.health_state().await.is_healthy());
        assert!(!queue.submit("t1", "x").await);
        assert!(queue.next(Duration::ZERO).await.is_none());

        transport.set_offline(false);
        assert!(queue.health().await);
        assert!(queue.health_state().await.is_healthy());
        assert!(queue.submit("t1", "x").await);
        assert!(queue.next(Duration::ZERO).await.is_some());
    }

    #[tokio::test]
    async fn test_health_report() {
        let (queue, _) = queue().await;
        queue.submit("t1", "x").await;
        queue.next(Duration::ZERO).await.unwrap();

        let report = queue.health_report().await;
        assert!(report.transport_alive);
        assert!(report.group_registered);
        assert_eq!(report.transport, "memory");
        assert_eq!(report.pending, Some(1));
        assert_eq!(report.state, HealthState::Healthy);
    }

    #[tokio::test]
    async fn test_shutdown() {
        let (queue, _) = queue().await;
        queue.shutdown().await.unwrap();
        queue.shutdown().await.unwrap();

        assert!(queue.is_closed());
        assert!(!queue.submit("t1", "x").await);
        assert!(!queue.health().await);
        assert!(matches!(
            queue.try_get_status("t1").await,
            Err(QueueError::Unavailable(_))
        ));
    }

    #[test]
    fn test_missing_group_detection() {
        assert!(is_missing_group(&QueueError::Transport("NOGROUP no group".into())));
        assert!(!is_missing_group(&QueueError::Transport("reset".into())));
    }
}
