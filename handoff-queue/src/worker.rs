//! Worker loop for processing tasks.

use crate::error::{QueueError, QueueResult};
use crate::queue::TaskQueue;
use crate::status::TaskStatus;
use crate::task::{Delivery, DeliveryHandle, EntryId, Task, TaskId};
use chrono::Utc;
use handoff_log::{debug, error, info, warn};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::error::Elapsed;
use tokio::time::{Instant, MissedTickBehavior};

/// Work function: payload in, result out.
pub type WorkFn =
    Arc<dyn Fn(Task) -> Pin<Box<dyn Future<Output = QueueResult<String>> + Send>> + Send + Sync>;

/// Wrap an async closure as a [`WorkFn`].
///
/// ```
/// use handoff_queue::{work_fn, QueueError};
///
/// let upper = work_fn(|task| async move {
///     if task.payload.is_empty() {
///         return Err(QueueError::ExecutionFailed("empty payload".into()));
///     }
///     Ok(task.payload.to_uppercase())
/// });
/// # let _ = upper;
/// ```
pub fn work_fn<F, Fut>(f: F) -> WorkFn
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = QueueResult<String>> + Send + 'static,
{
    Arc::new(move |task: Task| -> Pin<Box<dyn Future<Output = QueueResult<String>> + Send>> {
        Box::pin(f(task))
    })
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of worker loops in a [`WorkerPool`]
    pub concurrency: usize,

    /// Pause after a failed read before trying again
    pub poll_interval: Duration,

    /// Timeout for one work function call
    pub job_timeout: Duration,

    /// Wait per `next` call; the queue's default when unset
    pub block_timeout: Option<Duration>,

    /// Whether to log each task at info level
    pub log_execution: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(30),
            block_timeout: None,
            log_execution: true,
        }
    }
}

impl WorkerConfig {
    /// Defaults overridden by `PREDICTION_TIMEOUT` (seconds) and
    /// `WORKER_CONCURRENCY`.
    pub fn from_env() -> QueueResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> QueueResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup("PREDICTION_TIMEOUT") {
            let secs: f64 = raw
                .trim()
                .parse()
                .map_err(|e| QueueError::Config(format!("PREDICTION_TIMEOUT={:?}: {}", raw, e)))?;
            if !secs.is_finite() || secs <= 0.0 {
                return Err(QueueError::Config(format!(
                    "PREDICTION_TIMEOUT must be positive, got {}",
                    raw
                )));
            }
            config.job_timeout = Duration::from_secs_f64(secs);
        }
        if let Some(raw) = lookup("WORKER_CONCURRENCY") {
            config.concurrency = raw
                .trim()
                .parse::<usize>()
                .map_err(|e| QueueError::Config(format!("WORKER_CONCURRENCY={:?}: {}", raw, e)))?
                .max(1);
        }
        Ok(config)
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_block_timeout(mut self, block: Duration) -> Self {
        self.block_timeout = Some(block);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Where a worker loop is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Processing,
    Completing,
    Failing,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Processing,
            2 => Self::Completing,
            3 => Self::Failing,
            _ => Self::Idle,
        }
    }
}

/// Result of one [`WorkerLoop::run_once`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Iteration {
    /// Nothing arrived within the block timeout
    Idle,
    /// The store could not be read
    Unavailable { error: String },
    Completed { task_id: TaskId },
    Failed { task_id: TaskId, reason: String },
    /// The task was already finished; the entry was acknowledged unprocessed
    Skipped { task_id: TaskId },
}

/// Counters shared by the loops of a pool.
#[derive(Debug, Default)]
pub struct WorkerStats {
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    processing_micros: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub total_processing_time: Duration,
}

impl StatsSnapshot {
    /// Tasks that ran the work function.
    pub fn processed(&self) -> u64 {
        self.completed + self.failed
    }

    pub fn average_processing_time(&self) -> Duration {
        match u32::try_from(self.processed()) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.total_processing_time / n,
            Err(_) => Duration::ZERO,
        }
    }
}

impl WorkerStats {
    fn record(&self, iteration: &Iteration, elapsed: Duration) {
        let counter = match iteration {
            Iteration::Completed { .. } => &self.completed,
            Iteration::Failed { .. } => &self.failed,
            Iteration::Skipped { .. } => &self.skipped,
            Iteration::Idle | Iteration::Unavailable { .. } => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.processing_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            total_processing_time: Duration::from_micros(
                self.processing_micros.load(Ordering::Relaxed),
            ),
        }
    }
}

/// One consumer: takes a task, runs the work function, records the outcome.
///
/// Per delivery: mark PROCESSING, run with timeout, then either store the
/// result (COMPLETED) or mark FAILED, then acknowledge. The entry is
/// acknowledged exactly once whatever happened. A task already COMPLETED or
/// FAILED when it arrives is acknowledged without running.
pub struct WorkerLoop {
    queue: Arc<TaskQueue>,
    work: WorkFn,
    config: WorkerConfig,
    consumer: String,
    stats: Arc<WorkerStats>,
    state: AtomicU8,
}

impl WorkerLoop {
    /// Worker consuming as the queue's own consumer name.
    pub fn new(queue: Arc<TaskQueue>, work: WorkFn, config: WorkerConfig) -> Self {
        let consumer = queue.consumer().to_string();
        Self {
            queue,
            work,
            config,
            consumer,
            stats: Arc::new(WorkerStats::default()),
            state: AtomicU8::new(WorkerState::Idle as u8),
        }
    }

    /// Consume under a different name.
    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    /// Count into shared stats.
    pub fn with_stats(mut self, stats: Arc<WorkerStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Wait for one task and process it.
    pub async fn run_once(&self) -> Iteration {
        let block = self
            .config
            .block_timeout
            .unwrap_or(self.queue.config().block_timeout);

        match self.queue.try_next_as(&self.consumer, block).await {
            Ok(Some(delivery)) => self.process(delivery).await,
            Ok(None) => Iteration::Idle,
            Err(e) => {
                warn!("[{}] Error reading next task: {}", self.consumer, e);
                Iteration::Unavailable {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn process(&self, delivery: Delivery) -> Iteration {
        let Delivery { handle, task } = delivery;
        let task_id = task.id.clone();
        let started = Instant::now();

        self.set_state(WorkerState::Processing);
        match self
            .queue
            .try_set_status(task_id.as_str(), TaskStatus::Processing)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    "[{}] Task {} already finished, skipping entry {}",
                    self.consumer, task_id, handle.entry_id
                );
                return self
                    .finish(&handle, Iteration::Skipped { task_id }, started)
                    .await;
            }
            // Run anyway; the outcome write below is what matters
            Err(e) => warn!("[{}] Could not mark {} processing: {}", self.consumer, task_id, e),
        }

        if self.config.log_execution {
            info!(
                "[{}] Processing task {} (delivery {})",
                self.consumer, task_id, handle.delivery_count
            );
        } else {
            debug!("[{}] Processing task {}", self.consumer, task_id);
        }

        let outcome = self.run_work(task, &handle).await;

        let iteration = match outcome {
            Ok(Ok(result)) => {
                self.set_state(WorkerState::Completing);
                match self.queue.try_store_result(task_id.as_str(), &result).await {
                    Ok(true) => Iteration::Completed { task_id },
                    // Failed meanwhile, e.g. poisoned by a reclaim pass
                    Ok(false) => Iteration::Skipped { task_id },
                    Err(e) => {
                        error!("[{}] Failed to store result of {}: {}", self.consumer, task_id, e);
                        self.fail(task_id, format!("could not store result: {}", e)).await
                    }
                }
            }
            Ok(Err(e)) => {
                warn!("[{}] Task {} failed: {}", self.consumer, task_id, e);
                self.fail(task_id, e.to_string()).await
            }
            Err(_) => {
                warn!(
                    "[{}] Task {} timed out after {:?}",
                    self.consumer, task_id, self.config.job_timeout
                );
                self.fail(task_id, QueueError::Timeout.to_string()).await
            }
        };

        self.finish(&handle, iteration, started).await
    }

    /// Run the work function under the job timeout, touching the delivery
    /// often enough that no reclaim pass takes it for abandoned.
    async fn run_work(
        &self,
        task: Task,
        handle: &DeliveryHandle,
    ) -> Result<QueueResult<String>, Elapsed> {
        let work = tokio::time::timeout(self.config.job_timeout, (self.work)(task));
        tokio::pin!(work);

        let period = heartbeat_period(self.queue.config().reclaim.min_idle);
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut owned = true;

        loop {
            tokio::select! {
                outcome = &mut work => return outcome,
                _ = heartbeat.tick() => match self.queue.try_touch(handle).await {
                    Ok(true) => {}
                    Ok(false) if owned => {
                        owned = false;
                        warn!(
                            "[{}] Entry {} was taken over by another consumer",
                            self.consumer, handle.entry_id
                        );
                    }
                    Ok(false) => {}
                    Err(e) => debug!(
                        "[{}] Could not refresh entry {}: {}",
                        self.consumer, handle.entry_id, e
                    ),
                },
            }
        }
    }

    async fn fail(&self, task_id: TaskId, reason: String) -> Iteration {
        self.set_state(WorkerState::Failing);
        match self
            .queue
            .try_set_status(task_id.as_str(), TaskStatus::Failed)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!("[{}] Task {} completed elsewhere", self.consumer, task_id),
            Err(e) => error!("[{}] Failed to mark {} failed: {}", self.consumer, task_id, e),
        }
        Iteration::Failed { task_id, reason }
    }

    async fn finish(&self, handle: &DeliveryHandle, iteration: Iteration, started: Instant) -> Iteration {
        if !self.queue.ack(handle).await {
            // Stays pending; a reclaim pass will hand it out again
            warn!("[{}] Entry {} left unacknowledged", self.consumer, handle.entry_id);
        }
        self.stats.record(&iteration, started.elapsed());
        self.set_state(WorkerState::Idle);

        if let Iteration::Completed { task_id } = &iteration
            && self.config.log_execution
        {
            info!("[{}] Task {} completed", self.consumer, task_id);
        }
        iteration
    }

    /// Loop until `shutdown` turns true. The task in hand is finished first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("[{}] Worker started", self.consumer);
        while !*shutdown.borrow() {
            if let Iteration::Unavailable { .. } = self.run_once().await {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        info!("[{}] Worker stopped", self.consumer);
    }
}

/// Several worker loops over one queue, each with its own consumer name.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    consumers: Vec<String>,
    stats: Arc<WorkerStats>,
}

impl WorkerPool {
    /// Start `config.concurrency` loops.
    pub fn spawn(queue: Arc<TaskQueue>, work: WorkFn, config: WorkerConfig) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let stats = Arc::new(WorkerStats::default());
        let concurrency = config.concurrency.max(1);
        let base = queue.consumer().to_string();

        info!("Starting worker pool with concurrency: {}", concurrency);

        let mut handles = Vec::with_capacity(concurrency);
        let mut consumers = Vec::with_capacity(concurrency);
        for i in 0..concurrency {
            let consumer = if concurrency == 1 {
                base.clone()
            } else {
                format!("{}-{}", base, i)
            };
            let worker = WorkerLoop::new(queue.clone(), work.clone(), config.clone())
                .with_consumer(consumer.clone())
                .with_stats(stats.clone());
            let rx = rx.clone();
            handles.push(tokio::spawn(async move { worker.run(rx).await }));
            consumers.push(consumer);
        }

        Self {
            shutdown,
            handles,
            consumers,
            stats,
        }
    }

    pub fn consumers(&self) -> &[String] {
        &self.consumers
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Signal every loop and wait for them to finish their current task.
    pub async fn shutdown(self) {
        info!("Stopping worker pool...");
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Worker loop panicked: {}", e);
            }
        }
        info!("Worker pool stopped");
    }
}

/// Run `work` inline, bypassing the queue, under the same timeout rule as a
/// worker. Nothing is written to the store.
pub async fn execute_sync(work: &WorkFn, payload: &str, timeout: Duration) -> QueueResult<String> {
    let task = Task {
        id: TaskId::generate(),
        payload: payload.to_string(),
        created_at: Utc::now(),
        entry_id: EntryId::MIN,
    };
    debug!("Executing task {} synchronously", task.id);
    tokio::time::timeout(timeout, work(task))
        .await
        .map_err(|_| QueueError::Timeout)?
}

/// Interval between touches of a running delivery: a third of the idle
/// time after which a reclaim pass treats it as abandoned.
fn heartbeat_period(min_idle: Duration) -> Duration {
    (min_idle / 3).max(Duration::from_millis(10))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueueConfig, ReclaimPolicy};
    use crate::retry::RetryPolicy;
    use crate::status::TaskOutcome;
    use crate::transport::InMemoryTransport;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;

    async fn queue() -> Arc<TaskQueue> {
        let config = QueueConfig::new("worker-test")
            .with_consumer("worker_test")
            .with_block_timeout(Duration::ZERO)
            .with_connect_retry(RetryPolicy::none());
        Arc::new(
            TaskQueue::connect(Arc::new(InMemoryTransport::new()), config)
                .await
                .unwrap(),
        )
    }

    fn echo() -> WorkFn {
        work_fn(|task| async move { Ok(format!("echo:{}", task.payload)) })
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            log_execution: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_worker_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.job_timeout, Duration::from_secs(30));
        assert!(config.log_execution);
    }

    #[test]
    fn test_worker_config_from_lookup() {
        let vars: HashMap<&str, &str> =
            [("PREDICTION_TIMEOUT", "2.5"), ("WORKER_CONCURRENCY", "4")].into();
        let config = WorkerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.job_timeout, Duration::from_millis(2500));
        assert_eq!(config.concurrency, 4);

        assert!(WorkerConfig::from_lookup(|_| Some("soon".to_string())).is_err());
        assert!(
            WorkerConfig::from_lookup(|k| (k == "PREDICTION_TIMEOUT").then(|| "0".to_string()))
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_idle_when_empty() {
        let worker = WorkerLoop::new(queue().await, echo(), config());
        assert_eq!(worker.run_once().await, Iteration::Idle);
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[tokio::test]
    async fn test_completes_task() {
        let queue = queue().await;
        queue.submit("t1", "hi").await;

        let worker = WorkerLoop::new(queue.clone(), echo(), config());
        assert_eq!(
            worker.run_once().await,
            Iteration::Completed {
                task_id: TaskId::new("t1").unwrap()
            }
        );
        assert_eq!(
            queue.try_poll("t1").await.unwrap(),
            TaskOutcome::Completed("echo:hi".into())
        );
        assert_eq!(worker.stats().snapshot().completed, 1);

        let pending = queue
            .transport()
            .pending(&queue.config().stream, &queue.config().group, 10)
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_failing_work_marks_failed() {
        let queue = queue().await;
        queue.submit("t1", "x").await;

        let work = work_fn(|_| async { Err(QueueError::ExecutionFailed("boom".into())) });
        let worker = WorkerLoop::new(queue.clone(), work, config());

        match worker.run_once().await {
            Iteration::Failed { task_id, reason } => {
                assert_eq!(task_id.as_str(), "t1");
                assert!(reason.contains("boom"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(queue.get_status("t1").await, Some(TaskStatus::Failed));
        assert_eq!(queue.get_result("t1").await, None);
        assert_eq!(worker.stats().snapshot().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_marks_failed() {
        let queue = queue().await;
        queue.submit("slow", "x").await;

        let work = work_fn(|_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("late".to_string())
        });
        let worker = WorkerLoop::new(
            queue.clone(),
            work,
            config().with_job_timeout(Duration::from_secs(1)),
        );

        assert!(matches!(worker.run_once().await, Iteration::Failed { .. }));
        assert_eq!(queue.get_status("slow").await, Some(TaskStatus::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_task_is_not_reclaimed_while_running() {
        let reclaim = ReclaimPolicy {
            min_idle: Duration::from_secs(10),
            max_deliveries: 3,
            batch: 10,
            interval: Duration::ZERO,
        };
        let config = QueueConfig::new("worker-heartbeat")
            .with_block_timeout(Duration::ZERO)
            .with_connect_retry(RetryPolicy::none())
            .with_reclaim(reclaim);
        let queue = Arc::new(
            TaskQueue::connect(Arc::new(InMemoryTransport::new()), config)
                .await
                .unwrap(),
        );
        queue.submit("t1", "x").await;

        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let work = work_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_secs(20)).await;
                Ok("slow".to_string())
            }
        });

        let a = WorkerLoop::new(queue.clone(), work.clone(), self::config()).with_consumer("a");
        let b = WorkerLoop::new(queue.clone(), work, self::config()).with_consumer("b");
        let running = tokio::spawn(async move { a.run_once().await });

        // Past min_idle since delivery, but the entry was touched meanwhile
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(b.run_once().await, Iteration::Idle);

        assert!(matches!(running.await.unwrap(), Iteration::Completed { .. }));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(queue.get_result("t1").await.as_deref(), Some("slow"));
    }

    #[test]
    fn test_heartbeat_period() {
        assert_eq!(heartbeat_period(Duration::from_secs(60)), Duration::from_secs(20));
        assert_eq!(heartbeat_period(Duration::ZERO), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_skips_finished_task() {
        let queue = queue().await;
        queue.submit("t1", "x").await;
        queue.store_result("t1", "done").await;

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let work = work_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok("again".to_string()) }
        });
        let worker = WorkerLoop::new(queue.clone(), work, config());

        assert!(matches!(worker.run_once().await, Iteration::Skipped { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(queue.get_result("t1").await.as_deref(), Some("done"));
        assert_eq!(worker.stats().snapshot().skipped, 1);
    }

    #[tokio::test]
    async fn test_unavailable_after_shutdown() {
        let queue = queue().await;
        let worker = WorkerLoop::new(queue.clone(), echo(), config());
        queue.shutdown().await.unwrap();
        assert!(matches!(worker.run_once().await, Iteration::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_pool_processes_everything_once() {
        let queue = queue().await;
        for i in 0..20 {
            assert!(queue.submit(&format!("t{}", i), &i.to_string()).await);
        }

        let pool = WorkerPool::spawn(
            queue.clone(),
            echo(),
            config()
                .with_concurrency(4)
                .with_block_timeout(Duration::from_millis(20)),
        );
        assert_eq!(pool.consumers().len(), 4);

        let stats = pool.stats();
        for _ in 0..200 {
            if stats.snapshot().completed == 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown().await;

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.completed, 20);
        assert_eq!(snapshot.failed, 0);
        for i in 0..20 {
            assert_eq!(
                queue.get_result(&format!("t{}", i)).await,
                Some(format!("echo:{}", i))
            );
        }
    }

    #[tokio::test]
    async fn test_execute_sync() {
        let result = execute_sync(&echo(), "now", Duration::from_secs(1)).await;
        assert_eq!(result.unwrap(), "echo:now");
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_sync_timeout() {
        let work = work_fn(|_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(String::new())
        });
        let result = execute_sync(&work, "x", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(QueueError::Timeout)));
    }

    #[test]
    fn test_average_processing_time() {
        let snapshot = StatsSnapshot {
            completed: 3,
            failed: 1,
            skipped: 5,
            total_processing_time: Duration::from_secs(8),
        };
        assert_eq!(snapshot.processed(), 4);
        assert_eq!(snapshot.average_processing_time(), Duration::from_secs(2));
    }
}
