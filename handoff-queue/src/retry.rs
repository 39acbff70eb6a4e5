//! Bounded retry with exponential backoff and jitter.
//!
//! Used for the connect phase: the queue keeps trying to reach its store for
//! at most `max_elapsed`, then gives up and reports degraded health instead
//! of blocking start-up forever.

use crate::error::QueueResult;
use handoff_log::{debug, warn};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Upper bound for a single delay before jitter.
    pub max_delay: Duration,
    /// Total time budget across all attempts and sleeps.
    pub max_elapsed: Duration,
    /// Attempt cap, including the first.
    pub max_attempts: u32,
    /// Proportional jitter, `0.2` spreads each delay over +/-20%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            max_elapsed: Duration::from_secs(30),
            max_attempts: 10,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no sleeping.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            max_elapsed: Duration::ZERO,
            ..Default::default()
        }
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Un-jittered delay after `attempt` failures (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// `delay` scaled by a random factor in `[1 - jitter, 1 + jitter]`.
    pub fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Duration::from_secs_f64(delay.as_secs_f64() * factor.max(0.0))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt or time budget runs out. The last error is returned.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> QueueResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = QueueResult<T>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded after {} attempts", what, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            if attempt >= self.max_attempts {
                warn!("{} failed after {} attempts: {}", what, attempt, err);
                return Err(err);
            }

            let delay = self.jittered(self.delay_for(attempt - 1));
            if started.elapsed() + delay > self.max_elapsed {
                warn!(
                    "{} gave up after {:?} ({} attempts): {}",
                    what,
                    started.elapsed(),
                    attempt,
                    err
                );
                return Err(err);
            }

            warn!(
                "{} failed (attempt {}/{}): {}; retrying in {:?}",
                what, attempt, self.max_attempts, err, delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(1),
            max_elapsed: Duration::from_secs(10),
            max_attempts: 5,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_exponential_delays_are_capped() {
        let policy = policy();
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_secs(1));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = policy().with_jitter(0.25);
        let base = Duration::from_millis(1000);
        for _ in 0..200 {
            let d = policy.jittered(base);
            assert!(d >= Duration::from_millis(750) && d <= Duration::from_millis(1250));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = policy()
            .retry("connect", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(QueueError::Transport("refused".into()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_at_attempt_cap() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: QueueResult<()> = policy()
            .retry("connect", || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(QueueError::Transport("refused".into())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_respects_total_wait() {
        let policy = policy()
            .with_max_attempts(100)
            .with_max_elapsed(Duration::from_millis(500));
        let started = Instant::now();

        let result: QueueResult<()> = policy
            .retry("connect", || async { Err(QueueError::Transport("refused".into())) })
            .await;

        assert!(result.is_err());
        // 100 + 200 slept, the next 400 would overrun the budget
        assert!(started.elapsed() <= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: QueueResult<()> = policy()
            .retry("connect", || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(QueueError::Config("bad url".into())) }
            })
            .await;

        assert!(matches!(result, Err(QueueError::Config(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
