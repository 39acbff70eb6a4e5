//! Stand-in work function: waits a random time, then returns a random number.

use handoff_log::{info, warn};
use handoff_queue::{QueueError, WorkFn, work_fn};
use rand::Rng;
use serde::Serialize;
use std::time::Duration;

/// Shape of the simulated computation.
#[derive(Debug, Clone, PartialEq)]
pub struct MockModel {
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Probability in `[0, 1]` that a call fails
    pub failure_rate: f64,
}

impl Default for MockModel {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(17),
            failure_rate: 0.05,
        }
    }
}

#[derive(Debug, Serialize)]
struct Prediction<'a> {
    input: &'a str,
    result: String,
}

impl MockModel {
    pub fn new(min_delay: Duration, max_delay: Duration, failure_rate: f64) -> Result<Self, String> {
        if min_delay > max_delay {
            return Err(format!(
                "min delay {:?} exceeds max delay {:?}",
                min_delay, max_delay
            ));
        }
        if !(0.0..=1.0).contains(&failure_rate) {
            return Err(format!("failure rate {} is outside [0, 1]", failure_rate));
        }
        Ok(Self {
            min_delay,
            max_delay,
            failure_rate,
        })
    }

    fn delay(&self) -> Duration {
        let min = self.min_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(min..=max))
    }

    /// `{"input": <payload>, "result": "<1000..=20000>"}` after the delay.
    pub async fn predict(&self, input: &str) -> Result<String, QueueError> {
        let delay = self.delay();
        tokio::time::sleep(delay).await;

        let (failed, value) = {
            let mut rng = rand::rng();
            (
                rng.random_bool(self.failure_rate),
                rng.random_range(1000..=20000u32),
            )
        };
        if failed {
            let preview: String = input.chars().take(50).collect();
            warn!("Prediction failed for input: {}", preview);
            return Err(QueueError::ExecutionFailed(
                "model prediction failed due to internal error".to_string(),
            ));
        }

        info!("Prediction completed in {:?}, result: {}", delay, value);
        Ok(serde_json::to_string(&Prediction {
            input,
            result: value.to_string(),
        })?)
    }

    /// This model as a queue work function.
    pub fn into_work_fn(self) -> WorkFn {
        work_fn(move |task| {
            let model = self.clone();
            async move { model.predict(&task.payload).await }
        })
    }
}
