//! Optimistic-concurrency retry for writes that race other writers on
//! `resourceVersion`.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::util::errors::Result;

/// Backoff used between conflicting write attempts.
#[derive(Clone, Debug)]
pub struct ConflictRetry {
    /// Total attempts, including the first one.
    pub steps: u32,
    pub initial_delay: Duration,
    pub factor: f64,
    /// Fraction of the delay added as random jitter.
    pub jitter: f64,
}

impl Default for ConflictRetry {
    fn default() -> Self {
        Self {
            steps: 5,
            initial_delay: Duration::from_millis(10),
            factor: 1.0,
            jitter: 0.1,
        }
    }
}

impl ConflictRetry {
    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..self.jitter);
        Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + extra))
    }
}

/// Runs `attempt` until it succeeds, fails with anything other than a
/// conflict, or `retry.steps` attempts have been made.
///
/// The closure receives the attempt number starting at 1. Callers use the
/// original object on attempt 1 and re-read the cache on later attempts
/// before re-applying their mutation to a fresh clone.
pub async fn retry_on_conflict<T, F, Fut>(retry: &ConflictRetry, operation: &str, mut attempt: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = retry.initial_delay;
    let mut step = 1;
    loop {
        match attempt(step).await {
            Err(e) if e.is_conflict() && step < retry.steps => {
                let wait = retry.jittered(delay);
                debug!(operation, attempt = step, delay_ms = wait.as_millis() as u64, "write conflict, retrying");
                tokio::time::sleep(wait).await;
                delay = Duration::from_secs_f64(delay.as_secs_f64() * retry.factor);
                step += 1;
            }
            other => return other,
        }
    }
}
