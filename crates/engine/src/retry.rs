//! Bounded retry of read-modify-write sequences on optimistic-concurrency conflicts.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use patchwork_core::{PatchError, PatchResult};
use tracing::warn;

/// Capped exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Total attempts, the first one included.
    pub steps: u32,
    /// Delay before the first retry.
    pub duration: Duration,
    pub factor: f64,
    /// Each delay grows by up to `jitter * delay`.
    pub jitter: f64,
    pub cap: Duration,
}

impl Default for Backoff {
    /// Same schedule as client-go's `retry.DefaultBackoff`.
    fn default() -> Self {
        Self {
            steps: 4,
            duration: Duration::from_millis(10),
            factor: 5.0,
            jitter: 0.1,
            cap: Duration::from_secs(1),
        }
    }
}

impl Backoff {
    /// Base delay before retry number `retry` (1-based), without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(32) as i32;
        let secs = self.duration.as_secs_f64() * self.factor.max(1.0).powi(exp);
        Duration::from_secs_f64(secs.min(self.cap.as_secs_f64()))
    }

    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter <= 0.0 {
            return base;
        }
        base + base.mul_f64(self.jitter * rand::random::<f64>())
    }
}

/// Run `op` until it succeeds, fails with a non-conflict error, or the backoff
/// runs out of steps. The last error is returned when steps are exhausted.
pub async fn retry_on_conflict<T, F, Fut>(backoff: &Backoff, op: F) -> PatchResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PatchResult<T>>,
{
    retry_on(backoff, PatchError::is_conflict, op).await
}

/// Like [`retry_on_conflict`] with a caller-chosen retry predicate.
pub async fn retry_on<T, F, Fut, P>(backoff: &Backoff, retriable: P, mut op: F) -> PatchResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PatchResult<T>>,
    P: Fn(&PatchError) -> bool,
{
    let steps = backoff.steps.max(1);
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < steps && retriable(&e) => {
                let delay = backoff.delay(attempt);
                counter!("patch_conflict_retries_total", 1u64);
                warn!(attempt, steps, error = %e, backoff_ms = delay.as_millis() as u64, "retrying after conflict");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
