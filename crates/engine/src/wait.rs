//! Fixed-interval polling with a deadline, used to wait for foreground deletions.

use std::future::Future;
use std::time::Duration;

use patchwork_core::{PatchError, PatchResult};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(1), timeout: Duration::from_secs(20) }
    }
}

impl WaitConfig {
    /// Defaults overridden by `PATCHWORK_DELETE_POLL_INTERVAL_MS` and
    /// `PATCHWORK_DELETE_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let interval = std::env::var("PATCHWORK_DELETE_POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(d.interval);
        let timeout = std::env::var("PATCHWORK_DELETE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(d.timeout);
        Self { interval, timeout }
    }
}

/// Sleep one interval, then run `probe`, until it reports `true` or the
/// timeout elapses. A probe error ends the wait with that error.
pub async fn poll_until<F, Fut>(cfg: &WaitConfig, what: &str, mut probe: F) -> PatchResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PatchResult<bool>>,
{
    let start = Instant::now();
    loop {
        tokio::time::sleep(cfg.interval).await;
        if probe().await? {
            return Ok(());
        }
        let waited = start.elapsed();
        if waited >= cfg.timeout {
            return Err(PatchError::Timeout { what: what.to_string(), waited });
        }
    }
}
