//! Bounded polling for readiness checks.
//!
//! Every readiness wait in the orchestrator (node configured, taints cleared,
//! pods running, node ready after restore) goes through [`retry_until`]. The
//! probe reports either a ready value or the condition still blocking, and
//! that condition is what ends up in the timeout error.
//!
//! # Example
//!
//! ```ignore
//! let pods = retry_until("running pods", &PollPolicy::new(5, Some(600)), || async {
//!     let running = runtime.running_pods().await?;
//!     Ok(if running > 0 { Probe::Ready(running) } else { Probe::Pending("no running pods".into()) })
//! })
//! .await?;
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Fixed-interval polling with an optional overall timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollPolicy {
    /// Seconds between probes
    pub interval_secs: u64,
    /// Give up after this many seconds (`None` waits forever)
    pub timeout_secs: Option<u64>,
}

impl PollPolicy {
    pub const fn new(interval_secs: u64, timeout_secs: Option<u64>) -> Self {
        Self {
            interval_secs,
            timeout_secs,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Outcome of one readiness probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    Ready(T),
    /// Not ready yet; carries the condition that is still blocking
    Pending(String),
}

/// Poll `probe` every `policy.interval` until it is ready.
///
/// Probe errors are returned immediately. When the timeout is exhausted the
/// last pending reason is reported in [`Error::Timeout`].
pub async fn retry_until<F, Fut, T>(operation: &str, policy: &PollPolicy, mut probe: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Probe<T>>>,
{
    let started = Instant::now();
    let interval = policy.interval();

    loop {
        let blocker = match probe().await? {
            Probe::Ready(value) => return Ok(value),
            Probe::Pending(blocker) => blocker,
        };

        let elapsed = started.elapsed();
        debug!(
            operation = %operation,
            blocker = %blocker,
            elapsed_secs = elapsed.as_secs(),
            "Still waiting"
        );

        match policy.timeout() {
            Some(timeout) if elapsed >= timeout => {
                return Err(Error::Timeout {
                    operation: operation.to_string(),
                    blocker,
                    waited: elapsed,
                });
            }
            Some(timeout) => tokio::time::sleep(interval.min(timeout - elapsed)).await,
            None => tokio::time::sleep(interval).await,
        }
    }
}
