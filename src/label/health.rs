//! Failure gate for the label-service fetch.
//!
//! A minimalist circuit breaker: after `threshold` consecutive failures the
//! gate opens and one probe per `retry` window is re-admitted. Any successful
//! fetch closes the gate fully.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

const DEFAULT_FAILURES_THRESHOLD: u64 = 5;
const DEFAULT_RETRY: Duration = Duration::from_secs(10);

/// Process-global gate shared by all label clients.
static SHARED: Lazy<Arc<HealthGate>> =
    Lazy::new(|| Arc::new(HealthGate::new(DEFAULT_FAILURES_THRESHOLD, DEFAULT_RETRY)));

/// Atomic failure counter with a cool-down timer.
///
/// Healthy iff `failures < threshold`. The transition onto the threshold arms
/// exactly one timer that later lowers the counter to `threshold - 1`,
/// re-admitting a single probe.
pub struct HealthGate {
    failures: AtomicU64,
    threshold: u64,
    retry: Duration,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl HealthGate {
    pub fn new(threshold: u64, retry: Duration) -> Self {
        Self {
            failures: AtomicU64::new(0),
            threshold: threshold.max(1),
            retry,
            timer: Mutex::new(None),
        }
    }

    /// The gate shared by every label client in the process.
    pub fn shared() -> Arc<HealthGate> {
        SHARED.clone()
    }

    /// Records a failure and returns the post-increment count.
    ///
    /// Arms the re-arm timer only on the increment that lands exactly on the
    /// threshold, so concurrent failure bursts schedule one timer per trip.
    /// Must be called from within a tokio runtime.
    pub fn count_failure(self: &Arc<Self>) -> u64 {
        let count = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if count == self.threshold {
            let gate = Arc::clone(self);
            let handle = tokio::spawn(async move {
                tokio::time::sleep(gate.retry).await;
                // Re-admit one probe.
                gate.failures.store(gate.threshold - 1, Ordering::Relaxed);
            });
            *self.timer.lock() = Some(handle);
        }
        count
    }

    /// Closes the gate after a successful fetch, cancelling any armed timer.
    pub fn reset(&self) {
        if self.failures.swap(0, Ordering::Relaxed) != 0 {
            if let Some(timer) = self.timer.lock().take() {
                timer.abort();
            }
        }
    }

    pub fn maybe_healthy(&self) -> bool {
        self.failures.load(Ordering::Relaxed) < self.threshold
    }
}
