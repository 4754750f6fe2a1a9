//! Background sweep of stale in-flight entries and expired rate-limit windows.

use crate::rate_limit::RateLimitRegistry;
use crate::tracker::InFlightTracker;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default interval between sweeps.
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Default age after which an in-flight entry counts as stale.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30 * 60);

/// Periodic task removing tracked entries older than a threshold, along with rate-limit
/// windows that have already reset.
///
/// It only forgets bookkeeping; the calls themselves are never touched. The task stops on
/// [`stop`](Self::stop) or when the reaper is dropped. An interval too large to schedule means
/// the task never sweeps and just waits to be stopped.
#[derive(Debug)]
pub struct StaleResourceReaper {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl StaleResourceReaper {
    /// Spawn the sweep loop on the current tokio runtime.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime, like `tokio::spawn`.
    pub fn spawn(
        tracker: Arc<InFlightTracker>,
        rate_limits: Arc<RateLimitRegistry>,
        interval: Duration,
        stale_after: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            match tokio::time::Instant::now().checked_add(interval) {
                Some(start) => {
                    let mut ticker = tokio::time::interval_at(start, interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = ticker.tick() => {
                                let removed = tracker.sweep(stale_after);
                                let expired_windows = rate_limits.purge_expired();
                                debug!(
                                    target: "egress_guard::reaper",
                                    removed,
                                    expired_windows,
                                    remaining = tracker.len(),
                                    "stale entry sweep finished"
                                );
                            }
                        }
                    }
                }
                None => {
                    warn!(
                        target: "egress_guard::reaper",
                        interval_secs = interval.as_secs(),
                        "reaper interval out of range; sweeps disabled"
                    );
                    token.cancelled().await;
                }
            }
            info!(target: "egress_guard::reaper", "reaper stopped");
        });
        Self { cancel, handle: Some(handle) }
    }

    /// Signal the task to stop. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True while the background task has not exited.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Stop and wait for the task to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for StaleResourceReaper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
