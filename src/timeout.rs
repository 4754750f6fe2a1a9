//! Per-attempt timeout

use crate::transport::TransportError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Bounds a single transport attempt. Expiry surfaces as a timed-out [`TransportError`], which
/// the executor treats like any other retryable transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    /// Inspect the configured timeout duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub async fn execute<T, Fut>(&self, attempt: Fut) -> Result<T, TransportError>
    where
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let start = Instant::now();

        match tokio::time::timeout(self.duration, attempt).await {
            Ok(result) => result,
            Err(_) => {
                let elapsed = start.elapsed();
                Err(TransportError::timed_out(format!(
                    "no response within {}ms (elapsed {}ms)",
                    self.duration.as_millis(),
                    elapsed.as_millis()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn completes_before_timeout() {
        let timeout = TimeoutPolicy::new(Duration::from_millis(100));
        let result = timeout
            .execute(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, TransportError>(42)
            })
            .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_long_attempt() {
        let timeout = TimeoutPolicy::new(Duration::from_millis(50));
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();

        let result = timeout
            .execute(async move {
                c.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, TransportError>(42)
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::TimedOut);
        assert!(err.message.contains("50ms"));
        assert_eq!(counter.load(Ordering::SeqCst), 1, "attempt should have started");
    }

    #[tokio::test(start_paused = true)]
    async fn propagates_attempt_errors() {
        let timeout = TimeoutPolicy::new(Duration::from_secs(1));
        let result = timeout
            .execute(async { Err::<(), _>(TransportError::connection_aborted("reset by peer")) })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::ConnectionAborted);
        assert_eq!(err.message, "reset by peer");
    }
}
