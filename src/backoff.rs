//! Exponential backoff used between retry attempts.
//!
//! Retry numbers are 1-based: `delay(1)` is the pause before the first retry and equals the base
//! delay, `delay(n)` is `base × 2^(n-1)`. `delay(0)` is the initial call and never waits.
//!
//! ```rust
//! use std::time::Duration;
//! use egress_guard::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100));
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(3), Duration::from_millis(400));
//! ```
//!
//! Computations that would overflow saturate to [`MAX_BACKOFF`] (1 day).

use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackoffError {
    #[error("max must be greater than zero")]
    MaxMustBePositive,
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
}

/// Doubling backoff with an optional cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Option<Duration>,
}

impl Backoff {
    pub fn exponential(base: Duration) -> Self {
        Self { base, max: None }
    }

    /// Cap every computed delay at `max`. Errors if `max` is zero or below the base.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        if max < self.base {
            return Err(BackoffError::MaxLessThanBase { base: self.base, max });
        }
        self.max = Some(max);
        Ok(self)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    /// Delay before the `retry`-th retry (1-based; 0 = initial call, no delay).
    pub fn delay(&self, retry: usize) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = retry.saturating_sub(1).min(u32::MAX as usize) as u32;
        let multiplier = 2u128.saturating_pow(exponent);
        let nanos = self.base.as_nanos().saturating_mul(multiplier);
        let delay = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
        let capped = self.max.map_or(delay, |m| delay.min(m));
        capped.min(MAX_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_each_retry() {
        let backoff = Backoff::exponential(Duration::from_millis(1000));
        assert_eq!(backoff.delay(1), Duration::from_millis(1000));
        assert_eq!(backoff.delay(2), Duration::from_millis(2000));
        assert_eq!(backoff.delay(3), Duration::from_millis(4000));
        assert_eq!(backoff.delay(4), Duration::from_millis(8000));
    }

    #[test]
    fn respects_max() {
        let backoff =
            Backoff::exponential(Duration::from_millis(100)).with_max(Duration::from_secs(1)).unwrap();
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(40), Duration::from_secs(1));
    }

    #[test]
    fn huge_retry_numbers_saturate() {
        let backoff = Backoff::exponential(Duration::from_secs(1));
        assert_eq!(backoff.delay(1_000_000_000), MAX_BACKOFF);
        assert_eq!(backoff.delay((u32::MAX as usize) + 10), MAX_BACKOFF);
    }

    #[test]
    fn rejects_bad_caps() {
        let base = Backoff::exponential(Duration::from_secs(10));
        assert_eq!(base.with_max(Duration::ZERO), Err(BackoffError::MaxMustBePositive));
        assert!(matches!(
            base.with_max(Duration::from_secs(5)),
            Err(BackoffError::MaxLessThanBase { .. })
        ));
    }

    #[test]
    fn zero_base_never_waits() {
        let backoff = Backoff::exponential(Duration::ZERO);
        assert_eq!(backoff.delay(7), Duration::ZERO);
    }
}
