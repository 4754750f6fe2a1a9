//! Executor configuration and per-call options.
//!
//! [`ExecutorConfig`] holds executor-wide defaults. With the `serde` feature it (de)serializes
//! durations as integer milliseconds, so a host application can load it from JSON or TOML:
//!
//! ```json
//! { "max_retries": 3, "timeout_ms": 30000, "retry_delay_ms": 1000, "reset_timeout_ms": 300000 }
//! ```
//!
//! Missing fields take their defaults.

use crate::backoff::{Backoff, BackoffError};
use crate::circuit_breaker::CircuitBreakerError;
use crate::reaper::{DEFAULT_REAPER_INTERVAL, DEFAULT_STALE_AFTER};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Statuses retried by default.
pub const DEFAULT_RETRY_STATUS_CODES: [u16; 5] = [429, 500, 502, 503, 504];

/// Executor-wide defaults.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ExecutorConfig {
    /// Retries after the initial attempt.
    pub max_retries: usize,
    /// Per-attempt timeout.
    #[cfg_attr(feature = "serde", serde(rename = "timeout_ms", with = "duration_ms"))]
    pub timeout: Duration,
    pub retry_status_codes: BTreeSet<u16>,
    /// Base delay of the exponential backoff.
    #[cfg_attr(feature = "serde", serde(rename = "retry_delay_ms", with = "duration_ms"))]
    pub retry_delay: Duration,
    /// Upper bound on a single backoff delay, applied before jitter. Unset means only the
    /// one-day ceiling applies.
    #[cfg_attr(feature = "serde", serde(rename = "max_retry_delay_ms", with = "opt_duration_ms"))]
    pub max_retry_delay: Option<Duration>,
    /// Backoff delays are spread by up to `±jitter_fraction` of themselves.
    pub jitter_fraction: f64,
    pub failure_threshold: usize,
    #[cfg_attr(feature = "serde", serde(rename = "reset_timeout_ms", with = "duration_ms"))]
    pub reset_timeout: Duration,
    #[cfg_attr(feature = "serde", serde(rename = "reaper_interval_ms", with = "duration_ms"))]
    pub reaper_interval: Duration,
    /// Tracked calls older than this are dropped by the reaper.
    #[cfg_attr(feature = "serde", serde(rename = "stale_after_ms", with = "duration_ms"))]
    pub stale_after: Duration,
    /// Breaker key for calls that name none. Falls back to the URL host, then `"default"`.
    pub default_service_key: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_millis(30_000),
            retry_status_codes: DEFAULT_RETRY_STATUS_CODES.into_iter().collect(),
            retry_delay: Duration::from_millis(1_000),
            max_retry_delay: None,
            jitter_fraction: 0.1,
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(30_000),
            reaper_interval: DEFAULT_REAPER_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
            default_service_key: None,
        }
    }
}

impl ExecutorConfig {
    /// Check every field; called by the executor builder.
    pub fn validate(&self) -> Result<(), BuildError> {
        if self.timeout.is_zero() {
            return Err(BuildError::InvalidTimeout);
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(BuildError::InvalidJitterFraction(self.jitter_fraction));
        }
        if self.reaper_interval.is_zero() {
            return Err(BuildError::InvalidReaperInterval);
        }
        if let Some(max) = self.max_retry_delay {
            Backoff::exponential(self.retry_delay).with_max(max)?;
        }
        if let Some(code) = self.retry_status_codes.iter().find(|c| !(400..=599).contains(*c)) {
            return Err(BuildError::InvalidRetryStatus(*code));
        }
        Ok(())
    }

    pub fn is_retry_status(&self, status: u16) -> bool {
        self.retry_status_codes.contains(&status)
    }
}

/// Errors returned by [`RequestExecutorBuilder::build`](crate::RequestExecutorBuilder::build).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuildError {
    #[error("a transport is required")]
    MissingTransport,
    #[error("the executor must be built inside a tokio runtime")]
    NoRuntime,
    #[error("timeout must be greater than zero")]
    InvalidTimeout,
    #[error("jitter_fraction must be within [0, 1] (got {0})")]
    InvalidJitterFraction(f64),
    #[error("reaper_interval must be greater than zero")]
    InvalidReaperInterval,
    #[error("retry status {0} is not an HTTP error status")]
    InvalidRetryStatus(u16),
    #[error("invalid max_retry_delay: {0}")]
    Backoff(#[from] BackoffError),
    #[error(transparent)]
    CircuitBreaker(#[from] CircuitBreakerError),
}

/// Per-call overrides. Unset fields use the executor's [`ExecutorConfig`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub max_retries: Option<usize>,
    pub timeout: Option<Duration>,
    pub retry_delay: Option<Duration>,
    pub service_key: Option<String>,
    pub cancellation: Option<CancellationToken>,
    /// Bound on the whole call, waits and retries included.
    pub deadline: Option<Duration>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    pub fn service_key(mut self, service_key: impl Into<String>) -> Self {
        self.service_key = Some(service_key.into());
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[cfg(feature = "serde")]
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(feature = "serde")]
mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
