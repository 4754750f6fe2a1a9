//! Error taxonomy for outbound calls.
//!
//! A [`RequestError`] is built exactly once, at the point where a transport outcome is
//! classified. Callers branch on the variant (or the predicates below), never on message text.

use crate::circuit_breaker::CircuitOpenError;
use crate::config::ExecutorConfig;
use crate::request::{Method, Response};
use crate::transport::TransportError;
use std::fmt;
use std::time::Duration;

/// Where a failed call was headed and how far it got.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub service_key: String,
    pub endpoint: String,
    pub method: Method,
    /// Transport invocations made, including the one that failed.
    pub attempts: usize,
}

impl fmt::Display for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}] after {} attempt(s)",
            self.method, self.endpoint, self.service_key, self.attempts
        )
    }
}

/// Why a call was abandoned by its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller's cancellation token fired.
    Token,
    /// The per-call deadline elapsed.
    DeadlineElapsed,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Token => f.write_str("cancelled by caller"),
            CancelReason::DeadlineElapsed => f.write_str("deadline elapsed"),
        }
    }
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!("; retry after {}ms", d.as_millis()),
        None => String::new(),
    }
}

/// Terminal failure of [`RequestExecutor::request`](crate::RequestExecutor::request).
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// No response: connection aborted, nothing came back, or the attempt timed out.
    #[error("{context}: transport failure: {source}")]
    Transport {
        context: CallContext,
        #[source]
        source: TransportError,
    },
    /// HTTP 429 with the retry budget spent.
    #[error("{context}: rate limit exceeded{}", retry_hint(.retry_after))]
    RateLimited { context: CallContext, retry_after: Option<Duration>, response: Response },
    /// HTTP 5xx.
    #[error("{context}: server error {status}")]
    Server { context: CallContext, status: u16, response: Response },
    /// HTTP 4xx other than 429.
    #[error("{context}: client error {status}")]
    Client { context: CallContext, status: u16, response: Response },
    /// The retry budget ran out on a retryable failure; `last` is that failure.
    #[error("{context}: retries exhausted; last error: {last}")]
    RetriesExhausted {
        context: CallContext,
        #[source]
        last: Box<RequestError>,
    },
    /// The breaker refused to dispatch; no network attempt was made (`attempts` is 0).
    #[error("{context}: {source}")]
    CircuitOpen {
        context: CallContext,
        #[source]
        source: CircuitOpenError,
    },
    /// The caller cancelled or the deadline passed; no further attempts were made.
    #[error("{context}: {reason}")]
    Cancelled { context: CallContext, reason: CancelReason },
}

impl RequestError {
    pub fn context(&self) -> &CallContext {
        match self {
            Self::Transport { context, .. }
            | Self::RateLimited { context, .. }
            | Self::Server { context, .. }
            | Self::Client { context, .. }
            | Self::RetriesExhausted { context, .. }
            | Self::CircuitOpen { context, .. }
            | Self::Cancelled { context, .. } => context,
        }
    }

    pub fn service_key(&self) -> &str {
        &self.context().service_key
    }

    pub fn endpoint(&self) -> &str {
        &self.context().endpoint
    }

    /// Transport invocations made by the call.
    pub fn attempts(&self) -> usize {
        self.context().attempts
    }

    /// HTTP status of the response behind this error, following `RetriesExhausted`.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RateLimited { .. } => Some(429),
            Self::Server { status, .. } | Self::Client { status, .. } => Some(*status),
            Self::RetriesExhausted { last, .. } => last.status(),
            _ => None,
        }
    }

    /// Server or breaker hint on when to try again.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            Self::CircuitOpen { source, .. } => Some(source.retry_in),
            Self::RetriesExhausted { last, .. } => last.retry_after(),
            _ => None,
        }
    }

    /// True for the kinds that are retryable by default: transport failures, 429 and 5xx.
    ///
    /// This looks at the kind only. A `Client` error is `false` here even when its status is
    /// in [`ExecutorConfig::retry_status_codes`](crate::ExecutorConfig), and a `Server` error is
    /// `true` even when its status is not; use [`is_retryable_with`](Self::is_retryable_with)
    /// to ask about a particular configuration.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::RateLimited { .. } | Self::Server { .. })
    }

    /// Whether an executor running `config` would retry this outcome.
    ///
    /// Transport failures always are; responses are retried when their status is configured.
    pub fn is_retryable_with(&self, config: &ExecutorConfig) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::RateLimited { .. } | Self::Server { .. } | Self::Client { .. } => {
                self.status().is_some_and(|status| config.is_retry_status(status))
            }
            _ => false,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Client { .. })
    }

    /// True when the dependency is likely to recover on its own and the caller should report
    /// "temporarily unavailable" rather than a hard failure.
    pub fn is_temporarily_unavailable(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. }
                | Self::RateLimited { .. }
                | Self::RetriesExhausted { .. }
                | Self::Transport { .. }
                | Self::Server { .. }
        )
    }
}
