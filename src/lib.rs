#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # egress-guard
//!
//! A resilient front door for outbound HTTP calls: every request passes through a retrying
//! executor that honours server rate limits, trips a per-service circuit breaker, and keeps
//! track of calls in flight.
//!
//! ## Features
//!
//! - **Retries** with exponential backoff and bounded jitter
//! - **Rate-limit windows** learned from `429` + `Retry-After`, shared by concurrent callers
//! - **Circuit breakers** keyed by service, with lazy half-open recovery and a single trial
//! - **In-flight tracking** with a background reaper for abandoned entries
//! - **Injected transport**: any async closure or `tower::Service`
//!
//! ## Quick Start
//!
//! ```rust
//! use egress_guard::{transport_fn, Request, RequestExecutor, RequestOptions, Response};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let executor = RequestExecutor::builder()
//!         .transport(transport_fn(|_req| async { Ok(Response::new(200)) }))
//!         .max_retries(3)
//!         .retry_delay(Duration::from_millis(100))
//!         .build()
//!         .unwrap();
//!
//!     let result = executor
//!         .request(Request::get("https://api.example.com/v1/items"), RequestOptions::new())
//!         .await;
//!     assert!(result.is_ok());
//! }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod jitter;
pub mod prelude;
pub mod rate_limit;
pub mod reaper;
pub mod request;
pub mod sleeper;
pub mod timeout;
pub mod tracker;
pub mod transport;

// Re-exports
pub use backoff::{Backoff, BackoffError, MAX_BACKOFF};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitOpenError, CircuitState,
    StateChange,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{BuildError, ExecutorConfig, RequestOptions, DEFAULT_RETRY_STATUS_CODES};
pub use error::{CallContext, CancelReason, RequestError};
pub use executor::{RequestExecutor, RequestExecutorBuilder};
pub use jitter::{FixedRandom, Jitter, RandomSource, SeededRandom, ThreadRandom};
pub use rate_limit::{RateLimitRegistry, RateLimitWindow};
pub use reaper::StaleResourceReaper;
pub use request::{Headers, Method, Request, Response};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use timeout::TimeoutPolicy;
pub use tracker::{InFlightTracker, TrackedEntry, TrackedMetadata};
pub use transport::{
    transport_fn, FnTransport, ServiceTransport, Transport, TransportError, TransportErrorKind,
};
pub use tokio_util::sync::CancellationToken;
