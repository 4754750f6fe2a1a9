//! Convenient re-exports for common egress-guard types.
pub use crate::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitOpenError, CircuitState},
    config::{BuildError, ExecutorConfig, RequestOptions},
    error::{CancelReason, RequestError},
    executor::{RequestExecutor, RequestExecutorBuilder},
    request::{Method, Request, Response},
    transport::{transport_fn, ServiceTransport, Transport, TransportError},
    CancellationToken,
};
