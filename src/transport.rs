//! The injected network seam.
//!
//! A [`Transport`] performs exactly one network call. Any completed HTTP exchange, including
//! 4xx/5xx, comes back as `Ok(Response)`; classification happens in the executor. `Err` is
//! reserved for exchanges that produced no response at all.

use crate::request::{Request, Response};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use tower::{Service, ServiceExt};

/// Why a transport call produced no response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The connection was reset or aborted mid-exchange.
    ConnectionAborted,
    /// The request was sent (or attempted) but nothing came back.
    NoResponse,
    /// The per-attempt timeout elapsed.
    TimedOut,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::ConnectionAborted => f.write_str("connection aborted"),
            TransportErrorKind::NoResponse => f.write_str("no response"),
            TransportErrorKind::TimedOut => f.write_str("timed out"),
        }
    }
}

/// Failure surfaced by a transport when no HTTP response exists.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn connection_aborted(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::ConnectionAborted, message)
    }

    pub fn no_response(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::NoResponse, message)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::TimedOut, message)
    }
}

/// Performs one outbound call.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request) -> Result<Response, TransportError>;
}

/// Transport built from an async closure. See [`transport_fn`].
pub struct FnTransport<F> {
    f: F,
}

impl<F> fmt::Debug for FnTransport<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTransport").field("f", &"<fn>").finish()
    }
}

/// Wrap an async closure as a [`Transport`].
///
/// ```rust
/// use egress_guard::{transport_fn, Response};
///
/// let transport = transport_fn(|_req| async { Ok(Response::new(200)) });
/// # let _ = transport;
/// ```
pub fn transport_fn<F, Fut>(f: F) -> FnTransport<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response, TransportError>> + Send,
{
    FnTransport { f }
}

#[async_trait]
impl<F, Fut> Transport for FnTransport<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response, TransportError>> + Send,
{
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        (self.f)(request).await
    }
}

/// Adapts a tower `Service` into a [`Transport`]. Each call drives a fresh clone to readiness.
#[derive(Clone)]
pub struct ServiceTransport<S> {
    inner: S,
}

impl<S> ServiceTransport<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S> fmt::Debug for ServiceTransport<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceTransport").field("inner", &"<service>").finish()
    }
}

#[async_trait]
impl<S> Transport for ServiceTransport<S>
where
    S: Service<Request, Response = Response, Error = TransportError> + Clone + Send + Sync + 'static,
    S::Future: Send,
{
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        self.inner.clone().oneshot(request).await
    }
}
