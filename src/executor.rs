//! The retrying request executor.
//!
//! One top-level call runs as a single [`CircuitBreaker::execute`] under its service key, so the
//! breaker sees exactly one outcome per call no matter how many attempts it took. Inside, each
//! attempt:
//!
//! 1. waits out any live rate-limit window for the endpoint, consuming it only if it is still
//!    the window that was waited on;
//! 2. invokes the transport under the per-attempt timeout;
//! 3. classifies the outcome once.
//!
//! A 429 writes a fresh window (from `Retry-After`, else `retry_delay × 2^retries`) and loops
//! back to step 1, so the window wait is the backoff. Other retryable failures sleep for the
//! jittered exponential delay first. Retries of either kind count against `max_retries`.
//!
//! ```rust,no_run
//! use egress_guard::{transport_fn, Request, RequestExecutor, RequestOptions, Response};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let executor = RequestExecutor::builder()
//!     .transport(transport_fn(|_req| async { Ok(Response::new(200)) }))
//!     .max_retries(2)
//!     .build()?;
//!
//! let response = executor
//!     .request(Request::get("https://api.example.com/v1/items"), RequestOptions::new())
//!     .await?;
//! assert!(response.is_success());
//! # Ok(())
//! # }
//! ```

use crate::backoff::Backoff;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitOpenError, StateChange};
use crate::clock::{Clock, MonotonicClock};
use crate::config::{BuildError, ExecutorConfig, RequestOptions};
use crate::error::{CallContext, CancelReason, RequestError};
use crate::jitter::{Jitter, RandomSource, ThreadRandom};
use crate::rate_limit::RateLimitRegistry;
use crate::reaper::StaleResourceReaper;
use crate::request::{Method, Request, Response};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::timeout::TimeoutPolicy;
use crate::tracker::{InFlightTracker, TrackedEntry, TrackedMetadata, TrackingGuard};
use crate::transport::Transport;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Breaker key used when neither the call, the config, nor the URL provides one.
pub const FALLBACK_SERVICE_KEY: &str = "default";

type StateHook = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// Resilient front door for outbound calls. See the [module docs](self).
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    config: ExecutorConfig,
    breaker: CircuitBreaker,
    rate_limits: Arc<RateLimitRegistry>,
    tracker: Arc<InFlightTracker>,
    sleeper: Arc<dyn Sleeper>,
    random: Arc<dyn RandomSource>,
    jitter: Jitter,
    reaper: Mutex<Option<StaleResourceReaper>>,
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("config", &self.config)
            .field("breaker", &self.breaker)
            .field("in_flight", &self.tracker.len())
            .field("transport", &"<transport>")
            .finish()
    }
}

/// Everything an attempt loop needs to know about one call.
struct CallPlan {
    service_key: String,
    endpoint: String,
    method: Method,
    max_retries: usize,
    timeout: TimeoutPolicy,
    backoff: Backoff,
    cancellation: Option<CancellationToken>,
    deadline: Option<Instant>,
}

impl CallPlan {
    fn context(&self, attempts: usize) -> CallContext {
        CallContext {
            service_key: self.service_key.clone(),
            endpoint: self.endpoint.clone(),
            method: self.method,
            attempts,
        }
    }

    /// Why the call should stop now, if it should.
    fn interrupted(&self) -> Option<CancelReason> {
        if self.cancellation.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Some(CancelReason::Token);
        }
        if self.deadline.is_some_and(|at| Instant::now() >= at) {
            return Some(CancelReason::DeadlineElapsed);
        }
        None
    }
}

/// Result of a breaker-guarded call before the rejection gets its call context.
enum Guarded {
    Open(CircuitOpenError),
    Failed(RequestError),
}

impl From<CircuitOpenError> for Guarded {
    fn from(open: CircuitOpenError) -> Self {
        Guarded::Open(open)
    }
}

impl RequestExecutor {
    pub fn builder() -> RequestExecutorBuilder {
        RequestExecutorBuilder::new()
    }

    /// Send `request`, retrying and honouring rate-limit windows and the breaker.
    ///
    /// # Errors
    /// Only terminal outcomes are returned; see [`RequestError`] for the taxonomy.
    pub async fn request(
        &self,
        request: Request,
        options: RequestOptions,
    ) -> Result<Response, RequestError> {
        let plan = self.plan(&request, options);
        let service_key = plan.service_key.clone();
        let outcome = self
            .breaker
            .execute(&service_key, || async {
                self.run(request, &plan).await.map_err(Guarded::Failed)
            })
            .await;
        outcome.map_err(|guarded| match guarded {
            Guarded::Open(source) => RequestError::CircuitOpen { context: plan.context(0), source },
            Guarded::Failed(error) => error,
        })
    }

    /// Snapshot of calls currently in flight, in dispatch order.
    pub fn in_flight(&self) -> Vec<TrackedEntry> {
        self.tracker.snapshot()
    }

    /// Run one reaper pass now; returns how many stale tracked entries were removed.
    ///
    /// Expired rate-limit windows are purged as well.
    pub fn sweep_stale(&self) -> usize {
        self.rate_limits.purge_expired();
        self.tracker.sweep(self.config.stale_after)
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn rate_limits(&self) -> &RateLimitRegistry {
        &self.rate_limits
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Stop the background reaper. Idempotent; calls keep working afterwards.
    pub fn dispose(&self) {
        let reaper = self.reaper.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(reaper) = reaper {
            reaper.stop();
            debug!(target: "egress_guard::executor", "executor disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.reaper.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    fn plan(&self, request: &Request, options: RequestOptions) -> CallPlan {
        let service_key = options
            .service_key
            .or_else(|| self.config.default_service_key.clone())
            .or_else(|| request.host())
            .unwrap_or_else(|| FALLBACK_SERVICE_KEY.to_string());
        let retry_delay = options.retry_delay.unwrap_or(self.config.retry_delay);
        let backoff = Backoff::exponential(retry_delay);
        let backoff = match self.config.max_retry_delay {
            // A per-call base above the configured cap becomes the cap.
            Some(max) => backoff.with_max(max.max(retry_delay)).unwrap_or(backoff),
            None => backoff,
        };
        CallPlan {
            service_key,
            endpoint: request.endpoint_key(),
            method: request.method,
            max_retries: options.max_retries.unwrap_or(self.config.max_retries),
            timeout: TimeoutPolicy::new(options.timeout.unwrap_or(self.config.timeout)),
            backoff,
            cancellation: options.cancellation,
            // A deadline past the end of representable time is no deadline.
            deadline: options.deadline.and_then(|d| Instant::now().checked_add(d)),
        }
    }

    async fn run(&self, request: Request, plan: &CallPlan) -> Result<Response, RequestError> {
        let guard = TrackingGuard::register(
            self.tracker.clone(),
            TrackedMetadata {
                service_key: plan.service_key.clone(),
                endpoint: plan.endpoint.clone(),
                method: plan.method,
                attempt: 1,
            },
        );
        let mut retries = 0usize;

        loop {
            let attempt = retries + 1;
            guard.set_attempt(attempt);
            self.wait_for_window(plan, attempt - 1).await?;
            if let Some(reason) = plan.interrupted() {
                return Err(self.cancelled(plan, attempt - 1, reason));
            }

            debug!(
                target: "egress_guard::executor",
                service_key = %plan.service_key,
                endpoint = %plan.endpoint,
                attempt,
                "dispatching attempt"
            );
            let sent = plan.timeout.execute(self.transport.send(request.clone()));
            let outcome = self.interruptible(plan, attempt, sent).await?;

            let failure = match outcome {
                Ok(response) if response.status < 400 => return Ok(response),
                Ok(response) if response.status == 429 => {
                    let retry_after = response.retry_after();
                    let delay = retry_after.unwrap_or_else(|| plan.backoff.delay(retries + 1));
                    self.rate_limits.record(&plan.endpoint, delay);
                    if retries >= plan.max_retries || !self.config.is_retry_status(429) {
                        warn!(
                            target: "egress_guard::executor",
                            service_key = %plan.service_key,
                            endpoint = %plan.endpoint,
                            attempt,
                            "rate limit exceeded"
                        );
                        return Err(RequestError::RateLimited {
                            context: plan.context(attempt),
                            retry_after,
                            response,
                        });
                    }
                    warn!(
                        target: "egress_guard::executor",
                        service_key = %plan.service_key,
                        endpoint = %plan.endpoint,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited; waiting for window"
                    );
                    retries += 1;
                    continue;
                }
                Ok(response) => {
                    let status = response.status;
                    let error = if status >= 500 {
                        RequestError::Server { context: plan.context(attempt), status, response }
                    } else {
                        RequestError::Client { context: plan.context(attempt), status, response }
                    };
                    if !self.config.is_retry_status(status) {
                        return Err(error);
                    }
                    error
                }
                Err(source) => RequestError::Transport { context: plan.context(attempt), source },
            };

            if retries >= plan.max_retries {
                warn!(
                    target: "egress_guard::executor",
                    service_key = %plan.service_key,
                    endpoint = %plan.endpoint,
                    attempts = attempt,
                    error = %failure,
                    "retries exhausted"
                );
                return Err(RequestError::RetriesExhausted {
                    context: plan.context(attempt),
                    last: Box::new(failure),
                });
            }

            retries += 1;
            let delay = self.jitter.apply(plan.backoff.delay(retries), self.random.as_ref());
            debug!(
                target: "egress_guard::executor",
                service_key = %plan.service_key,
                endpoint = %plan.endpoint,
                attempt,
                status = failure.status(),
                delay_ms = delay.as_millis() as u64,
                "retrying after failure"
            );
            self.interruptible(plan, attempt, self.sleeper.sleep(delay)).await?;
        }
    }

    /// Wait until the endpoint has no live window. A window is removed only by a waiter that
    /// still sees it unchanged after waking; a refreshed window is waited on again.
    async fn wait_for_window(&self, plan: &CallPlan, attempts: usize) -> Result<(), RequestError> {
        while let Some(window) = self.rate_limits.get(&plan.endpoint) {
            let wait = window.remaining(self.rate_limits.now_millis());
            debug!(
                target: "egress_guard::rate_limit",
                endpoint = %plan.endpoint,
                wait_ms = wait.as_millis() as u64,
                "waiting for rate-limit window"
            );
            self.interruptible(plan, attempts, self.sleeper.sleep(wait)).await?;
            if self.rate_limits.consume(&plan.endpoint, window.stamp()) {
                break;
            }
        }
        Ok(())
    }

    /// Drive `fut` unless the caller's token fires or the deadline passes first.
    async fn interruptible<F: Future>(
        &self,
        plan: &CallPlan,
        attempts: usize,
        fut: F,
    ) -> Result<F::Output, RequestError> {
        let cancelled = async {
            match &plan.cancellation {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let deadline = async {
            match plan.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        let reason = tokio::select! {
            biased;
            _ = cancelled => CancelReason::Token,
            _ = deadline => CancelReason::DeadlineElapsed,
            output = fut => return Ok(output),
        };
        Err(self.cancelled(plan, attempts, reason))
    }

    fn cancelled(&self, plan: &CallPlan, attempts: usize, reason: CancelReason) -> RequestError {
        debug!(
            target: "egress_guard::executor",
            service_key = %plan.service_key,
            endpoint = %plan.endpoint,
            attempts,
            %reason,
            "call cancelled"
        );
        RequestError::Cancelled { context: plan.context(attempts), reason }
    }
}

impl Drop for RequestExecutor {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Builder for [`RequestExecutor`].
pub struct RequestExecutorBuilder {
    transport: Option<Arc<dyn Transport>>,
    config: ExecutorConfig,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    hooks: Vec<StateHook>,
}

impl Default for RequestExecutorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestExecutorBuilder {
    pub fn new() -> Self {
        Self {
            transport: None,
            config: ExecutorConfig::default(),
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(MonotonicClock::default()),
            random: Arc::new(ThreadRandom),
            hooks: Vec::new(),
        }
    }

    pub fn transport<T>(mut self, transport: T) -> Self
    where
        T: Transport + 'static,
    {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Use a transport already shared elsewhere.
    pub fn shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replace the whole configuration. Later setters still apply on top.
    pub fn config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.config.retry_delay = retry_delay;
        self
    }

    pub fn retry_status_codes<I>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = u16>,
    {
        self.config.retry_status_codes = codes.into_iter().collect();
        self
    }

    /// Cap every backoff delay at `max` before jitter is applied.
    pub fn max_retry_delay(mut self, max: Duration) -> Self {
        self.config.max_retry_delay = Some(max);
        self
    }

    pub fn jitter_fraction(mut self, fraction: f64) -> Self {
        self.config.jitter_fraction = fraction;
        self
    }

    pub fn failure_threshold(mut self, threshold: usize) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn reset_timeout(mut self, reset_timeout: Duration) -> Self {
        self.config.reset_timeout = reset_timeout;
        self
    }

    pub fn reaper_interval(mut self, interval: Duration) -> Self {
        self.config.reaper_interval = interval;
        self
    }

    pub fn stale_after(mut self, stale_after: Duration) -> Self {
        self.config.stale_after = stale_after;
        self
    }

    pub fn default_service_key(mut self, service_key: impl Into<String>) -> Self {
        self.config.default_service_key = Some(service_key.into());
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Clock shared by the breaker, the rate-limit registry and the tracker.
    pub fn with_clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_random<R>(mut self, random: R) -> Self
    where
        R: RandomSource + 'static,
    {
        self.random = Arc::new(random);
        self
    }

    /// Observe breaker transitions of every service key.
    pub fn on_state_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.hooks.push(Arc::new(hook));
        self
    }

    /// Validate the configuration and start the reaper on the current tokio runtime.
    pub fn build(self) -> Result<RequestExecutor, BuildError> {
        let transport = self.transport.ok_or(BuildError::MissingTransport)?;
        self.config.validate()?;
        let breaker_config =
            CircuitBreakerConfig::new(self.config.failure_threshold, self.config.reset_timeout)?;
        tokio::runtime::Handle::try_current().map_err(|_| BuildError::NoRuntime)?;

        let mut breaker = CircuitBreaker::new(breaker_config).with_shared_clock(self.clock.clone());
        for hook in self.hooks {
            breaker = breaker.on_state_change(move |change| hook(change));
        }
        let tracker = Arc::new(InFlightTracker::new(self.clock.clone()));
        let rate_limits = Arc::new(RateLimitRegistry::with_clock(self.clock));
        let reaper = StaleResourceReaper::spawn(
            tracker.clone(),
            rate_limits.clone(),
            self.config.reaper_interval,
            self.config.stale_after,
        );

        Ok(RequestExecutor {
            transport,
            jitter: Jitter::proportional(self.config.jitter_fraction),
            breaker,
            rate_limits,
            tracker,
            sleeper: self.sleeper,
            random: self.random,
            config: self.config,
            reaper: Mutex::new(Some(reaper)),
        })
    }
}
