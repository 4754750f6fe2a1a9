//! Keyed circuit breaker with lock-free per-key state.
//!
//! One breaker instance tracks any number of service keys (typically one per vendor) so
//! unrelated dependencies fail independently. Each key owns an atomic state machine:
//!
//! - **Closed**: calls dispatch; consecutive failures are counted. Reaching
//!   `failure_threshold` opens the circuit.
//! - **Open**: calls are rejected with [`CircuitOpenError`] until `reset_timeout` has elapsed.
//!   The move to half-open happens lazily on the next call; no timer drives it.
//! - **HalfOpen**: exactly one trial call is admitted, concurrent callers are rejected. Trial
//!   success closes the circuit, trial failure reopens it and restarts the timeout.
//!
//! State-change hooks fire once per transition, from whichever caller won the transition.

use crate::clock::{Clock, MonotonicClock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Current state of one key's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the reset timeout elapses.
    Open,
    /// One trial call decides between Closed and Open.
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("closed"),
            CircuitState::Open => f.write_str("open"),
            CircuitState::HalfOpen => f.write_str("half_open"),
        }
    }
}

/// Validated breaker configuration, shared by every key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: usize,
    reset_timeout: Duration,
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerError {
    #[error("failure_threshold must be > 0 (got {provided})")]
    InvalidFailureThreshold { provided: usize },
    #[error("reset_timeout must be > 0 (got {0:?})")]
    InvalidResetTimeout(Duration),
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: usize, reset_timeout: Duration) -> Result<Self, CircuitBreakerError> {
        if failure_threshold == 0 {
            return Err(CircuitBreakerError::InvalidFailureThreshold { provided: 0 });
        }
        if reset_timeout.is_zero() {
            return Err(CircuitBreakerError::InvalidResetTimeout(reset_timeout));
        }
        Ok(Self { failure_threshold, reset_timeout })
    }

    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    pub fn reset_timeout(&self) -> Duration {
        self.reset_timeout
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 3, reset_timeout: Duration::from_secs(30) }
    }
}

/// Returned instead of invoking the operation when the circuit denies dispatch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "circuit open for service '{service_key}' ({failure_count} failures, open for {open_for:?}); retry in {retry_in:?}"
)]
pub struct CircuitOpenError {
    pub service_key: String,
    pub failure_count: usize,
    /// Time since the circuit opened.
    pub open_for: Duration,
    /// Time until a trial call may be admitted; zero while a trial is in flight.
    pub retry_in: Duration,
}

/// A single state transition, passed to hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub service_key: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

type StateHook = Arc<dyn Fn(&StateChange) + Send + Sync>;

#[derive(Debug)]
struct KeyState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    trial_in_flight: AtomicBool,
}

impl KeyState {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            failure_count: AtomicUsize::new(0),
            opened_at_millis: AtomicU64::new(0),
            trial_in_flight: AtomicBool::new(false),
        }
    }

    fn current(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        self.state
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Releases the half-open trial slot if the trial never reports an outcome (panic or drop).
struct TrialGuard<'a> {
    state: &'a KeyState,
    armed: bool,
}

impl TrialGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.trial_in_flight.store(false, Ordering::Release);
        }
    }
}

/// Circuit breaker keyed by service.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    keys: RwLock<HashMap<String, Arc<KeyState>>>,
    hooks: Vec<StateHook>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            clock: Arc::new(MonotonicClock::default()),
            keys: RwLock::new(HashMap::new()),
            hooks: Vec::new(),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub(crate) fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a hook invoked once per state transition of any key.
    pub fn on_state_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` under the circuit for `service_key`.
    ///
    /// # Errors
    /// Returns `E::from(CircuitOpenError)` without invoking `operation` when the circuit is open
    /// or a half-open trial is already in flight. Errors from `operation` are returned unchanged
    /// after being recorded as a failure.
    pub async fn execute<T, E, Fut, Op>(&self, service_key: &str, operation: Op) -> Result<T, E>
    where
        E: From<CircuitOpenError>,
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        let key = self.key_state(service_key);
        let trial = self.admit(service_key, &key)?;
        let is_trial = trial.is_some();

        let result = operation().await;

        match &result {
            Ok(_) => self.on_success(service_key, &key, is_trial),
            Err(_) => self.on_failure(service_key, &key, is_trial),
        }
        if let Some(guard) = trial {
            guard.disarm();
        }
        result
    }

    /// Record a successful call made outside [`execute`](Self::execute).
    pub fn record_success(&self, service_key: &str) {
        let key = self.key_state(service_key);
        let is_trial = key.current() == CircuitState::HalfOpen;
        self.on_success(service_key, &key, is_trial);
    }

    /// Record a failed call made outside [`execute`](Self::execute).
    pub fn record_failure(&self, service_key: &str) {
        let key = self.key_state(service_key);
        let is_trial = key.current() == CircuitState::HalfOpen;
        self.on_failure(service_key, &key, is_trial);
    }

    /// Stored state of `service_key`. An expired Open circuit reports Open until the next call.
    pub fn state(&self, service_key: &str) -> CircuitState {
        self.existing(service_key).map_or(CircuitState::Closed, |k| k.current())
    }

    /// Consecutive failures recorded for `service_key`.
    pub fn failure_count(&self, service_key: &str) -> usize {
        self.existing(service_key).map_or(0, |k| k.failure_count.load(Ordering::Acquire))
    }

    /// Force `service_key` back to Closed, clearing counters.
    pub fn reset(&self, service_key: &str) {
        let Some(key) = self.existing(service_key) else {
            return;
        };
        let previous = CircuitState::from_u8(key.state.swap(STATE_CLOSED, Ordering::AcqRel));
        key.failure_count.store(0, Ordering::Release);
        key.opened_at_millis.store(0, Ordering::Release);
        key.trial_in_flight.store(false, Ordering::Release);
        if previous != CircuitState::Closed {
            info!(target: "egress_guard::circuit_breaker", service_key, "circuit breaker reset → closed");
            self.emit(service_key, previous, CircuitState::Closed);
        }
    }

    /// Every known key with its state, sorted by key.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<(String, CircuitState)> =
            keys.iter().map(|(k, v)| (k.clone(), v.current())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn existing(&self, service_key: &str) -> Option<Arc<KeyState>> {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).get(service_key).cloned()
    }

    fn key_state(&self, service_key: &str) -> Arc<KeyState> {
        if let Some(key) = self.existing(service_key) {
            return key;
        }
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        keys.entry(service_key.to_string()).or_insert_with(|| Arc::new(KeyState::new())).clone()
    }

    fn admit<'a>(
        &self,
        service_key: &str,
        key: &'a KeyState,
    ) -> Result<Option<TrialGuard<'a>>, CircuitOpenError> {
        loop {
            match key.current() {
                CircuitState::Closed => return Ok(None),
                CircuitState::Open => {
                    let elapsed = self.elapsed_since_open(key);
                    if elapsed < self.config.reset_timeout {
                        return Err(self.open_error(service_key, key, elapsed));
                    }
                    // Claim the trial slot before publishing HalfOpen so no second caller
                    // can slip in between the two stores.
                    if key
                        .trial_in_flight
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        return Err(self.open_error(service_key, key, elapsed));
                    }
                    if key.transition(CircuitState::Open, CircuitState::HalfOpen) {
                        info!(target: "egress_guard::circuit_breaker", service_key, "circuit breaker → half-open");
                        self.emit(service_key, CircuitState::Open, CircuitState::HalfOpen);
                        return Ok(Some(TrialGuard { state: key, armed: true }));
                    }
                    key.trial_in_flight.store(false, Ordering::Release);
                }
                CircuitState::HalfOpen => {
                    if key
                        .trial_in_flight
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        debug!(target: "egress_guard::circuit_breaker", service_key, "circuit breaker: replacing abandoned trial");
                        return Ok(Some(TrialGuard { state: key, armed: true }));
                    }
                    let elapsed = self.elapsed_since_open(key);
                    return Err(self.open_error(service_key, key, elapsed));
                }
            }
        }
    }

    fn on_success(&self, service_key: &str, key: &KeyState, is_trial: bool) {
        match key.current() {
            CircuitState::HalfOpen if is_trial => {
                if key.transition(CircuitState::HalfOpen, CircuitState::Closed) {
                    key.failure_count.store(0, Ordering::Release);
                    key.opened_at_millis.store(0, Ordering::Release);
                    key.trial_in_flight.store(false, Ordering::Release);
                    info!(target: "egress_guard::circuit_breaker", service_key, "circuit breaker → closed");
                    self.emit(service_key, CircuitState::HalfOpen, CircuitState::Closed);
                }
            }
            CircuitState::Closed => key.failure_count.store(0, Ordering::Release),
            // A call admitted before the circuit opened says nothing about recovery.
            _ => {}
        }
    }

    fn on_failure(&self, service_key: &str, key: &KeyState, is_trial: bool) {
        let failures = key.failure_count.fetch_add(1, Ordering::AcqRel).saturating_add(1);

        match key.current() {
            CircuitState::HalfOpen if is_trial => {
                key.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                if key.transition(CircuitState::HalfOpen, CircuitState::Open) {
                    key.trial_in_flight.store(false, Ordering::Release);
                    warn!(target: "egress_guard::circuit_breaker", service_key, failures, "circuit breaker: trial failed → open");
                    self.emit(service_key, CircuitState::HalfOpen, CircuitState::Open);
                }
            }
            CircuitState::Closed if failures >= self.config.failure_threshold => {
                key.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                if key.transition(CircuitState::Closed, CircuitState::Open) {
                    error!(
                        target: "egress_guard::circuit_breaker",
                        service_key,
                        failures,
                        threshold = self.config.failure_threshold,
                        "circuit breaker → open"
                    );
                    self.emit(service_key, CircuitState::Closed, CircuitState::Open);
                }
            }
            _ => {}
        }
    }

    fn elapsed_since_open(&self, key: &KeyState) -> Duration {
        let opened_at = key.opened_at_millis.load(Ordering::Acquire);
        Duration::from_millis(self.clock.now_millis().saturating_sub(opened_at))
    }

    fn open_error(&self, service_key: &str, key: &KeyState, elapsed: Duration) -> CircuitOpenError {
        CircuitOpenError {
            service_key: service_key.to_string(),
            failure_count: key.failure_count.load(Ordering::Acquire),
            open_for: elapsed,
            retry_in: self.config.reset_timeout.saturating_sub(elapsed),
        }
    }

    fn emit(&self, service_key: &str, from: CircuitState, to: CircuitState) {
        if self.hooks.is_empty() {
            return;
        }
        let change = StateChange { service_key: service_key.to_string(), from, to };
        for hook in &self.hooks {
            hook(&change);
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
