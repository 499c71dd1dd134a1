//! Circuit breaker pattern for fault tolerance.
//!
//! One breaker guards one resource key. Only `network` and `system` failures
//! count; any other classified error means the backend answered and is
//! treated as a success by the breaker.

use crate::errors::{codes, DataResult, ErrorClassifier, RawError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Requests pass through
    Closed,
    /// Requests fail fast
    Open,
    /// A single trial request is allowed through
    HalfOpen,
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before a trial is allowed
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set failure threshold (at least 1)
    pub fn failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = n.max(1);
        self
    }

    /// Set recovery timeout
    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }
}

struct CircuitBreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            trial_in_flight: false,
        }
    }
}

/// Circuit breaker for one resource key
pub struct CircuitBreaker {
    resource_key: String,
    config: CircuitBreakerConfig,
    state: Mutex<CircuitBreakerState>,
    classifier: ErrorClassifier,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
}

/// Admission granted by [`CircuitBreaker::try_acquire`].
///
/// Report the outcome with [`success`](Self::success) or
/// [`failure`](Self::failure). Dropping an unreported half-open trial frees
/// the trial slot without changing state.
#[must_use = "report the outcome of the admitted call"]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    reported: bool,
}

impl CircuitPermit<'_> {
    /// Whether this permit is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Report a successful call
    pub fn success(mut self) {
        self.reported = true;
        self.breaker.on_success(self.trial);
    }

    /// Report a failed call
    pub fn failure(mut self) {
        self.reported = true;
        self.breaker.on_failure(self.trial);
    }

    /// Report the outcome of `result`, counting only backend failures
    pub fn record<T>(self, result: &DataResult<T>) {
        match result {
            Err(error) if error.is_backend_failure() => self.failure(),
            _ => self.success(),
        }
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.reported {
            self.breaker.release_trial();
        }
    }
}

impl CircuitBreaker {
    /// Create a breaker for `resource_key`
    pub fn new(resource_key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            resource_key: resource_key.into(),
            config,
            state: Mutex::new(CircuitBreakerState::default()),
            classifier: ErrorClassifier::new(),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    /// Resource key guarded by this breaker
    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    /// Current state.
    ///
    /// An open circuit whose recovery timeout has passed still reports
    /// `Open`; the move to `HalfOpen` happens on the next call.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Consecutive failures counted while closed
    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    /// Whether a call made now would be admitted
    pub fn is_available(&self) -> bool {
        let state = self.state.lock();
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.recovery_elapsed(&state, Instant::now()),
            CircuitState::HalfOpen => !state.trial_in_flight,
        }
    }

    fn recovery_elapsed(&self, state: &CircuitBreakerState, now: Instant) -> bool {
        state
            .last_failure_at
            .map_or(true, |at| now.saturating_duration_since(at) >= self.config.recovery_timeout)
    }

    /// Ask to make a call.
    ///
    /// Fails fast with a `CIRCUIT_OPEN` error while open, or while another
    /// caller holds the half-open trial.
    pub fn try_acquire(&self) -> DataResult<CircuitPermit<'_>> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut state = self.state.lock();

        let trial = match state.state {
            CircuitState::Closed => Some(false),
            CircuitState::Open if self.recovery_elapsed(&state, now) => {
                info!(resource_key = %self.resource_key, "Circuit breaker transitioning to HALF_OPEN");
                state.state = CircuitState::HalfOpen;
                state.trial_in_flight = true;
                Some(true)
            }
            CircuitState::HalfOpen if !state.trial_in_flight => {
                state.trial_in_flight = true;
                Some(true)
            }
            CircuitState::Open | CircuitState::HalfOpen => None,
        };
        drop(state);

        match trial {
            Some(trial) => Ok(CircuitPermit {
                breaker: self,
                trial,
                reported: false,
            }),
            None => {
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                debug!(resource_key = %self.resource_key, "Circuit open, rejecting call");
                Err(self.classifier.classify(&RawError::new(
                    codes::CIRCUIT_OPEN,
                    format!("circuit open for '{}'", self.resource_key),
                )))
            }
        }
    }

    /// Execute an operation through the breaker
    pub async fn execute<F, Fut, T>(&self, operation: F) -> DataResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DataResult<T>>,
    {
        let permit = self.try_acquire()?;
        let result = operation().await;
        permit.record(&result);
        result
    }

    fn on_success(&self, trial: bool) {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => state.failure_count = 0,
            CircuitState::HalfOpen if trial => {
                info!(resource_key = %self.resource_key, "Circuit breaker transitioning to CLOSED");
                state.state = CircuitState::Closed;
                state.failure_count = 0;
                state.trial_in_flight = false;
            }
            // Late results from calls admitted before the circuit opened.
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut state = self.state.lock();

        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                state.last_failure_at = Some(now);
                if state.failure_count >= self.config.failure_threshold {
                    warn!(
                        resource_key = %self.resource_key,
                        failure_count = state.failure_count,
                        "Circuit breaker transitioning to OPEN"
                    );
                    state.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen if trial => {
                warn!(resource_key = %self.resource_key, "Circuit breaker returning to OPEN from half-open");
                state.state = CircuitState::Open;
                state.last_failure_at = Some(now);
                state.trial_in_flight = false;
            }
            CircuitState::Open => state.last_failure_at = Some(now),
            CircuitState::HalfOpen => {}
        }
    }

    fn release_trial(&self) {
        let mut state = self.state.lock();
        if state.state == CircuitState::HalfOpen {
            debug!(resource_key = %self.resource_key, "Half-open trial abandoned");
            state.trial_in_flight = false;
        }
    }

    /// Force the breaker back to closed
    pub fn reset(&self) {
        *self.state.lock() = CircuitBreakerState::default();
        debug!(resource_key = %self.resource_key, "Circuit breaker reset to CLOSED");
    }

    /// Counters and state
    pub fn metrics(&self) -> CircuitMetrics {
        let total_calls = self.total_calls.load(Ordering::Relaxed);
        let total_failures = self.total_failures.load(Ordering::Relaxed);
        CircuitMetrics {
            state: self.state(),
            total_calls,
            total_failures,
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            failure_rate: if total_calls == 0 {
                0.0
            } else {
                total_failures as f64 / total_calls as f64
            },
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("resource_key", &self.resource_key)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

/// Circuit breaker metrics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitMetrics {
    /// Current state
    pub state: CircuitState,
    /// Calls that asked for admission
    pub total_calls: u64,
    /// Failures recorded
    pub total_failures: u64,
    /// Calls rejected
    pub total_rejections: u64,
    /// Failures per call (0.0 to 1.0)
    pub failure_rate: f64,
}

/// One circuit breaker per resource key, created on first use
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    overrides: Mutex<HashMap<String, CircuitBreakerConfig>>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry whose breakers use `config`
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            default_config: config,
            overrides: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Use a specific configuration for one resource key.
    ///
    /// Replaces that key's breaker, resetting its state.
    pub fn configure_resource(&self, resource_key: &str, config: CircuitBreakerConfig) {
        self.overrides.lock().insert(resource_key.to_string(), config);
        self.breakers.lock().insert(
            resource_key.to_string(),
            Arc::new(CircuitBreaker::new(resource_key, config)),
        );
    }

    /// Breaker for `resource_key`
    pub fn breaker(&self, resource_key: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        if let Some(breaker) = breakers.get(resource_key) {
            return breaker.clone();
        }
        let config = self
            .overrides
            .lock()
            .get(resource_key)
            .copied()
            .unwrap_or(self.default_config);
        let breaker = Arc::new(CircuitBreaker::new(resource_key, config));
        breakers.insert(resource_key.to_string(), breaker.clone());
        breaker
    }

    /// State for `resource_key`; untouched keys are closed
    pub fn state(&self, resource_key: &str) -> CircuitState {
        self.breakers
            .lock()
            .get(resource_key)
            .map_or(CircuitState::Closed, |b| b.state())
    }

    /// States of every tracked key, sorted by key
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let breakers: Vec<_> = self.breakers.lock().values().cloned().collect();
        let mut states: Vec<_> = breakers
            .iter()
            .map(|b| (b.resource_key().to_string(), b.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Reset one breaker
    pub fn reset(&self, resource_key: &str) {
        let breaker = self.breakers.lock().get(resource_key).cloned();
        if let Some(breaker) = breaker {
            breaker.reset();
        }
    }

    /// Reset every breaker
    pub fn reset_all(&self) {
        let breakers: Vec<_> = self.breakers.lock().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("default_config", &self.default_config)
            .field("states", &self.states())
            .finish()
    }
}
