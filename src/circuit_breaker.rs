//! Circuit breaker pattern implementation
//!
//! One breaker guards one (feature, operation) pair. The breaker opens on
//! failure *rate* rather than a raw failure count: after at least
//! `minimum_requests` requests, it opens once
//! `failure_count / request_count >= failure_threshold / minimum_requests`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{CacheError, CacheErrorSeverity, CacheErrorType};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, operations pass through and are counted
    Closed,
    /// Circuit is open, operations are rejected without being invoked
    Open,
    /// Circuit is half-open, exactly one trial operation is allowed through
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failure count that, relative to `minimum_requests`, defines the
    /// opening failure rate
    pub failure_threshold: u32,

    /// Time to wait before transitioning from open to half-open
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,

    /// After this long without failures, a success discards stale counters
    #[serde(with = "humantime_serde")]
    pub monitoring_period: Duration,

    /// Minimum number of requests before the failure rate is evaluated
    pub minimum_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(300),
            minimum_requests: 10,
        }
    }
}

/// Point-in-time view of a breaker's counters
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    pub request_count: u32,
    pub success_count: u32,
    pub failure_rate: f64,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    request_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    // Deadline set by force_open; takes precedence over recovery_timeout
    open_until: Option<Instant>,
}

/// Thread-safe circuit breaker scoped to one (feature, operation) pair
///
/// Cloning shares the underlying state; all clones observe the same counters.
#[derive(Clone)]
pub struct CircuitBreaker {
    feature: Arc<str>,
    operation: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(
        feature: impl Into<String>,
        operation: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            feature: feature.into().into(),
            operation: operation.into().into(),
            config: Arc::new(config),
            state: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                request_count: 0,
                success_count: 0,
                last_failure_time: None,
                last_failure_at: None,
                open_until: None,
            })),
        }
    }

    /// Create with default configuration
    pub fn with_defaults(feature: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::new(feature, operation, CircuitBreakerConfig::default())
    }

    /// Execute an async operation through the breaker
    ///
    /// When the circuit is open and the recovery timeout has not elapsed, the
    /// operation is not invoked and a non-retryable [`CacheError`] is
    /// returned instead.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, anyhow::Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>>,
    {
        let is_trial = self.try_acquire()?;
        let mut trial_guard = TrialGuard {
            breaker: self,
            armed: is_trial,
        };
        match operation().await {
            Ok(value) => {
                trial_guard.armed = false;
                self.on_success();
                Ok(value)
            }
            Err(error) => {
                trial_guard.armed = false;
                self.on_failure();
                Err(error)
            }
        }
    }

    /// Execute a plain-value operation through the breaker
    ///
    /// Same state machine as [`execute`](Self::execute), for callers that are
    /// not async.
    pub fn execute_sync<F, T>(&self, operation: F) -> Result<T, anyhow::Error>
    where
        F: FnOnce() -> Result<T, anyhow::Error>,
    {
        let is_trial = self.try_acquire()?;
        let mut trial_guard = TrialGuard {
            breaker: self,
            armed: is_trial,
        };
        match operation() {
            Ok(value) => {
                trial_guard.armed = false;
                self.on_success();
                Ok(value)
            }
            Err(error) => {
                trial_guard.armed = false;
                self.on_failure();
                Err(error)
            }
        }
    }

    /// Get the current state
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Get a snapshot of the breaker's counters
    pub fn status(&self) -> CircuitBreakerStatus {
        let state = self.state.lock();
        let failure_rate = if state.request_count > 0 {
            state.failure_count as f64 / state.request_count as f64
        } else {
            0.0
        };
        CircuitBreakerStatus {
            state: state.state,
            failure_count: state.failure_count,
            request_count: state.request_count,
            success_count: state.success_count,
            failure_rate,
        }
    }

    /// Reset the breaker to closed with zeroed counters
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.request_count = 0;
        state.success_count = 0;
        state.last_failure_time = None;
        state.last_failure_at = None;
        state.open_until = None;
        log::info!(
            "Circuit breaker {}-{} reset to closed",
            self.feature,
            self.operation
        );
    }

    /// Force the breaker open, optionally for a fixed duration
    ///
    /// With no duration, the breaker stays open for `recovery_timeout` from
    /// now, like an organic open.
    pub fn force_open(&self, duration: Option<Duration>) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.state = CircuitState::Open;
        state.last_failure_time = Some(now);
        state.last_failure_at = Some(Utc::now());
        state.open_until = duration.map(|d| now + d);
        log::warn!(
            "Circuit breaker {}-{} forced open{}",
            self.feature,
            self.operation,
            duration
                .map(|d| format!(" for {:?}", d))
                .unwrap_or_default()
        );
    }

    // Synchronous admission check; the only place Open -> HalfOpen happens,
    // so the admitted call is always the single trial. Returns whether the
    // admitted call is that trial.
    fn try_acquire(&self) -> Result<bool, CacheError> {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => Ok(false),
            CircuitState::HalfOpen => Err(self.rejection(&state)),
            CircuitState::Open => {
                let now = Instant::now();
                let reopen_at = match (state.open_until, state.last_failure_time) {
                    (Some(deadline), _) => Some(deadline),
                    (None, Some(last)) => Some(last + self.config.recovery_timeout),
                    (None, None) => None,
                };
                match reopen_at {
                    Some(deadline) if now >= deadline => {
                        state.state = CircuitState::HalfOpen;
                        state.open_until = None;
                        log::info!(
                            "Circuit breaker {}-{} half-open, admitting trial call",
                            self.feature,
                            self.operation
                        );
                        Ok(true)
                    }
                    Some(_) => Err(self.rejection(&state)),
                    // Open with no failure record only happens via reset races;
                    // treat as recovered.
                    None => {
                        state.state = CircuitState::HalfOpen;
                        Ok(true)
                    }
                }
            }
        }
    }

    fn on_success(&self) {
        let mut state = self.state.lock();
        state.request_count += 1;
        state.success_count += 1;

        match state.state {
            CircuitState::HalfOpen => {
                state.state = CircuitState::Closed;
                state.failure_count = 0;
                state.request_count = 0;
                state.success_count = 0;
                state.last_failure_time = None;
                state.last_failure_at = None;
                log::info!(
                    "Circuit breaker {}-{} closed after successful trial",
                    self.feature,
                    self.operation
                );
            }
            CircuitState::Closed => {
                if let Some(last_failure) = state.last_failure_time {
                    if last_failure.elapsed() >= self.config.monitoring_period {
                        state.failure_count = 0;
                        state.request_count = 0;
                        state.success_count = 0;
                        state.last_failure_time = None;
                        state.last_failure_at = None;
                        log::debug!(
                            "Circuit breaker {}-{} discarded stale failure history",
                            self.feature,
                            self.operation
                        );
                    }
                }
            }
            CircuitState::Open => {
                // Unreachable: open calls never acquire
            }
        }
    }

    fn on_failure(&self) {
        let mut state = self.state.lock();
        state.request_count += 1;
        state.failure_count += 1;
        state.last_failure_time = Some(Instant::now());
        state.last_failure_at = Some(Utc::now());

        match state.state {
            CircuitState::Closed => {
                if self.should_open(&state) {
                    state.state = CircuitState::Open;
                    log::warn!(
                        "Circuit breaker {}-{} opened at {}/{} failures",
                        self.feature,
                        self.operation,
                        state.failure_count,
                        state.request_count
                    );
                }
            }
            CircuitState::HalfOpen => {
                // Trial failed; counters are retained across the reopen
                state.state = CircuitState::Open;
                log::warn!(
                    "Circuit breaker {}-{} reopened after failed trial",
                    self.feature,
                    self.operation
                );
            }
            CircuitState::Open => {}
        }
    }

    fn should_open(&self, state: &BreakerState) -> bool {
        if state.request_count < self.config.minimum_requests {
            return false;
        }
        let failure_rate = state.failure_count as f64 / state.request_count as f64;
        let threshold_rate =
            self.config.failure_threshold as f64 / self.config.minimum_requests as f64;
        failure_rate >= threshold_rate
    }

    fn rejection(&self, state: &BreakerState) -> CacheError {
        CacheError::builder(
            CacheErrorType::NetworkError,
            self.operation.as_ref(),
            self.feature.as_ref(),
            format!(
                "Circuit breaker is {} for {}-{}",
                state.state, self.feature, self.operation
            ),
        )
        .severity(CacheErrorSeverity::High)
        .retryable(false)
        .metadata("circuitBreakerState", state.state.to_string())
        .metadata("failureCount", state.failure_count)
        .metadata(
            "lastFailureTime",
            state
                .last_failure_at
                .map(|t| serde_json::Value::String(t.to_rfc3339()))
                .unwrap_or(serde_json::Value::Null),
        )
        .build()
    }
}

// Re-opens the breaker if an admitted half-open trial never reports back,
// e.g. the trial future is dropped mid-flight or the operation panics. The
// pre-trial `last_failure_time` is left in place, so the next call is
// admitted as a fresh trial.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.breaker.state.lock();
        if state.state == CircuitState::HalfOpen {
            state.state = CircuitState::Open;
            log::warn!(
                "Circuit breaker {}-{} trial abandoned, reopening",
                self.breaker.feature,
                self.breaker.operation
            );
        }
    }
}

/// Builder for a circuit breaker and its configuration
pub struct CircuitBreakerBuilder {
    feature: String,
    operation: String,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerBuilder {
    /// Create a new builder for the given (feature, operation) pair
    pub fn new(feature: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            operation: operation.into(),
            config: CircuitBreakerConfig::default(),
        }
    }

    /// Set the failure threshold
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Set the recovery timeout before a half-open trial is admitted
    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.recovery_timeout = timeout;
        self
    }

    /// Set the monitoring period after which stale failures are discarded
    pub fn monitoring_period(mut self, period: Duration) -> Self {
        self.config.monitoring_period = period;
        self
    }

    /// Set the minimum requests before the failure rate is evaluated
    pub fn minimum_requests(mut self, min: u32) -> Self {
        self.config.minimum_requests = min;
        self
    }

    /// Build the circuit breaker
    pub fn build(self) -> CircuitBreaker {
        CircuitBreaker::new(self.feature, self.operation, self.config)
    }
}
