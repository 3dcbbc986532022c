//! Circuit breaking for component state updates
//!
//! Reuses the [`CircuitBreaker`] state machine to bound runaway
//! state-transition cycles of a named component, independent of the
//! network-facing breakers. Unlike the manager, the guard never propagates
//! an error: callers get a discriminated outcome they can inspect without
//! unwinding.

use std::future::Future;
use std::time::Duration;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::error::{normalize_error, CacheError};

/// Result of a guarded state update
#[derive(Debug, Clone)]
pub enum StateUpdateOutcome<T> {
    /// The update ran and produced a value
    Completed {
        value: T,
        circuit_state: CircuitState,
    },
    /// The update failed or was rejected by the breaker
    Failed {
        error: CacheError,
        circuit_state: CircuitState,
        /// Whether an immediate caller-side retry is worthwhile
        can_retry: bool,
    },
}

impl<T> StateUpdateOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, StateUpdateOutcome::Completed { .. })
    }

    pub fn circuit_state(&self) -> CircuitState {
        match self {
            StateUpdateOutcome::Completed { circuit_state, .. } => *circuit_state,
            StateUpdateOutcome::Failed { circuit_state, .. } => *circuit_state,
        }
    }

    pub fn value(self) -> Option<T> {
        match self {
            StateUpdateOutcome::Completed { value, .. } => Some(value),
            StateUpdateOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&CacheError> {
        match self {
            StateUpdateOutcome::Completed { .. } => None,
            StateUpdateOutcome::Failed { error, .. } => Some(error),
        }
    }

    pub fn can_retry(&self) -> bool {
        match self {
            StateUpdateOutcome::Completed { .. } => false,
            StateUpdateOutcome::Failed { can_retry, .. } => *can_retry,
        }
    }
}

/// Breaker-backed guard for one component's state-transition function
pub struct StateUpdateGuard {
    feature: String,
    breaker: CircuitBreaker,
}

impl StateUpdateGuard {
    /// Create a guard for the named component with defaults tuned to
    /// render-cycle cadence rather than network timescales
    pub fn new(component_name: &str) -> Self {
        Self::with_config(
            component_name,
            CircuitBreakerConfig {
                failure_threshold: 3,
                recovery_timeout: Duration::from_secs(10),
                monitoring_period: Duration::from_secs(60),
                minimum_requests: 5,
            },
        )
    }

    /// Create a guard with a specific breaker configuration
    pub fn with_config(component_name: &str, config: CircuitBreakerConfig) -> Self {
        let feature = format!("state-updates-{}", component_name);
        let breaker = CircuitBreaker::new(feature.clone(), "state-update", config);
        Self { feature, breaker }
    }

    /// Run an async state update through the breaker
    pub async fn execute_state_update<F, Fut, T>(
        &self,
        operation: F,
        operation_name: &str,
    ) -> StateUpdateOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>>,
    {
        let result = self.breaker.execute(operation).await;
        self.outcome(result, operation_name)
    }

    /// Run a plain-value state update through the breaker
    pub fn execute_state_update_sync<F, T>(
        &self,
        operation: F,
        operation_name: &str,
    ) -> StateUpdateOutcome<T>
    where
        F: FnOnce() -> Result<T, anyhow::Error>,
    {
        let result = self.breaker.execute_sync(operation);
        self.outcome(result, operation_name)
    }

    fn outcome<T>(
        &self,
        result: Result<T, anyhow::Error>,
        operation_name: &str,
    ) -> StateUpdateOutcome<T> {
        let circuit_state = self.breaker.state();
        match result {
            Ok(value) => StateUpdateOutcome::Completed {
                value,
                circuit_state,
            },
            Err(error) => {
                let error = normalize_error(error, operation_name, &self.feature);
                let can_retry = error.retryable() && circuit_state != CircuitState::Open;
                StateUpdateOutcome::Failed {
                    error,
                    circuit_state,
                    can_retry,
                }
            }
        }
    }

    /// Current breaker state
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Force the breaker open, optionally for a fixed duration
    pub fn force_open_circuit_breaker(&self, duration: Option<Duration>) {
        self.breaker.force_open(duration);
    }

    /// Reset the breaker to closed
    pub fn reset_circuit_breaker(&self) {
        self.breaker.reset();
    }
}
