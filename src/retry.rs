//! Retry policy and executor
//!
//! Retries are independent of the circuit breaker: the breaker sees an
//! exhausted retry sequence as a single failure event. The terminal error of
//! a sequence is always a [`CacheError`] carrying the attempt count.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::backoff::BackoffCalculator;
use crate::error::{classify_message, CacheError, CacheErrorSeverity};

/// Predicate deciding whether an error is worth retrying
///
/// Authoritative when supplied; the executor's own classification is skipped.
pub type ShouldRetry = dyn Fn(&anyhow::Error) -> bool + Send + Sync;

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,

    /// Initial delay between attempts
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Maximum delay between attempts
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Multiplier applied per attempt to the delay
    pub backoff_multiplier: f64,

    /// Whether to jitter delays by a uniform factor in [0.5, 1.0]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Calculate the delay before the attempt following `attempt` (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        BackoffCalculator::new(
            self.base_delay,
            self.max_delay,
            self.backoff_multiplier,
            self.jitter,
        )
        .calculate_delay(attempt)
    }
}

/// Retry executor
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create a new retry executor with the given policy
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Create with the default policy
    pub fn with_default_policy() -> Self {
        Self::new(RetryPolicy::default())
    }

    /// Execute an operation with bounded exponential-backoff retries
    ///
    /// On exhaustion or a non-retryable error, the last error is normalized
    /// into a [`CacheError`] (an error that already is one passes through
    /// unchanged) and returned.
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        mut operation: F,
        operation_name: &str,
        feature: &str,
        should_retry: Option<&ShouldRetry>,
    ) -> Result<T, CacheError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            debug!(
                "{}/{}: attempt {} of {}",
                feature, operation_name, attempt, max_attempts
            );

            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            "{}/{} succeeded after {} attempts",
                            feature, operation_name, attempt
                        );
                    }
                    return Ok(value);
                }
                Err(error) => {
                    let retryable = match should_retry {
                        Some(predicate) => predicate(&error),
                        None => is_retryable_error(&error),
                    };

                    if attempt >= max_attempts || !retryable {
                        warn!(
                            "{}/{} failed after {} attempt(s): {}",
                            feature, operation_name, attempt, error
                        );
                        return Err(self.wrap_terminal(
                            error,
                            operation_name,
                            feature,
                            attempt,
                        ));
                    }

                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(
                        "{}/{} attempt {} failed: {}. Retrying in {:?}",
                        feature, operation_name, attempt, error, delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn wrap_terminal(
        &self,
        error: anyhow::Error,
        operation_name: &str,
        feature: &str,
        attempts: u32,
    ) -> CacheError {
        match error.downcast::<CacheError>() {
            Ok(cache_error) => cache_error,
            Err(other) => {
                let message = other.to_string();
                CacheError::builder(
                    classify_message(&message),
                    operation_name,
                    feature,
                    &message,
                )
                .severity(CacheErrorSeverity::High)
                .metadata("attempts", attempts)
                .metadata("maxAttempts", self.policy.max_attempts)
                .original_error(other)
                .build()
            }
        }
    }
}

/// Default retry eligibility for errors without an explicit predicate
///
/// A [`CacheError`] answers with its own `retryable` flag. Anything else is
/// matched on message substrings as a best-effort fallback.
fn is_retryable_error(error: &anyhow::Error) -> bool {
    if let Some(cache_error) = error.downcast_ref::<CacheError>() {
        return cache_error.retryable();
    }
    let message = error.to_string().to_lowercase();
    message.contains("network")
        || message.contains("timeout")
        || message.contains("connection")
        || message.contains("fetch")
        || message.contains("failed")
        || message.contains("abort")
}
