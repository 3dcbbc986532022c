//! Cache error manager: the single entry point collaborators use
//!
//! Owns the breaker and recovery-manager registries plus the bounded error
//! log. One manager is constructed at application start and handed to every
//! collaborator; cloning is cheap and shares all state.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus};
use crate::error::{normalize_error, CacheError, CacheErrorSeverity, CacheErrorType, ItemId};
use crate::recovery::CacheRecoveryManager;
use crate::retry::{RetryExecutor, RetryPolicy, ShouldRetry};

const DEFAULT_ERROR_LOG_CAPACITY: usize = 1000;
const RECENT_ERRORS: usize = 10;

/// Manager-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Capacity of the FIFO error log
    pub error_log_capacity: usize,
    /// Defaults for lazily created circuit breakers
    pub circuit_breaker: CircuitBreakerConfig,
    /// Default retry policy when the caller supplies none
    pub retry: RetryPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            error_log_capacity: DEFAULT_ERROR_LOG_CAPACITY,
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Per-call execution configuration
#[derive(Clone)]
pub struct ExecutionConfig {
    pub operation_name: String,
    pub feature: String,
    pub use_circuit_breaker: bool,
    pub use_retry: bool,
    pub retry_policy: Option<RetryPolicy>,
    pub should_retry: Option<Arc<ShouldRetry>>,
    pub user_id: Option<String>,
    pub item_id: Option<ItemId>,
}

impl ExecutionConfig {
    /// Configuration with both retry and circuit breaking enabled
    pub fn new(operation_name: impl Into<String>, feature: impl Into<String>) -> Self {
        Self {
            operation_name: operation_name.into(),
            feature: feature.into(),
            use_circuit_breaker: true,
            use_retry: true,
            retry_policy: None,
            should_retry: None,
            user_id: None,
            item_id: None,
        }
    }

    /// Disable the circuit breaker for this call
    pub fn without_circuit_breaker(mut self) -> Self {
        self.use_circuit_breaker = false;
        self
    }

    /// Disable retries for this call
    pub fn without_retry(mut self) -> Self {
        self.use_retry = false;
        self
    }

    /// Use a specific retry policy instead of the manager default
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Supply an authoritative retry-eligibility predicate
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    /// Attach a user identifier for diagnostics
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach an item identifier for diagnostics
    pub fn item_id(mut self, item_id: impl Into<ItemId>) -> Self {
        self.item_id = Some(item_id.into());
        self
    }
}

/// Aggregate view over the bounded error log
#[derive(Debug, Clone, Serialize)]
pub struct ErrorStatistics {
    pub total_errors: usize,
    pub errors_by_type: HashMap<CacheErrorType, usize>,
    pub errors_by_severity: HashMap<CacheErrorSeverity, usize>,
    pub errors_by_feature: HashMap<String, usize>,
    /// The most recent errors, oldest first
    #[serde(serialize_with = "serialize_recent")]
    pub recent_errors: Vec<CacheError>,
}

fn serialize_recent<S>(errors: &[CacheError], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.collect_seq(errors.iter().map(|e| e.to_json()))
}

struct ManagerInner {
    config: ManagerConfig,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    recovery_managers: Mutex<HashMap<String, Arc<CacheRecoveryManager>>>,
    error_log: Mutex<VecDeque<CacheError>>,
}

/// Shared registry of circuit breakers, recovery managers, and the error log
#[derive(Clone)]
pub struct CacheErrorManager {
    inner: Arc<ManagerInner>,
}

impl Default for CacheErrorManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheErrorManager {
    /// Create a manager with default configuration
    pub fn new() -> Self {
        Self::with_config(ManagerConfig::default())
    }

    /// Create a manager with the given configuration
    pub fn with_config(config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                breakers: Mutex::new(HashMap::new()),
                recovery_managers: Mutex::new(HashMap::new()),
                error_log: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Get or lazily create the breaker for a (feature, operation) pair
    ///
    /// The same pair always yields a handle to the same underlying breaker.
    pub fn circuit_breaker(&self, operation: &str, feature: &str) -> CircuitBreaker {
        let key = format!("{}-{}", feature, operation);
        self.inner
            .breakers
            .lock()
            .entry(key)
            .or_insert_with(|| {
                CircuitBreaker::new(feature, operation, self.inner.config.circuit_breaker.clone())
            })
            .clone()
    }

    /// Get or lazily create the recovery manager for a feature
    pub fn recovery_manager(&self, feature: &str) -> Arc<CacheRecoveryManager> {
        self.inner
            .recovery_managers
            .lock()
            .entry(feature.to_string())
            .or_insert_with(|| Arc::new(CacheRecoveryManager::new(feature)))
            .clone()
    }

    /// Register a corruption check for a feature's cache key
    pub fn register_corruption_check<F>(&self, feature: &str, cache_key: impl Into<String>, check: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.recovery_manager(feature)
            .register_corruption_check(cache_key, check);
    }

    /// Register a recovery strategy for a feature's cache key
    pub fn register_recovery_strategy<F>(
        &self,
        feature: &str,
        cache_key: impl Into<String>,
        recover: F,
    ) where
        F: Fn() -> futures::future::BoxFuture<'static, Result<(), anyhow::Error>>
            + Send
            + Sync
            + 'static,
    {
        self.recovery_manager(feature)
            .register_recovery_strategy(cache_key, recover);
    }

    /// Execute an operation with retry and circuit breaking
    ///
    /// Retries wrap the raw operation and the breaker wraps the retry
    /// sequence, so the breaker counts one failure per exhausted sequence
    /// rather than one per attempt. Every surfaced error is normalized to a
    /// [`CacheError`], appended to the error log, and returned.
    pub async fn execute_with_error_handling<F, Fut, T>(
        &self,
        operation: F,
        config: &ExecutionConfig,
    ) -> Result<T, CacheError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>>,
    {
        let result = if config.use_circuit_breaker {
            let breaker = self.circuit_breaker(&config.operation_name, &config.feature);
            breaker
                .execute(|| async {
                    self.run_attempts(operation, config)
                        .await
                        .map_err(anyhow::Error::new)
                })
                .await
                .map_err(|error| {
                    normalize_error(error, &config.operation_name, &config.feature)
                })
        } else {
            self.run_attempts(operation, config).await
        };

        match result {
            Ok(value) => Ok(value),
            Err(error) => {
                let error =
                    error.with_identifiers(config.user_id.clone(), config.item_id.clone());
                log::error!("{}", error);
                self.append_to_log(error.clone());
                Err(error)
            }
        }
    }

    async fn run_attempts<F, Fut, T>(
        &self,
        mut operation: F,
        config: &ExecutionConfig,
    ) -> Result<T, CacheError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>>,
    {
        if config.use_retry {
            let policy = config
                .retry_policy
                .clone()
                .unwrap_or_else(|| self.inner.config.retry.clone());
            RetryExecutor::new(policy)
                .execute_with_retry(
                    operation,
                    &config.operation_name,
                    &config.feature,
                    config.should_retry.as_deref(),
                )
                .await
        } else {
            operation()
                .await
                .map_err(|error| normalize_error(error, &config.operation_name, &config.feature))
        }
    }

    fn append_to_log(&self, error: CacheError) {
        let mut log = self.inner.error_log.lock();
        log.push_back(error);
        while log.len() > self.inner.config.error_log_capacity {
            log.pop_front();
        }
    }

    /// Aggregate statistics over the error log
    pub fn error_statistics(&self) -> ErrorStatistics {
        let log = self.inner.error_log.lock();
        let mut errors_by_type = HashMap::new();
        let mut errors_by_severity = HashMap::new();
        let mut errors_by_feature = HashMap::new();

        for error in log.iter() {
            *errors_by_type.entry(error.error_type()).or_insert(0) += 1;
            *errors_by_severity.entry(error.severity()).or_insert(0) += 1;
            *errors_by_feature
                .entry(error.feature().to_string())
                .or_insert(0) += 1;
        }

        let recent_errors = log
            .iter()
            .skip(log.len().saturating_sub(RECENT_ERRORS))
            .cloned()
            .collect();

        ErrorStatistics {
            total_errors: log.len(),
            errors_by_type,
            errors_by_severity,
            errors_by_feature,
            recent_errors,
        }
    }

    /// Snapshot of every known breaker's state and counters
    pub fn circuit_breaker_statuses(&self) -> HashMap<String, CircuitBreakerStatus> {
        self.inner
            .breakers
            .lock()
            .iter()
            .map(|(key, breaker)| (key.clone(), breaker.status()))
            .collect()
    }

    /// Drop every logged error
    pub fn clear_error_log(&self) {
        self.inner.error_log.lock().clear();
        log::info!("Cache error log cleared");
    }

    /// Reset every known breaker to closed
    pub fn reset_circuit_breakers(&self) {
        for breaker in self.inner.breakers.lock().values() {
            breaker.reset();
        }
        log::info!("All circuit breakers reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_same_pair_returns_same_breaker() {
        let manager = CacheErrorManager::new();
        let first = manager.circuit_breaker("addItem", "equipment");
        let second = manager.circuit_breaker("addItem", "equipment");

        // Clones share state: forcing one open is visible through the other
        first.force_open(None);
        assert_eq!(second.state(), CircuitState::Open);

        let other = manager.circuit_breaker("deleteItem", "equipment");
        assert_eq!(other.state(), CircuitState::Closed);
    }

    #[test]
    fn test_recovery_manager_is_per_feature_singleton() {
        let manager = CacheErrorManager::new();
        manager.register_corruption_check("equipment", "equipment-list", || false);

        let recovery = manager.recovery_manager("equipment");
        assert_eq!(
            recovery.check_cache_integrity(),
            vec!["equipment-list".to_string()]
        );
        assert!(manager
            .recovery_manager("fixed-costs")
            .check_cache_integrity()
            .is_empty());
    }

    #[tokio::test]
    async fn test_plain_error_is_normalized_and_logged_once() {
        let manager = CacheErrorManager::new();
        let calls = AtomicU32::new(0);
        let config = ExecutionConfig::new("addItem", "equipment")
            .retry_policy(quick_retry())
            .user_id("u-9")
            .item_id(3);

        let result: Result<(), CacheError> = manager
            .execute_with_error_handling(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(anyhow!("Network timeout")) }
                },
                &config,
            )
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.error_type(), CacheErrorType::NetworkError);
        assert_eq!(err.user_id(), Some("u-9"));
        assert_eq!(err.item_id(), Some(&ItemId::Number(3)));

        // Three attempts, one failure event, one log entry
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let stats = manager.error_statistics();
        assert_eq!(stats.total_errors, 1);
        assert_eq!(stats.errors_by_type[&CacheErrorType::NetworkError], 1);
        assert_eq!(stats.errors_by_feature["equipment"], 1);

        let statuses = manager.circuit_breaker_statuses();
        assert_eq!(statuses["equipment-addItem"].failure_count, 1);
    }

    #[tokio::test]
    async fn test_success_leaves_log_untouched() {
        let manager = CacheErrorManager::new();
        let config = ExecutionConfig::new("listItems", "equipment");

        let result = manager
            .execute_with_error_handling(|| async { Ok::<_, anyhow::Error>(21) }, &config)
            .await;
        assert_eq!(result.unwrap(), 21);
        assert_eq!(manager.error_statistics().total_errors, 0);
    }

    #[tokio::test]
    async fn test_existing_cache_error_passes_through() {
        let manager = CacheErrorManager::new();
        let config = ExecutionConfig::new("updateRate", "billable-costs").without_retry();

        let result: Result<(), CacheError> = manager
            .execute_with_error_handling(
                || async {
                    Err(anyhow::Error::new(
                        CacheError::builder(
                            CacheErrorType::ValidationError,
                            "updateRate",
                            "billable-costs",
                            "rate must be positive",
                        )
                        .build(),
                    ))
                },
                &config,
            )
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.error_type(), CacheErrorType::ValidationError);
        assert!(!err.retryable());
        assert_eq!(manager.error_statistics().total_errors, 1);
    }

    #[tokio::test]
    async fn test_breaker_rejection_is_logged_and_not_retried() {
        let manager = CacheErrorManager::new();
        let config = ExecutionConfig::new("addItem", "equipment").retry_policy(quick_retry());

        manager.circuit_breaker("addItem", "equipment").force_open(None);

        let calls = AtomicU32::new(0);
        let result: Result<(), CacheError> = manager
            .execute_with_error_handling(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
                &config,
            )
            .await;

        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!err.retryable());
        assert_eq!(err.metadata()["circuitBreakerState"], "open");
        assert_eq!(manager.error_statistics().total_errors, 1);
    }

    #[tokio::test]
    async fn test_error_log_evicts_oldest_first() {
        let manager = CacheErrorManager::with_config(ManagerConfig {
            error_log_capacity: 3,
            ..ManagerConfig::default()
        });
        let config = ExecutionConfig::new("addItem", "equipment")
            .without_retry()
            .without_circuit_breaker();

        for i in 0..5 {
            let _: Result<(), _> = manager
                .execute_with_error_handling(
                    || async move { Err(anyhow!("boom {}", i)) },
                    &config,
                )
                .await;
        }

        let stats = manager.error_statistics();
        assert_eq!(stats.total_errors, 3);
        assert_eq!(stats.recent_errors[0].message(), "boom 2");
        assert_eq!(stats.recent_errors[2].message(), "boom 4");
    }

    #[tokio::test]
    async fn test_recent_errors_keeps_last_ten_in_insertion_order() {
        let manager = CacheErrorManager::new();
        let config = ExecutionConfig::new("addItem", "equipment")
            .without_retry()
            .without_circuit_breaker();

        for i in 0..12 {
            let _: Result<(), _> = manager
                .execute_with_error_handling(
                    || async move { Err(anyhow!("boom {}", i)) },
                    &config,
                )
                .await;
        }

        let stats = manager.error_statistics();
        assert_eq!(stats.total_errors, 12);
        assert_eq!(stats.recent_errors.len(), 10);
        assert_eq!(stats.recent_errors[0].message(), "boom 2");
        assert_eq!(stats.recent_errors[9].message(), "boom 11");
    }

    #[tokio::test]
    async fn test_administrative_resets() {
        let manager = CacheErrorManager::new();
        let config = ExecutionConfig::new("addItem", "equipment")
            .without_retry()
            .without_circuit_breaker();

        let _: Result<(), _> = manager
            .execute_with_error_handling(|| async { Err(anyhow!("boom")) }, &config)
            .await;
        manager.circuit_breaker("addItem", "equipment").force_open(None);

        manager.clear_error_log();
        manager.reset_circuit_breakers();

        assert_eq!(manager.error_statistics().total_errors, 0);
        assert_eq!(
            manager.circuit_breaker("addItem", "equipment").state(),
            CircuitState::Closed
        );
    }
}
