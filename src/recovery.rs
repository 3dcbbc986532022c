//! Cache corruption detection and recovery
//!
//! One [`CacheRecoveryManager`] per feature holds two registries keyed by
//! logical cache key: boolean corruption checks (true = healthy) and async
//! recovery strategies. A detected corruption with no registered strategy is
//! a hard error; recovery is always explicit.

use futures::future::BoxFuture;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::{CacheError, CacheErrorSeverity, CacheErrorType};

/// Health probe for a named unit of cached state; true means healthy
pub type CorruptionCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Remediation routine invoked when a corruption check fails
pub type RecoveryStrategy =
    Arc<dyn Fn() -> BoxFuture<'static, Result<(), anyhow::Error>> + Send + Sync>;

/// Outcome of an auto-recovery pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    pub recovered: Vec<String>,
    pub failed: Vec<String>,
}

struct Registries {
    corruption_checks: HashMap<String, CorruptionCheck>,
    recovery_strategies: HashMap<String, RecoveryStrategy>,
}

/// Per-feature registry of corruption checks and recovery strategies
pub struct CacheRecoveryManager {
    feature: String,
    registries: Mutex<Registries>,
}

impl CacheRecoveryManager {
    /// Create a recovery manager for one feature
    pub fn new(feature: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            registries: Mutex::new(Registries {
                corruption_checks: HashMap::new(),
                recovery_strategies: HashMap::new(),
            }),
        }
    }

    pub fn feature(&self) -> &str {
        &self.feature
    }

    /// Register a corruption check for a cache key, replacing any existing one
    pub fn register_corruption_check<F>(&self, cache_key: impl Into<String>, check: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let cache_key = cache_key.into();
        debug!(
            "Registered corruption check for {}/{}",
            self.feature, cache_key
        );
        self.registries
            .lock()
            .corruption_checks
            .insert(cache_key, Arc::new(check));
    }

    /// Register a recovery strategy for a cache key, replacing any existing one
    pub fn register_recovery_strategy<F>(&self, cache_key: impl Into<String>, recover: F)
    where
        F: Fn() -> BoxFuture<'static, Result<(), anyhow::Error>> + Send + Sync + 'static,
    {
        let cache_key = cache_key.into();
        debug!(
            "Registered recovery strategy for {}/{}",
            self.feature, cache_key
        );
        self.registries
            .lock()
            .recovery_strategies
            .insert(cache_key, Arc::new(recover));
    }

    /// Run every registered corruption check and return the corrupted keys
    ///
    /// A check that panics counts as corruption: exceptions mean "assume
    /// corrupted", never "assume healthy". Checks run on a snapshot of the
    /// registry taken under the lock, so a check is free to register further
    /// entries on the same manager.
    pub fn check_cache_integrity(&self) -> Vec<String> {
        let checks: Vec<(String, CorruptionCheck)> = {
            let registries = self.registries.lock();
            registries
                .corruption_checks
                .iter()
                .map(|(key, check)| (key.clone(), check.clone()))
                .collect()
        };

        let mut corrupted: Vec<String> = checks
            .iter()
            .filter_map(|(key, check)| {
                let healthy = catch_unwind(AssertUnwindSafe(|| check())).unwrap_or_else(|_| {
                    warn!(
                        "Corruption check for {}/{} panicked, treating as corrupted",
                        self.feature, key
                    );
                    false
                });
                if healthy {
                    None
                } else {
                    Some(key.clone())
                }
            })
            .collect();
        corrupted.sort();
        if !corrupted.is_empty() {
            warn!(
                "Integrity scan for {} found {} corrupted key(s): {:?}",
                self.feature,
                corrupted.len(),
                corrupted
            );
        }
        corrupted
    }

    /// Run the registered recovery strategy for one cache key
    ///
    /// A missing strategy is a hard error, never a silent no-op.
    pub async fn recover_cache(&self, cache_key: &str) -> Result<(), CacheError> {
        let strategy = {
            let registries = self.registries.lock();
            match registries.recovery_strategies.get(cache_key) {
                Some(strategy) => strategy.clone(),
                None => {
                    return Err(CacheError::builder(
                        CacheErrorType::CacheCorruption,
                        "recover_cache",
                        &self.feature,
                        format!("No recovery strategy registered for cache key {}", cache_key),
                    )
                    .severity(CacheErrorSeverity::Critical)
                    .metadata("cacheKey", cache_key)
                    .build());
                }
            }
        };

        match strategy().await {
            Ok(()) => {
                info!("Recovered cache key {}/{}", self.feature, cache_key);
                Ok(())
            }
            Err(error) => Err(CacheError::builder(
                CacheErrorType::CacheCorruption,
                "recover_cache",
                &self.feature,
                format!("Recovery failed for cache key {}: {}", cache_key, error),
            )
            .severity(CacheErrorSeverity::High)
            .metadata("cacheKey", cache_key)
            .original_error(error)
            .build()),
        }
    }

    /// Scan for corruption and attempt recovery of every corrupted key
    ///
    /// Keys are recovered independently; one failed recovery never blocks
    /// the attempts on the others.
    pub async fn perform_auto_recovery(&self) -> RecoveryReport {
        let corrupted = self.check_cache_integrity();
        let mut report = RecoveryReport::default();

        for cache_key in corrupted {
            match self.recover_cache(&cache_key).await {
                Ok(()) => report.recovered.push(cache_key),
                Err(error) => {
                    warn!(
                        "Auto-recovery failed for {}/{}: {}",
                        self.feature, cache_key, error
                    );
                    report.failed.push(cache_key);
                }
            }
        }

        if !report.recovered.is_empty() || !report.failed.is_empty() {
            info!(
                "Auto-recovery for {}: {} recovered, {} failed",
                self.feature,
                report.recovered.len(),
                report.failed.len()
            );
        }
        report
    }
}
