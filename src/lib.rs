//! Client-side resilience for cache-mutating operations
//!
//! This crate wraps fallible operations with retry policies and circuit
//! breakers, normalizes every failure into a structured [`CacheError`], and
//! keeps per-feature registries for cache corruption checks and recovery
//! strategies. The [`CacheErrorManager`] is the single entry point: it owns
//! the breaker map, the recovery managers, and a bounded error log used for
//! statistics and diagnostics.
//!
//! ```no_run
//! use cacheguard::{CacheErrorManager, ExecutionConfig};
//!
//! # async fn example() -> Result<(), cacheguard::CacheError> {
//! let manager = CacheErrorManager::new();
//! let config = ExecutionConfig::new("addItem", "equipment");
//!
//! let updated = manager
//!     .execute_with_error_handling(|| async { write_through_cache().await }, &config)
//!     .await?;
//! # let _ = updated;
//! # Ok(())
//! # }
//! # async fn write_through_cache() -> Result<u32, anyhow::Error> { Ok(1) }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod error;
pub mod manager;
pub mod recovery;
pub mod retry;
pub mod state_guard;

// Re-export commonly used types
pub use backoff::BackoffCalculator;
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerBuilder, CircuitBreakerConfig, CircuitBreakerStatus, CircuitState,
};
pub use error::{
    classify_message, infer_severity, normalize_error, CacheError, CacheErrorBuilder,
    CacheErrorSeverity, CacheErrorType, ItemId,
};
pub use manager::{CacheErrorManager, ErrorStatistics, ExecutionConfig, ManagerConfig};
pub use recovery::{CacheRecoveryManager, RecoveryReport};
pub use retry::{RetryExecutor, RetryPolicy, ShouldRetry};
pub use state_guard::{StateUpdateGuard, StateUpdateOutcome};
