//! Structured cache error model
//!
//! Every failure surfaced by this crate is a [`CacheError`]: a closed
//! taxonomy plus severity, retryability, feature/operation bucketing, and
//! an opaque metadata bag for diagnostics. The causing error is preserved
//! for chaining but only its message is ever serialized.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Closed error taxonomy for cache operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheErrorType {
    NetworkError,
    ValidationError,
    CacheCorruption,
    TimeoutError,
    PermissionError,
    QuotaExceeded,
    ConcurrentModification,
    UnknownError,
}

impl CacheErrorType {
    /// Whether errors of this type are retryable unless explicitly overridden
    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            CacheErrorType::NetworkError
                | CacheErrorType::TimeoutError
                | CacheErrorType::ConcurrentModification
        )
    }
}

impl std::fmt::Display for CacheErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CacheErrorType::NetworkError => "NETWORK_ERROR",
            CacheErrorType::ValidationError => "VALIDATION_ERROR",
            CacheErrorType::CacheCorruption => "CACHE_CORRUPTION",
            CacheErrorType::TimeoutError => "TIMEOUT_ERROR",
            CacheErrorType::PermissionError => "PERMISSION_ERROR",
            CacheErrorType::QuotaExceeded => "QUOTA_EXCEEDED",
            CacheErrorType::ConcurrentModification => "CONCURRENT_MODIFICATION",
            CacheErrorType::UnknownError => "UNKNOWN_ERROR",
        };
        write!(f, "{}", s)
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for CacheErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CacheErrorSeverity::Low => "LOW",
            CacheErrorSeverity::Medium => "MEDIUM",
            CacheErrorSeverity::High => "HIGH",
            CacheErrorSeverity::Critical => "CRITICAL",
        };
        write!(f, "{}", s)
    }
}

/// Item identifier attached to an error for diagnostics (never control flow)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemId {
    Number(i64),
    Text(String),
}

impl From<i64> for ItemId {
    fn from(id: i64) -> Self {
        ItemId::Number(id)
    }
}

impl From<&str> for ItemId {
    fn from(id: &str) -> Self {
        ItemId::Text(id.to_string())
    }
}

impl From<String> for ItemId {
    fn from(id: String) -> Self {
        ItemId::Text(id)
    }
}

/// Structured error for a failed cache operation
///
/// Construction always succeeds and fixes `retryable` and `timestamp` for
/// the lifetime of the value. Each failure produces a new, independent
/// instance.
#[derive(Debug, Clone, Error)]
#[error("{error_type} in {feature}/{operation}: {message}")]
pub struct CacheError {
    error_type: CacheErrorType,
    severity: CacheErrorSeverity,
    operation: String,
    feature: String,
    message: String,
    user_id: Option<String>,
    item_id: Option<ItemId>,
    timestamp: DateTime<Utc>,
    retryable: bool,
    metadata: HashMap<String, serde_json::Value>,
    original_error: Option<Arc<anyhow::Error>>,
}

impl CacheError {
    /// Start building an error for the given taxonomy slot and bucketing pair
    pub fn builder(
        error_type: CacheErrorType,
        operation: impl Into<String>,
        feature: impl Into<String>,
        message: impl Into<String>,
    ) -> CacheErrorBuilder {
        CacheErrorBuilder::new(error_type, operation, feature, message)
    }

    pub fn error_type(&self) -> CacheErrorType {
        self.error_type
    }

    pub fn severity(&self) -> CacheErrorSeverity {
        self.severity
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn feature(&self) -> &str {
        &self.feature
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn item_id(&self) -> Option<&ItemId> {
        self.item_id.as_ref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn retryable(&self) -> bool {
        self.retryable
    }

    pub fn metadata(&self) -> &HashMap<String, serde_json::Value> {
        &self.metadata
    }

    pub fn original_error(&self) -> Option<&anyhow::Error> {
        self.original_error.as_deref()
    }

    /// Fill in missing diagnostic identifiers, leaving existing ones intact
    pub fn with_identifiers(mut self, user_id: Option<String>, item_id: Option<ItemId>) -> Self {
        if self.user_id.is_none() {
            self.user_id = user_id;
        }
        if self.item_id.is_none() {
            self.item_id = item_id;
        }
        self
    }

    /// Plain structured record for logging
    ///
    /// Only the causing error's message is included, never its internals.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "type": self.error_type.to_string(),
            "severity": self.severity.to_string(),
            "operation": self.operation,
            "feature": self.feature,
            "message": self.message,
            "userId": self.user_id,
            "itemId": self.item_id,
            "timestamp": self.timestamp.to_rfc3339(),
            "retryable": self.retryable,
            "metadata": self.metadata,
            "originalError": self.original_error.as_ref().map(|e| e.to_string()),
        })
    }
}

/// Builder for [`CacheError`]
pub struct CacheErrorBuilder {
    error_type: CacheErrorType,
    severity: Option<CacheErrorSeverity>,
    operation: String,
    feature: String,
    message: String,
    user_id: Option<String>,
    item_id: Option<ItemId>,
    retryable: Option<bool>,
    metadata: HashMap<String, serde_json::Value>,
    original_error: Option<Arc<anyhow::Error>>,
}

impl CacheErrorBuilder {
    fn new(
        error_type: CacheErrorType,
        operation: impl Into<String>,
        feature: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            error_type,
            severity: None,
            operation: operation.into(),
            feature: feature.into(),
            message: message.into(),
            user_id: None,
            item_id: None,
            retryable: None,
            metadata: HashMap::new(),
            original_error: None,
        }
    }

    /// Set an explicit severity instead of inferring it from the message
    pub fn severity(mut self, severity: CacheErrorSeverity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Override the type's default retryability
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn item_id(mut self, item_id: impl Into<ItemId>) -> Self {
        self.item_id = Some(item_id.into());
        self
    }

    /// Attach one diagnostic metadata entry
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Preserve the causing error for chaining
    pub fn original_error(mut self, error: anyhow::Error) -> Self {
        self.original_error = Some(Arc::new(error));
        self
    }

    pub fn build(self) -> CacheError {
        let severity = self
            .severity
            .unwrap_or_else(|| infer_severity(&self.message));
        let retryable = self
            .retryable
            .unwrap_or_else(|| self.error_type.default_retryable());
        CacheError {
            error_type: self.error_type,
            severity,
            operation: self.operation,
            feature: self.feature,
            message: self.message,
            user_id: self.user_id,
            item_id: self.item_id,
            timestamp: Utc::now(),
            retryable,
            metadata: self.metadata,
            original_error: self.original_error,
        }
    }
}

/// Best-effort error type classification from a human-readable message
///
/// Substring matching on message text is brittle; callers that care about
/// precise classification should construct a [`CacheError`] with an explicit
/// type instead of relying on this fallback.
pub fn classify_message(message: &str) -> CacheErrorType {
    let msg = message.to_lowercase();
    if msg.contains("network") || msg.contains("connection") || msg.contains("fetch") {
        CacheErrorType::NetworkError
    } else if msg.contains("timeout") || msg.contains("timed out") || msg.contains("abort") {
        CacheErrorType::TimeoutError
    } else if msg.contains("permission") || msg.contains("unauthorized") || msg.contains("forbidden")
    {
        CacheErrorType::PermissionError
    } else if msg.contains("validation") || msg.contains("invalid") {
        CacheErrorType::ValidationError
    } else if msg.contains("quota") || msg.contains("storage full") {
        CacheErrorType::QuotaExceeded
    } else if msg.contains("corrupt") {
        CacheErrorType::CacheCorruption
    } else if msg.contains("concurrent") || msg.contains("conflict") {
        CacheErrorType::ConcurrentModification
    } else {
        CacheErrorType::UnknownError
    }
}

/// Best-effort severity inference from message keywords
pub fn infer_severity(message: &str) -> CacheErrorSeverity {
    let msg = message.to_lowercase();
    if msg.contains("critical") || msg.contains("fatal") {
        CacheErrorSeverity::Critical
    } else if msg.contains("error") || msg.contains("failed") {
        CacheErrorSeverity::High
    } else if msg.contains("warning") || msg.contains("warn") {
        CacheErrorSeverity::Medium
    } else {
        CacheErrorSeverity::Low
    }
}

/// Normalize an arbitrary error into a [`CacheError`]
///
/// An error that already is a `CacheError` passes through unchanged; anything
/// else is classified from its message and the original preserved.
pub fn normalize_error(error: anyhow::Error, operation: &str, feature: &str) -> CacheError {
    match error.downcast::<CacheError>() {
        Ok(cache_error) => cache_error,
        Err(other) => {
            let message = other.to_string();
            CacheError::builder(classify_message(&message), operation, feature, &message)
                .original_error(other)
                .build()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_retryable_defaults() {
        let retryable = [
            CacheErrorType::NetworkError,
            CacheErrorType::TimeoutError,
            CacheErrorType::ConcurrentModification,
        ];
        let not_retryable = [
            CacheErrorType::ValidationError,
            CacheErrorType::PermissionError,
            CacheErrorType::CacheCorruption,
            CacheErrorType::QuotaExceeded,
            CacheErrorType::UnknownError,
        ];

        for error_type in retryable {
            let err = CacheError::builder(error_type, "op", "feature", "boom").build();
            assert!(err.retryable(), "{} should default retryable", error_type);
        }
        for error_type in not_retryable {
            let err = CacheError::builder(error_type, "op", "feature", "boom").build();
            assert!(!err.retryable(), "{} should not default retryable", error_type);
        }
    }

    #[test]
    fn test_retryable_override() {
        let err = CacheError::builder(CacheErrorType::ValidationError, "op", "f", "bad input")
            .retryable(true)
            .build();
        assert!(err.retryable());

        let err = CacheError::builder(CacheErrorType::NetworkError, "op", "f", "down")
            .retryable(false)
            .build();
        assert!(!err.retryable());
    }

    #[test]
    fn test_classification_precedence() {
        assert_eq!(
            classify_message("Network timeout"),
            CacheErrorType::NetworkError
        );
        assert_eq!(
            classify_message("request timed out"),
            CacheErrorType::TimeoutError
        );
        assert_eq!(
            classify_message("permission denied"),
            CacheErrorType::PermissionError
        );
        assert_eq!(
            classify_message("invalid payload"),
            CacheErrorType::ValidationError
        );
        assert_eq!(
            classify_message("quota exceeded"),
            CacheErrorType::QuotaExceeded
        );
        assert_eq!(
            classify_message("cache corrupted"),
            CacheErrorType::CacheCorruption
        );
        assert_eq!(
            classify_message("concurrent update detected"),
            CacheErrorType::ConcurrentModification
        );
        assert_eq!(
            classify_message("something odd"),
            CacheErrorType::UnknownError
        );
    }

    #[test]
    fn test_severity_inference() {
        assert_eq!(infer_severity("fatal crash"), CacheErrorSeverity::Critical);
        assert_eq!(infer_severity("write failed"), CacheErrorSeverity::High);
        assert_eq!(infer_severity("warning: slow"), CacheErrorSeverity::Medium);
        assert_eq!(infer_severity("note"), CacheErrorSeverity::Low);
    }

    #[test]
    fn test_to_json_includes_original_message_only() {
        let err = CacheError::builder(CacheErrorType::NetworkError, "addItem", "equipment", "down")
            .user_id("u-1")
            .item_id(42)
            .metadata("attempts", 3)
            .original_error(anyhow!("socket reset"))
            .build();

        let value = err.to_json();
        assert_eq!(value["type"], "NETWORK_ERROR");
        assert_eq!(value["operation"], "addItem");
        assert_eq!(value["feature"], "equipment");
        assert_eq!(value["userId"], "u-1");
        assert_eq!(value["itemId"], 42);
        assert_eq!(value["metadata"]["attempts"], 3);
        assert_eq!(value["originalError"], "socket reset");
    }

    #[test]
    fn test_normalize_passes_cache_error_through() {
        let original = CacheError::builder(CacheErrorType::QuotaExceeded, "put", "fixed-costs", "full")
            .build();
        let timestamp = original.timestamp();
        let normalized = normalize_error(anyhow::Error::new(original), "other", "other");
        assert_eq!(normalized.error_type(), CacheErrorType::QuotaExceeded);
        assert_eq!(normalized.operation(), "put");
        assert_eq!(normalized.timestamp(), timestamp);
    }

    #[test]
    fn test_normalize_classifies_plain_error() {
        let normalized = normalize_error(anyhow!("connection refused"), "addItem", "equipment");
        assert_eq!(normalized.error_type(), CacheErrorType::NetworkError);
        assert_eq!(normalized.operation(), "addItem");
        assert!(normalized.original_error().is_some());
    }

    #[test]
    fn test_with_identifiers_fills_only_missing() {
        let err = CacheError::builder(CacheErrorType::UnknownError, "op", "f", "boom")
            .user_id("original")
            .build()
            .with_identifiers(Some("other".into()), Some(ItemId::from(7)));
        assert_eq!(err.user_id(), Some("original"));
        assert_eq!(err.item_id(), Some(&ItemId::Number(7)));
    }
}
