//! Structured error types for the engine.
//!
//! The boundary rule: handlers and step callbacks use `anyhow::Error` as
//! ergonomic transport, but nothing crosses the store boundary untyped.
//! Failures are flattened into [`SerializedError`] (a `{name, message,
//! cause}` chain) before they are persisted, and the retry machinery
//! classifies errors by downcasting the `anyhow` chain against the marker
//! types in this module.
//!
//! # Retry classification
//!
//! An error bypasses the step retry loop when any link of its cause chain
//! is one of:
//!
//! - [`NonRetriableError`] — the callback declared retrying futile
//! - [`ActionCancelError`] — the job run was cancelled
//! - [`ActionTimeoutError`] / [`StepTimeoutError`] — a scope timer fired
//! - [`StepAlreadyExecutedError`] — programmer error, replaying a step name
//! - [`ValidationError`] — a payload failed its schema
//! - [`JobInactiveError`] — the owning job lost its lease

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// =============================================================================
// Serialized error shape
// =============================================================================

/// The error shape stored in `error` columns and in step failure history.
///
/// Round-trips through JSON preserving `name`, `message` and the `cause`
/// chain; `stack` is best-effort and may be lossy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<SerializedError>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl SerializedError {
    /// Create a leaf error with no cause.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            cause: None,
            stack: None,
        }
    }

    /// Flatten an `anyhow` error chain into the stored shape.
    ///
    /// The outermost link becomes the root; each `source` becomes a nested
    /// `cause`. Known engine error types keep their names so readers can
    /// distinguish timeouts and cancellations from handler failures.
    pub fn from_error(err: &anyhow::Error) -> Self {
        let mut links = err.chain();
        // anyhow guarantees at least one link.
        let mut root = links.next().map_or_else(
            || SerializedError::new("Error", err.to_string()),
            |e| SerializedError::new(error_name(e), e.to_string()),
        );
        let chain: Vec<SerializedError> = links
            .map(|e| SerializedError::new(error_name(e), e.to_string()))
            .collect();

        // Nest deepest-first so the outermost error owns the chain.
        let mut cause: Option<Box<SerializedError>> = None;
        for mut link in chain.into_iter().rev() {
            link.cause = cause;
            cause = Some(Box::new(link));
        }
        root.cause = cause;
        root
    }

    /// Serialize to a JSON value for storage.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({ "name": "Error", "message": self.message })
        })
    }

    /// Read back a stored JSON value, tolerating legacy plain strings.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        if let Some(message) = value.as_str() {
            return Some(SerializedError::new("Error", message));
        }
        serde_json::from_value(value.clone()).ok()
    }
}

impl std::fmt::Display for SerializedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for SerializedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

/// Stable name for a chain link, keyed off the engine's own error types.
fn error_name(err: &(dyn std::error::Error + 'static)) -> String {
    if let Some(stored) = err.downcast_ref::<SerializedError>() {
        // Preserve the stored name when replaying a persisted failure.
        return stored.name.clone();
    }
    let name = if err.downcast_ref::<NonRetriableError>().is_some() {
        "NonRetriableError"
    } else if err.downcast_ref::<ActionTimeoutError>().is_some() {
        "ActionTimeoutError"
    } else if err.downcast_ref::<StepTimeoutError>().is_some() {
        "StepTimeoutError"
    } else if err.downcast_ref::<ActionCancelError>().is_some() {
        "ActionCancelError"
    } else if err.downcast_ref::<StepAlreadyExecutedError>().is_some() {
        "StepAlreadyExecutedError"
    } else if err.downcast_ref::<ValidationError>().is_some() {
        "ValidationError"
    } else if err.downcast_ref::<JobInactiveError>().is_some() {
        "JobInactiveError"
    } else if err.downcast_ref::<StoreError>().is_some() {
        "StoreError"
    } else {
        "Error"
    };
    name.to_string()
}

// =============================================================================
// Marker errors
// =============================================================================

/// The callback declared that retrying is futile.
///
/// Wrap any failure in this type (or carry it anywhere in the cause chain)
/// to make the step fail immediately instead of backing off.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct NonRetriableError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl NonRetriableError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// The job-level timer fired before the handler finished.
#[derive(Debug, Clone, Copy, Error)]
#[error("action timed out after {timeout_ms}ms")]
pub struct ActionTimeoutError {
    pub timeout_ms: i64,
}

/// A step-local timer fired before the callback finished.
#[derive(Debug, Clone, Error)]
#[error("step '{step}' timed out after {timeout_ms}ms")]
pub struct StepTimeoutError {
    pub step: String,
    pub timeout_ms: i64,
}

/// The job run was cancelled.
#[derive(Debug, Clone, Copy, Default, Error)]
#[error("action cancelled")]
pub struct ActionCancelError;

/// A handler invoked the same step name twice within one run.
#[derive(Debug, Clone, Error)]
#[error("step '{name}' was already executed in this run")]
pub struct StepAlreadyExecutedError {
    pub name: String,
}

/// A payload did not satisfy the action's declared schema.
#[derive(Debug, Clone, Error)]
#[error("validation failed: {message}")]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A step operation was attempted on a job that is no longer active.
#[derive(Debug, Clone, Copy, Error)]
#[error("job {job_id} is no longer active")]
pub struct JobInactiveError {
    pub job_id: Uuid,
}

// =============================================================================
// Store and engine errors
// =============================================================================

/// Failures raised by a [`crate::store::Store`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store is not running")]
    NotRunning,
}

/// Errors surfaced by the [`crate::client::Client`] API.
#[derive(Debug, Error)]
pub enum DuronError {
    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("action already registered: {0}")]
    ActionAlreadyRegistered(String),

    #[error("invalid input for action '{action}': {source}")]
    InvalidInput {
        action: String,
        #[source]
        source: ValidationError,
    },

    #[error("invalid action definition '{action}': {message}")]
    InvalidAction { action: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

// =============================================================================
// Classification
// =============================================================================

/// Whether any link of the chain carries a marker that bypasses retry.
pub(crate) fn is_non_retriable(err: &anyhow::Error) -> bool {
    err.chain().any(|e| {
        e.downcast_ref::<NonRetriableError>().is_some()
            || e.downcast_ref::<ActionCancelError>().is_some()
            || e.downcast_ref::<ActionTimeoutError>().is_some()
            || e.downcast_ref::<StepTimeoutError>().is_some()
            || e.downcast_ref::<StepAlreadyExecutedError>().is_some()
            || e.downcast_ref::<ValidationError>().is_some()
            || e.downcast_ref::<JobInactiveError>().is_some()
    })
}

/// Whether the chain represents a cancellation rather than a failure.
pub(crate) fn is_cancel(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|e| e.downcast_ref::<ActionCancelError>().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn serialized_error_roundtrips_with_cause() {
        let mut err = SerializedError::new("Error", "outer");
        err.cause = Some(Box::new(SerializedError::new(
            "NonRetriableError",
            "inner",
        )));

        let value = err.to_value();
        let back = SerializedError::from_value(&value).unwrap();
        assert_eq!(back, err);
        assert_eq!(back.cause.as_ref().unwrap().message, "inner");
    }

    #[test]
    fn from_value_accepts_plain_strings() {
        let back = SerializedError::from_value(&serde_json::json!("boom")).unwrap();
        assert_eq!(back.name, "Error");
        assert_eq!(back.message, "boom");
    }

    #[test]
    fn from_error_flattens_anyhow_chain() {
        let err = anyhow::Error::new(NonRetriableError::new("root cause"))
            .context("while doing the thing");

        let serialized = SerializedError::from_error(&err);
        assert_eq!(serialized.message, "while doing the thing");
        let cause = serialized.cause.expect("chain preserved");
        assert_eq!(cause.name, "NonRetriableError");
        assert_eq!(cause.message, "root cause");
    }

    #[test]
    fn non_retriable_detected_through_context() {
        let err = anyhow::Error::new(NonRetriableError::new("stop"))
            .context("wrapped once")
            .context("wrapped twice");
        assert!(is_non_retriable(&err));

        let plain = anyhow::anyhow!("transient failure");
        assert!(!is_non_retriable(&plain));
    }

    #[test]
    fn timeouts_and_cancels_bypass_retry() {
        assert!(is_non_retriable(&anyhow::Error::new(ActionTimeoutError {
            timeout_ms: 1000
        })));
        assert!(is_non_retriable(&anyhow::Error::new(StepTimeoutError {
            step: "s".into(),
            timeout_ms: 10
        })));
        assert!(is_non_retriable(&anyhow::Error::new(ActionCancelError)));
    }

    #[test]
    fn cancel_is_distinguished_from_failure() {
        assert!(is_cancel(&anyhow::Error::new(ActionCancelError)));
        assert!(!is_cancel(&anyhow::Error::new(ActionTimeoutError {
            timeout_ms: 5
        })));
    }

    #[test]
    fn error_names_are_stable() {
        let err = anyhow::Error::new(StepAlreadyExecutedError { name: "dup".into() });
        let serialized = SerializedError::from_error(&err);
        assert_eq!(serialized.name, "StepAlreadyExecutedError");
    }
}
