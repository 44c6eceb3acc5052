//! # Error Types
//!
//! Structured error handling for the execution core using thiserror
//! for typed variants instead of `Box<dyn Error>` patterns.
//!
//! The taxonomy mirrors the dispatch path: admission and duplicate-operation
//! outcomes short-circuit before any side effect runs, handler failures are
//! retried up to a ceiling, and trace/diagnostic problems are advisory and
//! never abort the caller.

use thiserror::Error;

/// Errors surfaced by the execution core
#[derive(Error, Debug)]
pub enum AgentCoreError {
    /// Rate limit exceeded for the caller/endpoint-class pair. Retryable
    /// after `reset_in_ms`.
    #[error("admission denied for {identifier} on {endpoint_class}: retry in {reset_in_ms}ms")]
    AdmissionDenied {
        identifier: String,
        endpoint_class: String,
        reset_in_ms: u64,
    },

    /// The idempotency key is already in flight elsewhere. Not a fault:
    /// the first attempt owns the side effect and its result will be stored.
    #[error("operation already in flight for idempotency key {key}")]
    DuplicateOperation { key: String },

    /// A task handler returned an error (or timed out). Retried up to the
    /// configured ceiling, then terminal.
    #[error("handler for {task_type} failed: {message}")]
    HandlerFailure { task_type: String, message: String },

    /// An operation referenced a trace that is neither live nor persisted.
    #[error("trace not found: {trace_id}")]
    TraceNotFound { trace_id: String },

    /// The self-healing loop's reasoning collaborator failed. Healing is
    /// best-effort; this never masks the original task failure.
    #[error("diagnostic collaborator unavailable: {message}")]
    DiagnosticUnavailable { message: String },

    #[error("storage error: {operation}: {message}")]
    Storage { operation: String, message: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AgentCoreError {
    /// Create a storage error with operation context
    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a handler failure for a task type
    pub fn handler_failure(task_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HandlerFailure {
            task_type: task_type.into(),
            message: message.into(),
        }
    }

    /// Create a diagnostic-unavailable error
    pub fn diagnostic_unavailable(message: impl Into<String>) -> Self {
        Self::DiagnosticUnavailable {
            message: message.into(),
        }
    }

    /// Whether the caller may retry after a delay
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AdmissionDenied { .. } | Self::HandlerFailure { .. } | Self::Storage { .. }
        )
    }
}

impl From<sqlx::Error> for AgentCoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage {
            operation: "query".to_string(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentCoreError>;
