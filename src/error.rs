//! Error types for the Volume Events Exporter
//!
//! Provides structured error types for the observer, reconciler, annotation
//! writer, event sink and the Kubernetes store adapter.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the exporter
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes / Store Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource version conflict: {kind}/{name}")]
    Conflict { kind: String, name: String },

    #[error("Resource store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    #[error("Watch stream error: {0}")]
    Watch(String),

    // =========================================================================
    // Reconciliation Errors
    // =========================================================================
    #[error("Conflict retries exhausted for volume {key} after {attempts} attempts")]
    ConflictRetriesExhausted { key: String, attempts: u32 },

    #[error("Export invariant violated for volume {key}: {reason}")]
    InvariantViolation { key: String, reason: String },

    // =========================================================================
    // Event Sink Errors
    // =========================================================================
    #[error("Event sink request failed: {0}")]
    EventSink(#[from] reqwest::Error),

    // =========================================================================
    // Metrics Errors
    // =========================================================================
    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue after the short error interval
    RequeueWithBackoff,
    /// Requeue on the next steady-state resync
    RequeueAtResync,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry quickly
            Error::Kube(_)
            | Error::StoreUnavailable { .. }
            | Error::Watch(_)
            | Error::Conflict { .. }
            | Error::ConflictRetriesExhausted { .. }
            | Error::EventSink(_) => ErrorAction::RequeueWithBackoff,

            // Provenance must never be overwritten; look again later
            Error::InvariantViolation { .. } => ErrorAction::RequeueAtResync,

            // Object disappeared mid-reconcile; the next event decides
            Error::ResourceNotFound { .. } => ErrorAction::RequeueAfter(Duration::from_secs(5)),

            // Configuration errors - don't retry automatically
            Error::Configuration(_) | Error::YamlParse(_) | Error::Metrics(_) => {
                ErrorAction::NoRequeue
            }

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_)
                | Error::StoreUnavailable { .. }
                | Error::Watch(_)
                | Error::EventSink(_)
        )
    }

    /// Check if this error reports an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Check if this error reports a missing object
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ResourceNotFound { .. })
    }

    /// Short label used for metrics
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::Kube(_) | Error::StoreUnavailable { .. } | Error::Watch(_) => "store",
            Error::Conflict { .. } | Error::ConflictRetriesExhausted { .. } => "conflict",
            Error::InvariantViolation { .. } => "invariant",
            Error::EventSink(_) => "sink",
            Error::ResourceNotFound { .. } => "not_found",
            _ => "internal",
        }
    }
}

/// Result type alias for the exporter
pub type Result<T> = std::result::Result<T, Error>;
