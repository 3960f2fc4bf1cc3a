//! Error types for the Cloud Control Plane
//!
//! Provides structured error types for all control plane components including
//! driver dispatch, the task engine, quota reservations, and the guest
//! lifecycle orchestrator.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the control plane
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
    // Driver Dispatch Errors
    // =========================================================================
    #[error("No driver registered for {resource}/{provider}")]
    DriverNotFound { resource: String, provider: String },

    #[error("Operation {operation} is not implemented by driver {driver}")]
    NotImplemented { driver: String, operation: String },

    #[error("Cannot {operation} {resource} in status {status}")]
    InvalidState {
        resource: String,
        status: String,
        operation: String,
    },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Backend operation failed: {provider} - {operation}: {reason}")]
    BackendFailure {
        provider: String,
        operation: String,
        reason: String,
    },

    // =========================================================================
    // Task Engine Errors
    // =========================================================================
    #[error("No stage handlers registered for workflow {workflow}")]
    UnknownWorkflow { workflow: String },

    #[error("Stage {stage} is not declared by workflow {workflow}")]
    StageNotFound { workflow: String, stage: String },

    #[error("Task {task_id} cannot move back from stage {from} to {to}")]
    StageRegression {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("Task {task_id} has no active stage dispatch")]
    NotInDispatch { task_id: String },

    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    #[error("Task {task_id} is already {status}")]
    TaskTerminal { task_id: String, status: String },

    #[error("Task {task_id} was cancelled")]
    TaskCancelled { task_id: String },

    #[error("Task {task_id} was interrupted in non-resumable stage {stage}")]
    TaskInterrupted { task_id: String, stage: String },

    // =========================================================================
    // Resource Errors
    // =========================================================================
    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    // =========================================================================
    // Quota Errors
    // =========================================================================
    #[error("Reservation not found: {reservation_id}")]
    ReservationNotFound { reservation_id: String },

    #[error("Quota exceeded in {scope} for {resource}: requested {requested}, available {available}")]
    QuotaExceeded {
        scope: String,
        resource: String,
        requested: i64,
        available: i64,
    },

    // =========================================================================
    // Persistence / Parse Errors
    // =========================================================================
    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take when an operation fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Retry after a specific duration
    RetryAfter(Duration),
    /// Don't retry, surface the failure
    NoRetry,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Provider calls and storage hiccups are usually transient
            Error::BackendFailure { .. } | Error::Io(_) | Error::Persistence(_) => {
                ErrorAction::RetryWithBackoff
            }

            // Someone else holds the quota; it may free up
            Error::QuotaExceeded { .. } => ErrorAction::RetryAfter(Duration::from_secs(60)),

            // Everything else is a definitive answer
            _ => ErrorAction::NoRetry,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRetry)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::BackendFailure { .. } | Error::Io(_) | Error::Persistence(_)
        )
    }

    /// Capability is intentionally absent; callers branch on this
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, Error::NotImplemented { .. })
    }

    /// Stable snake_case discriminator
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Internal(_) => "internal",
            Error::Configuration(_) => "configuration",
            Error::DriverNotFound { .. } => "driver_not_found",
            Error::NotImplemented { .. } => "not_implemented",
            Error::InvalidState { .. } => "invalid_state",
            Error::ValidationFailed(_) => "validation_failed",
            Error::BackendFailure { .. } => "backend_failure",
            Error::UnknownWorkflow { .. } => "unknown_workflow",
            Error::StageNotFound { .. } => "stage_not_found",
            Error::StageRegression { .. } => "stage_regression",
            Error::NotInDispatch { .. } => "not_in_dispatch",
            Error::TaskNotFound { .. } => "task_not_found",
            Error::TaskTerminal { .. } => "task_terminal",
            Error::TaskCancelled { .. } => "task_cancelled",
            Error::TaskInterrupted { .. } => "task_interrupted",
            Error::ResourceNotFound { .. } => "resource_not_found",
            Error::ResourceExists { .. } => "resource_exists",
            Error::ReservationNotFound { .. } => "reservation_not_found",
            Error::QuotaExceeded { .. } => "quota_exceeded",
            Error::Persistence(_) => "persistence",
            Error::JsonParse(_) => "json_parse",
            Error::YamlParse(_) => "yaml_parse",
            Error::Io(_) => "io",
        }
    }

    /// Shorthand for a capability the driver does not offer
    pub fn not_implemented(driver: impl Into<String>, operation: impl Into<String>) -> Self {
        Error::NotImplemented {
            driver: driver.into(),
            operation: operation.into(),
        }
    }

    /// Shorthand for a failed provider call
    pub fn backend(
        provider: impl Into<String>,
        operation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::BackendFailure {
            provider: provider.into(),
            operation: operation.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for the control plane
pub type Result<T> = std::result::Result<T, Error>;
