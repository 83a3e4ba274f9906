//! Error types for the Applications Orchestrator
//!
//! Provides structured error types for the cluster lifecycle, the backup
//! catalog, restore, and the adapters that talk to ZFS, Kubernetes and the
//! host middleware.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the orchestrator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Error observed by several callers of a single-flight operation
    #[error(transparent)]
    Shared(Arc<Error>),

    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{kind} {name:?} does not exist")]
    NotFound { kind: String, name: String },

    #[error("{kind} {name:?} already exists")]
    Duplicate { kind: String, name: String },

    #[error("Please unlock following dataset(s) before starting applications: {}", .datasets.join(", "))]
    LockedResource { datasets: Vec<String> },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    // =========================================================================
    // Job Errors
    // =========================================================================
    #[error("Timed out after {}s waiting for {operation}: {blocker}", .waited.as_secs())]
    Timeout {
        operation: String,
        blocker: String,
        waited: Duration,
    },

    #[error("Job {job} was cancelled")]
    Cancelled { job: String },

    #[error("{operation} completed with {} failure(s): {}", .failures.len(), .failures.join("; "))]
    PartialFailure {
        operation: String,
        failures: Vec<String>,
    },

    // =========================================================================
    // External Tool Errors
    // =========================================================================
    #[error("{tool} {command} failed: {reason}")]
    ExternalTool {
        tool: String,
        command: String,
        reason: String,
    },

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    // =========================================================================
    // Middleware Errors
    // =========================================================================
    #[error("Middleware connection error: {0}")]
    MiddlewareConnection(#[from] reqwest::Error),

    #[error("Middleware call {method} failed: {reason}")]
    MiddlewareCall { method: String, reason: String },

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

impl Error {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn duplicate(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::Duplicate {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Unwrap shared errors down to the error that was actually raised
    pub fn root(&self) -> &Error {
        match self {
            Error::Shared(inner) => inner.root(),
            other => other,
        }
    }

    /// Short machine-readable name used by the REST API
    pub fn kind(&self) -> &'static str {
        match self.root() {
            Error::Internal(_) | Error::Shared(_) => "internal_error",
            Error::Configuration(_) => "configuration_error",
            Error::Validation(_) | Error::InvalidTransition { .. } => "validation_error",
            Error::NotFound { .. } => "not_found",
            Error::Duplicate { .. } => "duplicate",
            Error::LockedResource { .. } => "locked_resource",
            Error::Timeout { .. } => "timeout",
            Error::Cancelled { .. } => "cancelled",
            Error::PartialFailure { .. } => "partial_failure",
            Error::ExternalTool { .. } => "external_tool_error",
            Error::Kube(_) => "kubernetes_error",
            Error::MiddlewareConnection(_) | Error::MiddlewareCall { .. } => "middleware_error",
            Error::JsonParse(_) | Error::YamlParse(_) => "parse_error",
            Error::Io(_) => "io_error",
        }
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        match self.root() {
            Error::MiddlewareConnection(e) => e.is_connect() || e.is_timeout(),
            Error::Kube(kube::Error::Api(resp)) => resp.code >= 500 || resp.code == 429,
            Error::Kube(_) => true,
            _ => false,
        }
    }

    /// Check if retrying the same call can succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.root(),
            Error::Validation(_)
                | Error::NotFound { .. }
                | Error::Duplicate { .. }
                | Error::LockedResource { .. }
                | Error::InvalidTransition { .. }
                | Error::Configuration(_)
                | Error::Cancelled { .. }
        )
    }

    /// Kubernetes reported that the object already exists
    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), Error::Kube(kube::Error::Api(resp)) if resp.code == 409)
    }

    /// The object does not exist, locally or in Kubernetes
    pub fn is_missing(&self) -> bool {
        match self.root() {
            Error::NotFound { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }
}

/// Result type alias for the orchestrator
pub type Result<T> = std::result::Result<T, Error>;
