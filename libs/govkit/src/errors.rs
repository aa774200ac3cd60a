//! Failure taxonomy of the governance runtime.

use std::time::Duration;

use thiserror::Error;

use crate::domain::ModuleId;

/// Structured errors for every governed operation.
///
/// Variants carry the offending module or service where one exists; external
/// causes (container start, user handlers) are attached as `#[source]` so the
/// original failure is preserved through the pipeline.
#[derive(Debug, Error)]
pub enum GovError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("lifecycle failure for module '{module}'")]
    Lifecycle {
        module: ModuleId,
        #[source]
        source: anyhow::Error,
    },

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("permission denied: caller '{caller}' lacks '{permission}'")]
    PermissionDenied { caller: ModuleId, permission: String },

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("service invocation failed")]
    Invocation(#[source] anyhow::Error),

    #[error("invocation interrupted")]
    Interrupted,

    #[error("security verification failed for module '{module}'")]
    SecurityViolation {
        module: ModuleId,
        #[source]
        source: anyhow::Error,
    },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

pub type GovResult<T> = Result<T, GovError>;

impl GovError {
    /// Stable tag for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::Lifecycle { .. } => "LIFECYCLE_ERROR",
            Self::ServiceNotFound(_) => "SERVICE_NOT_FOUND",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::PermissionDenied { .. } => "PERMISSION_DENIED",
            Self::Rejected(_) => "REJECTED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Invocation(_) => "INVOCATION_ERROR",
            Self::Interrupted => "INTERRUPTED",
            Self::SecurityViolation { .. } => "SECURITY_VIOLATION",
            Self::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
        }
    }
}
