//! Error types for Kiln

use thiserror::Error;

use crate::domain::job::JobStatus;

/// Result type alias for Kiln operations
pub type Result<T> = std::result::Result<T, KilnError>;

/// Errors raised by the job runtime
///
/// Per-job execution failures are not represented here: they are recorded on
/// the job itself as an `Error` status with an attached description.
#[derive(Debug, Error)]
pub enum KilnError {
    /// A dependency of a job ended in `Error`
    #[error("Dependency '{dependency}' of job '{job}' failed: {reason}")]
    DependencyFailed {
        job: String,
        dependency: String,
        reason: String,
    },

    /// Malformed or ambiguous container image reference
    #[error("Invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// Operation not allowed under the current runtime configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The external pull or presence check failed
    #[error("Failed to prepare image '{reference}': {reason}")]
    PrepareFailed { reference: String, reason: String },

    /// A status change the job state machine does not allow
    #[error("Invalid job transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// Inputs required by a job could not be staged
    #[error("Input staging failed: {0}")]
    Staging(String),

    /// A job plan could not be turned into jobs
    #[error("Invalid job plan: {0}")]
    Plan(String),
}

impl KilnError {
    /// Create an invalid reference error
    pub fn invalid_reference(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidReference {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    /// Create a prepare failure
    pub fn prepare_failed(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PrepareFailed {
            reference: reference.into(),
            reason: reason.into(),
        }
    }
}
