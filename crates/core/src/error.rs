//! Domain error model.

use thiserror::Error;

use crate::status::JobStatus;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures of the job model (validation,
/// state-machine violations, type resolution). Storage concerns belong to the
/// store implementations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A status change that the job state machine does not allow.
    #[error("illegal status transition: {from} -> {to}")]
    IllegalTransition { from: JobStatus, to: JobStatus },

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// No constructor is registered for the job type key.
    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    /// The constructor rejected the persisted data or schedule metadata.
    #[error("invalid data for job type '{job_type}': {reason}")]
    InvalidJobData { job_type: String, reason: String },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn illegal_transition(from: JobStatus, to: JobStatus) -> Self {
        Self::IllegalTransition { from, to }
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn unknown_job_type(job_type: impl Into<String>) -> Self {
        Self::UnknownJobType(job_type.into())
    }

    pub fn invalid_job_data(job_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidJobData {
            job_type: job_type.into(),
            reason: reason.into(),
        }
    }
}
