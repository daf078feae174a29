//! Domain error model.

use thiserror::Error;

use crate::id::JobId;
use crate::job::JobStatus;
use crate::stage::{JobType, Stage};

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (validation, lifecycle rules).
/// Storage and concurrency failures belong to the store layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier or enum name could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A stage is not part of the job type's stage list.
    #[error("stage {stage} is not part of the {job_type} pipeline")]
    InvalidStage { job_type: JobType, stage: Stage },

    /// A lifecycle operation was attempted from a status that does not allow it.
    #[error("job {job_id}: cannot {operation} a job in status {status}")]
    InvalidTransition {
        job_id: JobId,
        status: JobStatus,
        operation: &'static str,
    },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_transition(job_id: JobId, status: JobStatus, operation: &'static str) -> Self {
        Self::InvalidTransition {
            job_id,
            status,
            operation,
        }
    }
}
