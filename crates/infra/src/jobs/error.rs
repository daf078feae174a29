//! Caller-facing error of the job tree services.

use thiserror::Error;

use jobtree_core::{ConversationId, DomainError, JobId, JobStatus, JobType, Stage};

use super::store::JobStoreError;

/// Error returned by the factory, resolvers and policy.
///
/// `NotFound`, `ParentNotFound` and `VersionConflict` stay distinct so an outer
/// layer can map each to its own response; nothing here retries them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobTreeError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("no completed job for conversation {conversation_id}")]
    NoCompletedJob {
        conversation_id: ConversationId,
        job_stage: Option<Stage>,
        job_type: Option<JobType>,
    },

    #[error("parent job not found: {0}")]
    ParentNotFound(JobId),

    #[error("version conflict on job {job_id}: expected {expected}, found {actual}")]
    VersionConflict {
        job_id: JobId,
        expected: u64,
        actual: u64,
    },

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("stage {stage} is not part of the {job_type} pipeline")]
    InvalidStage { job_type: JobType, stage: Stage },

    #[error("job {job_id}: cannot {operation} a job in status {status}")]
    InvalidTransition {
        job_id: JobId,
        status: JobStatus,
        operation: &'static str,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("stored job is corrupt: {0}")]
    CorruptRecord(String),

    /// Transient infrastructure failure; safe for a higher layer to retry.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl JobTreeError {
    /// True for both "job id unknown" and "no matching completed job".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            JobTreeError::NotFound(_) | JobTreeError::NoCompletedJob { .. }
        )
    }
}

impl From<JobStoreError> for JobTreeError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => JobTreeError::NotFound(id),
            JobStoreError::AlreadyExists(id) => JobTreeError::AlreadyExists(id),
            JobStoreError::VersionConflict {
                job_id,
                expected,
                actual,
            } => JobTreeError::VersionConflict {
                job_id,
                expected,
                actual,
            },
            JobStoreError::Decode(msg) => JobTreeError::CorruptRecord(msg),
            JobStoreError::Unavailable(msg) => JobTreeError::StoreUnavailable(msg),
        }
    }
}

impl From<DomainError> for JobTreeError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidStage { job_type, stage } => {
                JobTreeError::InvalidStage { job_type, stage }
            }
            DomainError::InvalidTransition {
                job_id,
                status,
                operation,
            } => JobTreeError::InvalidTransition {
                job_id,
                status,
                operation,
            },
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                JobTreeError::Validation(msg)
            }
        }
    }
}
