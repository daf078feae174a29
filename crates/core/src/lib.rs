//! `jobtree-core` — pure domain model of the analysis job tree.
//!
//! This crate contains the job record, its identifiers, and the stage state
//! machine. It performs **no I/O**; stores and services live in `jobtree-infra`.

pub mod error;
pub mod id;
pub mod job;
pub mod stage;
pub mod version;

pub use error::{DomainError, DomainResult};
pub use id::{ConversationId, JobId, WorkerId};
pub use job::{FailureReason, FailureRecord, Job, JobPatch, JobStatus, LogEntry, LogLevel};
pub use stage::{EndOfPipeline, JobType, Stage, StageSequencer, StageTable};
pub use version::{ExpectedVersion, INITIAL_VERSION};
