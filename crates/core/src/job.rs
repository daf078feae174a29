//! The job record: one unit of pipeline work tied to a conversation and stage.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::{ConversationId, JobId, WorkerId};
use crate::stage::{JobType, Stage, StageTable};
use crate::version::INITIAL_VERSION;

/// Job execution status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Queued, waiting to be claimed by a worker
    Pending,
    /// Held by a worker
    Running,
    /// Finished successfully
    Completed,
    /// Gave up (retries exhausted, cancelled, or timed out with folding)
    Failed,
    /// Timed out with retries exhausted, when kept distinct from `Failed`
    TimedOut,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::TimedOut,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::TimedOut
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::TimedOut => "TIMED_OUT",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DomainError::invalid_id(format!("unknown job status: {s}")))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One entry of a job's append-only audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(timestamp: DateTime<Utc>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            level,
            message: message.into(),
        }
    }

    pub fn info(timestamp: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self::new(timestamp, LogLevel::Info, message)
    }

    pub fn warn(timestamp: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self::new(timestamp, LogLevel::Warn, message)
    }

    pub fn error(timestamp: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self::new(timestamp, LogLevel::Error, message)
    }
}

/// Why a job left the RUNNING state without completing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    /// Worker reported a failure; retries remained.
    Error,
    /// Job ran past `timeout_seconds`; retries remained.
    TimeoutExceeded,
    /// Failure with no retries left.
    RetryExhausted,
    /// Moved to a terminal status by an operator.
    Cancelled,
}

/// Last failure recorded on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub reason: FailureReason,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(reason: FailureReason, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            reason,
            message: message.into(),
            at,
        }
    }
}

/// A pipeline job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub status: JobStatus,
    pub job_type: JobType,
    pub job_stage: Stage,
    pub conversation_id: ConversationId,
    /// Scheduling hint; selection policy lives with the workers.
    pub priority: i32,
    pub parent_job_id: Option<JobId>,
    pub root_job_id: JobId,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<WorkerId>,
    pub job_config: JsonValue,
    pub job_results: JsonValue,
    pub logs: Vec<LogEntry>,
    pub created_by: Option<String>,
    pub failure: Option<FailureRecord>,
}

impl Job {
    /// Create a PENDING root job: no parent, `root_job_id == job_id`.
    pub fn new_root(
        conversation_id: ConversationId,
        job_type: JobType,
        job_stage: Stage,
        created_at: DateTime<Utc>,
    ) -> Self {
        let job_id = JobId::new();
        Self {
            job_id,
            status: JobStatus::Pending,
            job_type,
            job_stage,
            conversation_id,
            priority: 0,
            parent_job_id: None,
            root_job_id: job_id,
            retry_count: 0,
            max_retries: 0,
            timeout_seconds: 0,
            version: INITIAL_VERSION,
            created_at,
            updated_at: created_at,
            started_at: None,
            completed_at: None,
            worker_id: None,
            job_config: JsonValue::Null,
            job_results: JsonValue::Null,
            logs: Vec::new(),
            created_by: None,
            failure: None,
        }
    }

    /// Create a PENDING child of `parent`, inheriting its tree root, author
    /// and retry limits.
    pub fn new_child(
        parent: &Job,
        conversation_id: ConversationId,
        job_type: JobType,
        job_stage: Stage,
        created_at: DateTime<Utc>,
    ) -> Self {
        let mut child = Self::new_root(conversation_id, job_type, job_stage, created_at);
        child.parent_job_id = Some(parent.job_id);
        child.root_job_id = parent.tree_root();
        child.created_by = parent.created_by.clone();
        child.max_retries = parent.max_retries;
        child.timeout_seconds = parent.timeout_seconds;
        child
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_config(mut self, job_config: JsonValue) -> Self {
        self.job_config = job_config;
        self
    }

    pub fn with_created_by(mut self, created_by: Option<String>) -> Self {
        self.created_by = created_by;
        self
    }

    pub fn with_retry_limits(mut self, max_retries: u32, timeout_seconds: u64) -> Self {
        self.max_retries = max_retries;
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_log(mut self, entry: LogEntry) -> Self {
        self.logs.push(entry);
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_job_id.is_none()
    }

    /// Root of the tree this job belongs to (its own id for roots).
    pub fn tree_root(&self) -> JobId {
        if self.is_root() {
            self.job_id
        } else {
            self.root_job_id
        }
    }

    /// Whether one more failure would still be retried.
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Instant after which a RUNNING job counts as timed out.
    pub fn timeout_deadline(&self) -> Option<DateTime<Utc>> {
        let started = self.started_at?;
        let timeout = Duration::try_seconds(i64::try_from(self.timeout_seconds).ok()?)?;
        started.checked_add_signed(timeout)
    }

    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running
            && self.timeout_deadline().is_some_and(|deadline| deadline <= now)
    }

    /// Apply a patch and advance the version by one.
    ///
    /// Only stores call this, after the expected version has been checked.
    pub fn apply_patch(&mut self, patch: JobPatch, now: DateTime<Utc>) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(stage) = patch.job_stage {
            self.job_stage = stage;
        }
        if let Some(worker_id) = patch.worker_id {
            self.worker_id = worker_id;
        }
        if let Some(started_at) = patch.started_at {
            self.started_at = started_at;
        }
        if let Some(completed_at) = patch.completed_at {
            self.completed_at = completed_at;
        }
        if let Some(retry_count) = patch.retry_count {
            self.retry_count = retry_count;
        }
        if let Some(results) = patch.job_results {
            self.job_results = results;
        }
        if let Some(failure) = patch.failure {
            self.failure = failure;
        }
        self.logs.extend(patch.append_logs);
        self.version += 1;
        self.updated_at = now;
    }

    /// Check the record-level invariants against a stage table.
    pub fn check_invariants(&self, table: &StageTable) -> DomainResult<()> {
        table.ensure_contains(self.job_type, self.job_stage)?;

        if self.is_root() && self.root_job_id != self.job_id {
            return Err(DomainError::validation(format!(
                "root job {} must reference itself as root, found {}",
                self.job_id, self.root_job_id
            )));
        }
        if self.completed_at.is_some() != (self.status == JobStatus::Completed) {
            return Err(DomainError::validation(format!(
                "job {}: completed_at must be set exactly when status is COMPLETED",
                self.job_id
            )));
        }
        if !self.status.is_terminal() && self.retry_count > self.max_retries {
            return Err(DomainError::validation(format!(
                "job {}: retry_count {} exceeds max_retries {}",
                self.job_id, self.retry_count, self.max_retries
            )));
        }
        Ok(())
    }
}

/// Partial update applied by a conditional store write.
///
/// `Option<Option<T>>` fields distinguish "leave as is" (`None`) from
/// "clear" (`Some(None)`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub job_stage: Option<Stage>,
    pub worker_id: Option<Option<WorkerId>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub retry_count: Option<u32>,
    pub job_results: Option<JsonValue>,
    pub failure: Option<Option<FailureRecord>>,
    pub append_logs: Vec<LogEntry>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.job_stage = Some(stage);
        self
    }

    pub fn with_worker_id(mut self, worker_id: Option<WorkerId>) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn with_started_at(mut self, started_at: Option<DateTime<Utc>>) -> Self {
        self.started_at = Some(started_at);
        self
    }

    pub fn with_completed_at(mut self, completed_at: Option<DateTime<Utc>>) -> Self {
        self.completed_at = Some(completed_at);
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn with_results(mut self, results: JsonValue) -> Self {
        self.job_results = Some(results);
        self
    }

    pub fn with_failure(mut self, failure: Option<FailureRecord>) -> Self {
        self.failure = Some(failure);
        self
    }

    pub fn with_log(mut self, entry: LogEntry) -> Self {
        self.append_logs.push(entry);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn root() -> Job {
        Job::new_root(
            ConversationId::new("42"),
            JobType::FullPipeline,
            Stage::Load,
            Utc::now(),
        )
        .with_retry_limits(2, 60)
    }

    #[test]
    fn root_references_itself() {
        let job = root();
        assert!(job.is_root());
        assert_eq!(job.root_job_id, job.job_id);
        assert_eq!(job.version, INITIAL_VERSION);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.check_invariants(&StageTable::new()).is_ok());
    }

    #[test]
    fn child_inherits_root_and_limits() {
        let parent = root().with_created_by(Some("alice".to_string()));
        let child = Job::new_child(
            &parent,
            parent.conversation_id.clone(),
            JobType::FullPipeline,
            Stage::Pca,
            Utc::now(),
        );
        assert_eq!(child.parent_job_id, Some(parent.job_id));
        assert_eq!(child.root_job_id, parent.job_id);
        assert_eq!(child.created_by.as_deref(), Some("alice"));
        assert_eq!(child.max_retries, 2);

        let grandchild = Job::new_child(
            &child,
            child.conversation_id.clone(),
            JobType::FullPipeline,
            Stage::Umap,
            Utc::now(),
        );
        assert_eq!(grandchild.root_job_id, parent.job_id);
    }

    #[test]
    fn patch_bumps_version_and_clears_fields() {
        let mut job = root();
        let now = Utc::now();
        job.apply_patch(
            JobPatch::new()
                .with_status(JobStatus::Running)
                .with_worker_id(Some(WorkerId::new("w1")))
                .with_started_at(Some(now)),
            now,
        );
        assert_eq!(job.version, 2);
        assert_eq!(job.worker_id, Some(WorkerId::new("w1")));

        job.apply_patch(
            JobPatch::new()
                .with_status(JobStatus::Pending)
                .with_worker_id(None)
                .with_log(LogEntry::warn(now, "requeued")),
            now,
        );
        assert_eq!(job.version, 3);
        assert_eq!(job.worker_id, None);
        assert_eq!(job.started_at, Some(now));
        assert_eq!(job.logs.len(), 1);
    }

    #[test]
    fn timeout_deadline_follows_started_at() {
        let mut job = root();
        assert!(job.timeout_deadline().is_none());

        let started = Utc::now();
        job.status = JobStatus::Running;
        job.started_at = Some(started);
        assert!(!job.is_timed_out(started + Duration::seconds(59)));
        assert!(job.is_timed_out(started + Duration::seconds(60)));
    }

    #[test]
    fn invariants_flag_completed_at_mismatch() {
        let mut job = root();
        job.completed_at = Some(Utc::now());
        assert!(job.check_invariants(&StageTable::new()).is_err());

        job.status = JobStatus::Completed;
        assert!(job.check_invariants(&StageTable::new()).is_ok());
    }

    #[test]
    fn invariants_flag_foreign_stage() {
        let job = Job::new_root(ConversationId::new("1"), JobType::Pca, Stage::Load, Utc::now());
        assert!(matches!(
            job.check_invariants(&StageTable::new()),
            Err(DomainError::InvalidStage { .. })
        ));
    }

    #[test]
    fn job_serializes_with_pipeline_names() {
        let job = root().with_config(json!({"k": 1}));
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["status"], json!("PENDING"));
        assert_eq!(value["job_type"], json!("FULL_PIPELINE"));
        assert_eq!(value["job_stage"], json!("LOAD"));
        assert_eq!(value["conversation_id"], json!("42"));

        let back: Job = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
    }
}
