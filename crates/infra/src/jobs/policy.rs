//! Worker-facing state transitions with retry and timeout handling.
//!
//! ## Design
//!
//! - Every operation takes the version the caller last observed and issues a
//!   single conditional update; losing a race surfaces as `VersionConflict`
//!   and leaves the job untouched
//! - A failure (reported or timed out) re-queues the job while
//!   `retry_count < max_retries`, otherwise it ends the job
//! - Timeouts are detected by `sweep_timeouts`; scheduling the sweep is up to
//!   the caller
//! - Cancellation only records a terminal status; running workers are never
//!   interrupted

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use jobtree_core::{
    DomainError, ExpectedVersion, FailureReason, FailureRecord, Job, JobId, JobPatch, JobStatus,
    LogEntry, WorkerId,
};

use super::error::JobTreeError;
use super::store::JobStore;
use crate::config::OrchestratorConfig;

/// Terminal status of a job that timed out with no retries left.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutDisposition {
    /// FAILED, with `failure.reason = TIMEOUT_EXCEEDED`.
    #[default]
    FoldIntoFailed,
    /// TIMED_OUT.
    DistinctStatus,
}

impl TimeoutDisposition {
    fn terminal_status(self) -> JobStatus {
        match self {
            TimeoutDisposition::FoldIntoFailed => JobStatus::Failed,
            TimeoutDisposition::DistinctStatus => JobStatus::TimedOut,
        }
    }
}

impl FromStr for TimeoutDisposition {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "failed" | "fold" => Ok(Self::FoldIntoFailed),
            "timed_out" | "distinct" => Ok(Self::DistinctStatus),
            other => Err(DomainError::validation(format!(
                "unknown timeout disposition: {other} (expected failed|timed_out)"
            ))),
        }
    }
}

/// Result of a failure or timeout transition.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Back to PENDING with `retry_count` incremented.
    Requeued(Job),
    /// Moved to a terminal status.
    Exhausted(Job),
}

impl FailureOutcome {
    pub fn job(&self) -> &Job {
        match self {
            FailureOutcome::Requeued(job) | FailureOutcome::Exhausted(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            FailureOutcome::Requeued(job) | FailureOutcome::Exhausted(job) => job,
        }
    }

    pub fn is_requeued(&self) -> bool {
        matches!(self, FailureOutcome::Requeued(_))
    }
}

/// Counts from one timeout sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Expired RUNNING jobs listed.
    pub examined: usize,
    pub requeued: usize,
    pub exhausted: usize,
    /// Jobs another writer changed between listing and update.
    pub conflicts: usize,
}

impl SweepReport {
    pub fn timed_out(&self) -> usize {
        self.requeued + self.exhausted
    }
}

#[derive(Debug, Clone)]
pub struct JobPolicy<S> {
    store: S,
    timeout_disposition: TimeoutDisposition,
}

impl<S: JobStore> JobPolicy<S> {
    pub fn new(store: S, config: &OrchestratorConfig) -> Self {
        Self {
            store,
            timeout_disposition: config.timeout_disposition,
        }
    }

    pub fn timeout_disposition(&self) -> TimeoutDisposition {
        self.timeout_disposition
    }

    /// PENDING → RUNNING, held by `worker_id`.
    pub async fn claim(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        worker_id: WorkerId,
    ) -> Result<Job, JobTreeError> {
        self.load_for(job_id, expected, &[JobStatus::Pending], "claim")
            .await?;

        let now = Utc::now();
        let patch = JobPatch::new()
            .with_status(JobStatus::Running)
            .with_worker_id(Some(worker_id.clone()))
            .with_started_at(Some(now))
            .with_log(LogEntry::info(now, format!("claimed by worker {worker_id}")));

        let job = self.store.update_conditional(job_id, expected, patch).await?;
        info!(job_id = %job_id, worker_id = %worker_id, version = job.version, "job claimed");
        Ok(job)
    }

    /// RUNNING → COMPLETED with `results`.
    pub async fn complete(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        results: JsonValue,
    ) -> Result<Job, JobTreeError> {
        self.load_for(job_id, expected, &[JobStatus::Running], "complete")
            .await?;

        let now = Utc::now();
        let patch = JobPatch::new()
            .with_status(JobStatus::Completed)
            .with_completed_at(Some(now))
            .with_results(results)
            .with_failure(None)
            .with_log(LogEntry::info(now, "completed"));

        let job = self.store.update_conditional(job_id, expected, patch).await?;
        info!(job_id = %job_id, job_stage = %job.job_stage, "job completed");
        Ok(job)
    }

    /// Record a worker-reported failure of a RUNNING job.
    pub async fn fail(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        message: impl Into<String>,
    ) -> Result<FailureOutcome, JobTreeError> {
        let job = self
            .load_for(job_id, expected, &[JobStatus::Running], "fail")
            .await?;

        let failure = Failure {
            retry_reason: FailureReason::Error,
            exhausted_reason: FailureReason::RetryExhausted,
            exhausted_status: JobStatus::Failed,
            message: message.into(),
            at: Utc::now(),
        };
        self.apply_failure(job, expected, failure).await
    }

    /// Record that a RUNNING job overran its timeout as of `now`.
    pub async fn time_out(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, JobTreeError> {
        let job = self
            .load_for(job_id, expected, &[JobStatus::Running], "time out")
            .await?;
        if !job.is_timed_out(now) {
            return Err(DomainError::invalid_transition(job_id, job.status, "time out").into());
        }

        let failure = Failure {
            retry_reason: FailureReason::TimeoutExceeded,
            exhausted_reason: FailureReason::TimeoutExceeded,
            exhausted_status: self.timeout_disposition.terminal_status(),
            message: format!("exceeded timeout of {}s", job.timeout_seconds),
            at: now,
        };
        self.apply_failure(job, expected, failure).await
    }

    /// Move a PENDING or RUNNING job to FAILED without retrying.
    pub async fn cancel(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        reason: impl Into<String>,
    ) -> Result<Job, JobTreeError> {
        self.load_for(
            job_id,
            expected,
            &[JobStatus::Pending, JobStatus::Running],
            "cancel",
        )
        .await?;

        let now = Utc::now();
        let reason = reason.into();
        let patch = JobPatch::new()
            .with_status(JobStatus::Failed)
            .with_failure(Some(FailureRecord::new(
                FailureReason::Cancelled,
                reason.clone(),
                now,
            )))
            .with_log(LogEntry::warn(now, format!("cancelled: {reason}")));

        let job = self.store.update_conditional(job_id, expected, patch).await?;
        info!(job_id = %job_id, reason = %reason, "job cancelled");
        Ok(job)
    }

    /// Time out up to `limit` RUNNING jobs whose deadline is at or before
    /// `now`, earliest deadline first.
    pub async fn sweep_timeouts(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<SweepReport, JobTreeError> {
        let expired = self.store.list_expired(now, limit).await?;
        let mut report = SweepReport {
            examined: expired.len(),
            ..Default::default()
        };

        for job in &expired {
            match self
                .time_out(job.job_id, ExpectedVersion::new(job.version), now)
                .await
            {
                Ok(FailureOutcome::Requeued(_)) => report.requeued += 1,
                Ok(FailureOutcome::Exhausted(_)) => report.exhausted += 1,
                Err(
                    e @ (JobTreeError::VersionConflict { .. }
                    | JobTreeError::InvalidTransition { .. }),
                ) => {
                    debug!(job_id = %job.job_id, error = %e, "timeout sweep lost race");
                    report.conflicts += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if report.timed_out() > 0 || report.conflicts > 0 {
            info!(
                examined = report.examined,
                requeued = report.requeued,
                exhausted = report.exhausted,
                conflicts = report.conflicts,
                "timeout sweep finished"
            );
        }
        Ok(report)
    }

    /// Load a job and check it is at `expected` and in one of `allowed`.
    async fn load_for(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        allowed: &[JobStatus],
        operation: &'static str,
    ) -> Result<Job, JobTreeError> {
        let job = self.store.require(job_id).await?;
        if !expected.matches(job.version) {
            return Err(JobTreeError::VersionConflict {
                job_id,
                expected: expected.get(),
                actual: job.version,
            });
        }
        if !allowed.contains(&job.status) {
            return Err(DomainError::invalid_transition(job_id, job.status, operation).into());
        }
        Ok(job)
    }

    async fn apply_failure(
        &self,
        job: Job,
        expected: ExpectedVersion,
        failure: Failure,
    ) -> Result<FailureOutcome, JobTreeError> {
        let job_id = job.job_id;

        if job.has_retries_left() {
            let attempt = job.retry_count + 1;
            let patch = JobPatch::new()
                .with_status(JobStatus::Pending)
                .with_retry_count(attempt)
                .with_worker_id(None)
                .with_started_at(None)
                .with_failure(Some(FailureRecord::new(
                    failure.retry_reason,
                    failure.message.clone(),
                    failure.at,
                )))
                .with_log(LogEntry::warn(
                    failure.at,
                    format!(
                        "retry {attempt}/{} after failure: {}",
                        job.max_retries, failure.message
                    ),
                ));

            let job = self.store.update_conditional(job_id, expected, patch).await?;
            warn!(
                job_id = %job_id,
                retry_count = attempt,
                max_retries = job.max_retries,
                reason = ?failure.retry_reason,
                "job requeued"
            );
            return Ok(FailureOutcome::Requeued(job));
        }

        let patch = JobPatch::new()
            .with_status(failure.exhausted_status)
            .with_failure(Some(FailureRecord::new(
                failure.exhausted_reason,
                failure.message.clone(),
                failure.at,
            )))
            .with_log(LogEntry::error(
                failure.at,
                format!(
                    "giving up after {} retries: {}",
                    job.retry_count, failure.message
                ),
            ));

        let job = self.store.update_conditional(job_id, expected, patch).await?;
        warn!(
            job_id = %job_id,
            status = %job.status,
            reason = ?failure.exhausted_reason,
            "job failed permanently"
        );
        Ok(FailureOutcome::Exhausted(job))
    }
}

struct Failure {
    retry_reason: FailureReason,
    exhausted_reason: FailureReason,
    exhausted_status: JobStatus,
    message: String,
    at: DateTime<Utc>,
}
