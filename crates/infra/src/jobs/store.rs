//! Job storage boundary and the in-memory implementation.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use jobtree_core::{
    ConversationId, ExpectedVersion, Job, JobId, JobPatch, JobStatus, JobType, Stage,
};

/// Job store abstraction.
///
/// Every mutation after creation goes through [`JobStore::update_conditional`],
/// which is a compare-and-swap on `version`. Implementations must apply a patch
/// only when the stored version equals the expected one, and must bump the
/// version by exactly one when they do.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Get a job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Get a job by ID, treating absence as [`JobStoreError::NotFound`].
    async fn require(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        self.get(job_id)
            .await?
            .ok_or(JobStoreError::NotFound(job_id))
    }

    /// Insert a new job. Fails if the ID is already taken.
    async fn put_new(&self, job: Job) -> Result<Job, JobStoreError>;

    /// Apply `patch` if the stored version equals `expected`.
    async fn update_conditional(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        patch: JobPatch,
    ) -> Result<Job, JobStoreError>;

    /// Jobs of one conversation in one status, ordered by `created_at`.
    async fn query_by_conversation_and_status(
        &self,
        query: &ConversationQuery,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Jobs whose `root_job_id` equals `root_job_id`.
    ///
    /// Best effort: callers must not rely on the root itself being included.
    async fn query_by_root(&self, root_job_id: JobId) -> Result<Vec<Job>, JobStoreError>;

    /// Jobs in `status`, oldest first.
    async fn list_by_status(&self, status: JobStatus, limit: usize)
    -> Result<Vec<Job>, JobStoreError>;

    /// RUNNING jobs whose deadline is at or before `now`, earliest deadline
    /// first. The deadline filter is applied before `limit`.
    async fn list_expired(&self, now: DateTime<Utc>, limit: usize)
    -> Result<Vec<Job>, JobStoreError>;

    /// Per-status counts, optionally restricted to one conversation.
    async fn stats(&self, conversation_id: Option<&ConversationId>)
    -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("version conflict on job {job_id}: expected {expected}, found {actual}")]
    VersionConflict {
        job_id: JobId,
        expected: u64,
        actual: u64,
    },
    #[error("stored job could not be decoded: {0}")]
    Decode(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Secondary lookup by `(conversation_id, status)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationQuery {
    pub conversation_id: ConversationId,
    pub status: JobStatus,
    pub job_stage: Option<Stage>,
    pub job_type: Option<JobType>,
    pub limit: usize,
    pub newest_first: bool,
}

impl ConversationQuery {
    pub const DEFAULT_LIMIT: usize = 50;

    pub fn new(conversation_id: ConversationId, status: JobStatus) -> Self {
        Self {
            conversation_id,
            status,
            job_stage: None,
            job_type: None,
            limit: Self::DEFAULT_LIMIT,
            newest_first: false,
        }
    }

    pub fn with_stage(mut self, job_stage: Option<Stage>) -> Self {
        self.job_stage = job_stage;
        self
    }

    pub fn with_type(mut self, job_type: Option<JobType>) -> Self {
        self.job_type = job_type;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn newest_first(mut self) -> Self {
        self.newest_first = true;
        self
    }

    /// Stage/type filters (conversation and status are matched by the index).
    pub fn matches_filters(&self, job: &Job) -> bool {
        self.job_stage.is_none_or(|stage| job.job_stage == stage)
            && self.job_type.is_none_or(|job_type| job.job_type == job_type)
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: usize) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Running => self.running += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::TimedOut => self.timed_out += count,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed + self.timed_out
    }
}

type ConversationStatusKey = (ConversationId, JobStatus);

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    by_root: HashMap<JobId, BTreeSet<JobId>>,
    by_conversation_status: HashMap<ConversationStatusKey, BTreeSet<JobId>>,
}

impl Tables {
    fn conversation_key(job: &Job) -> ConversationStatusKey {
        (job.conversation_id.clone(), job.status)
    }

    fn collect(&self, ids: Option<&BTreeSet<JobId>>) -> Vec<Job> {
        ids.into_iter()
            .flatten()
            .filter_map(|id| self.jobs.get(id))
            .cloned()
            .collect()
    }
}

/// In-memory job store for tests/dev.
///
/// Keeps explicit secondary indices keyed by `root_job_id` and by
/// `(conversation_id, status)` so lookups never scan the whole table.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    tables: RwLock<Tables>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> Result<usize, JobStoreError> {
        Ok(self.read()?.jobs.len())
    }

    pub fn is_empty(&self) -> Result<bool, JobStoreError> {
        Ok(self.len()? == 0)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, JobStoreError> {
        self.tables
            .read()
            .map_err(|_| JobStoreError::Unavailable("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, JobStoreError> {
        self.tables
            .write()
            .map_err(|_| JobStoreError::Unavailable("lock poisoned".to_string()))
    }
}

fn sort_by_creation(jobs: &mut [Job], newest_first: bool) {
    jobs.sort_by(|a, b| {
        let order = a
            .created_at
            .cmp(&b.created_at)
            .then_with(|| a.job_id.cmp(&b.job_id));
        if newest_first { order.reverse() } else { order }
    });
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.jobs.get(&job_id).cloned())
    }

    async fn put_new(&self, job: Job) -> Result<Job, JobStoreError> {
        let mut tables = self.write()?;
        if tables.jobs.contains_key(&job.job_id) {
            return Err(JobStoreError::AlreadyExists(job.job_id));
        }

        let id = job.job_id;
        tables
            .by_root
            .entry(job.tree_root())
            .or_default()
            .insert(id);
        tables
            .by_conversation_status
            .entry(Tables::conversation_key(&job))
            .or_default()
            .insert(id);
        tables.jobs.insert(id, job.clone());
        Ok(job)
    }

    async fn update_conditional(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        patch: JobPatch,
    ) -> Result<Job, JobStoreError> {
        let mut tables = self.write()?;
        let Tables {
            jobs,
            by_conversation_status,
            ..
        } = &mut *tables;

        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if !expected.matches(job.version) {
            return Err(JobStoreError::VersionConflict {
                job_id,
                expected: expected.get(),
                actual: job.version,
            });
        }

        let old_key = Tables::conversation_key(job);
        job.apply_patch(patch, Utc::now());
        let new_key = Tables::conversation_key(job);

        if old_key != new_key {
            if let Some(ids) = by_conversation_status.get_mut(&old_key) {
                ids.remove(&job_id);
                if ids.is_empty() {
                    by_conversation_status.remove(&old_key);
                }
            }
            by_conversation_status.entry(new_key).or_default().insert(job_id);
        }

        Ok(job.clone())
    }

    async fn query_by_conversation_and_status(
        &self,
        query: &ConversationQuery,
    ) -> Result<Vec<Job>, JobStoreError> {
        let tables = self.read()?;
        let key = (query.conversation_id.clone(), query.status);

        let mut result: Vec<_> = tables
            .collect(tables.by_conversation_status.get(&key))
            .into_iter()
            .filter(|job| query.matches_filters(job))
            .collect();

        sort_by_creation(&mut result, query.newest_first);
        result.truncate(query.limit);
        Ok(result)
    }

    async fn query_by_root(&self, root_job_id: JobId) -> Result<Vec<Job>, JobStoreError> {
        let tables = self.read()?;
        let mut result = tables.collect(tables.by_root.get(&root_job_id));
        sort_by_creation(&mut result, false);
        Ok(result)
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let tables = self.read()?;
        let mut result: Vec<_> = tables
            .jobs
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect();

        sort_by_creation(&mut result, false);
        result.truncate(limit);
        Ok(result)
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let tables = self.read()?;
        let mut result: Vec<_> = tables
            .jobs
            .values()
            .filter(|job| job.is_timed_out(now))
            .cloned()
            .collect();

        result.sort_by(|a, b| {
            a.timeout_deadline()
                .cmp(&b.timeout_deadline())
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        result.truncate(limit);
        Ok(result)
    }

    async fn stats(
        &self,
        conversation_id: Option<&ConversationId>,
    ) -> Result<JobStats, JobStoreError> {
        let tables = self.read()?;
        let mut stats = JobStats::default();

        for ((conversation, status), ids) in &tables.by_conversation_status {
            if conversation_id.is_none_or(|c| c == conversation) {
                stats.record(*status, ids.len());
            }
        }

        Ok(stats)
    }
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn put_new(&self, job: Job) -> Result<Job, JobStoreError> {
        (**self).put_new(job).await
    }

    async fn update_conditional(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        patch: JobPatch,
    ) -> Result<Job, JobStoreError> {
        (**self).update_conditional(job_id, expected, patch).await
    }

    async fn query_by_conversation_and_status(
        &self,
        query: &ConversationQuery,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).query_by_conversation_and_status(query).await
    }

    async fn query_by_root(&self, root_job_id: JobId) -> Result<Vec<Job>, JobStoreError> {
        (**self).query_by_root(root_job_id).await
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_status(status, limit).await
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_expired(now, limit).await
    }

    async fn stats(
        &self,
        conversation_id: Option<&ConversationId>,
    ) -> Result<JobStats, JobStoreError> {
        (**self).stats(conversation_id).await
    }
}
