//! Creation of root and child jobs.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::info;

use jobtree_core::{ConversationId, Job, JobId, JobType, LogEntry, Stage, StageSequencer};

use super::error::JobTreeError;
use super::store::{JobStore, JobStoreError};
use crate::config::OrchestratorConfig;

/// Request for a new root job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRootJob {
    pub conversation_id: ConversationId,
    pub job_type: JobType,
    pub priority: i32,
    pub job_config: JsonValue,
    pub created_by: Option<String>,
    /// Falls back to `OrchestratorConfig::default_max_retries`.
    pub max_retries: Option<u32>,
    /// Falls back to `OrchestratorConfig::default_timeout_seconds`.
    pub timeout_seconds: Option<u64>,
}

impl NewRootJob {
    pub fn new(conversation_id: ConversationId, job_type: JobType) -> Self {
        Self {
            conversation_id,
            job_type,
            priority: 0,
            job_config: JsonValue::Null,
            created_by: None,
            max_retries: None,
            timeout_seconds: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_config(mut self, job_config: JsonValue) -> Self {
        self.job_config = job_config;
        self
    }

    pub fn with_created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = Some(created_by.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }
}

/// Request for a child job. Omitted fields are taken from the parent.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChildJob {
    pub parent_job_id: JobId,
    pub job_type: Option<JobType>,
    /// Defaults to the stage after the parent's.
    pub job_stage: Option<Stage>,
    pub conversation_id: Option<ConversationId>,
    pub priority: i32,
    pub job_config: JsonValue,
}

impl NewChildJob {
    pub fn new(parent_job_id: JobId) -> Self {
        Self {
            parent_job_id,
            job_type: None,
            job_stage: None,
            conversation_id: None,
            priority: 0,
            job_config: JsonValue::Null,
        }
    }

    pub fn with_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }

    pub fn with_stage(mut self, job_stage: Stage) -> Self {
        self.job_stage = Some(job_stage);
        self
    }

    pub fn with_conversation(mut self, conversation_id: ConversationId) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_config(mut self, job_config: JsonValue) -> Self {
        self.job_config = job_config;
        self
    }
}

/// Builds jobs with correct tree linkage and inserts them.
#[derive(Debug, Clone)]
pub struct JobFactory<S> {
    store: S,
    sequencer: Arc<StageSequencer>,
    default_max_retries: u32,
    default_timeout_seconds: u64,
}

impl<S: JobStore> JobFactory<S> {
    pub fn new(store: S, config: &OrchestratorConfig) -> Self {
        Self {
            store,
            sequencer: config.sequencer(),
            default_max_retries: config.default_max_retries,
            default_timeout_seconds: config.default_timeout_seconds,
        }
    }

    pub fn sequencer(&self) -> &StageSequencer {
        &self.sequencer
    }

    /// Create a PENDING root job at the first stage of its type.
    pub async fn create_root_job(&self, request: NewRootJob) -> Result<Job, JobTreeError> {
        let now = Utc::now();
        let stage = self.sequencer.first_stage(request.job_type);

        let created = format!("created {} job at stage {}", request.job_type, stage);

        let job = Job::new_root(request.conversation_id, request.job_type, stage, now)
            .with_priority(request.priority)
            .with_config(request.job_config)
            .with_created_by(request.created_by)
            .with_retry_limits(
                request.max_retries.unwrap_or(self.default_max_retries),
                request
                    .timeout_seconds
                    .unwrap_or(self.default_timeout_seconds),
            )
            .with_log(LogEntry::info(now, created));

        let job = self.insert(job).await?;
        info!(
            job_id = %job.job_id,
            conversation_id = %job.conversation_id,
            job_type = %job.job_type,
            job_stage = %job.job_stage,
            "root job created"
        );
        Ok(job)
    }

    /// Create a PENDING child of an existing job.
    pub async fn create_child_job(&self, request: NewChildJob) -> Result<Job, JobTreeError> {
        let parent = match self.store.require(request.parent_job_id).await {
            Ok(parent) => parent,
            Err(JobStoreError::NotFound(id)) => return Err(JobTreeError::ParentNotFound(id)),
            Err(e) => return Err(e.into()),
        };

        let job_type = request.job_type.unwrap_or(parent.job_type);
        let job_stage = match request.job_stage {
            Some(stage) => {
                self.sequencer.table().ensure_contains(job_type, stage)?;
                stage
            }
            None => self.sequencer.next_stage(job_type, Some(parent.job_stage)),
        };
        let conversation_id = request
            .conversation_id
            .unwrap_or_else(|| parent.conversation_id.clone());

        let now = Utc::now();
        let child = Job::new_child(&parent, conversation_id, job_type, job_stage, now)
            .with_priority(request.priority)
            .with_config(request.job_config);
        let lineage = format!(
            "created as child of {} in tree {} at stage {}",
            parent.job_id, child.root_job_id, child.job_stage
        );
        let child = self.insert(child.with_log(LogEntry::info(now, lineage))).await?;

        info!(
            job_id = %child.job_id,
            parent_job_id = %parent.job_id,
            root_job_id = %child.root_job_id,
            job_stage = %child.job_stage,
            "child job created"
        );
        Ok(child)
    }

    async fn insert(&self, job: Job) -> Result<Job, JobTreeError> {
        job.check_invariants(self.sequencer.table())?;
        Ok(self.store.put_new(job).await?)
    }
}
