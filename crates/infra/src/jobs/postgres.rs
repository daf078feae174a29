//! Postgres-backed job store.
//!
//! One row per job in the `jobs` table. Logs, failure records and the
//! config/results blobs are stored as `jsonb`.
//!
//! ## Optimistic Concurrency
//!
//! `update_conditional` reads the row, applies the patch in memory and writes
//! it back with `UPDATE ... WHERE job_id = $1 AND version = $2`. When another
//! writer got there first the update touches no row; the store then re-reads
//! the job to report either `NotFound` or `VersionConflict`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) on insert | `23505` | `AlreadyExists` |
//! | Database (other) | Any other | `Unavailable` |
//! | PoolClosed / IO / timeouts | N/A | `Unavailable` |
//! | Column decode | N/A | `Decode` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument};

use jobtree_core::{
    ConversationId, ExpectedVersion, FailureRecord, Job, JobId, JobPatch, JobStatus, LogEntry,
    WorkerId,
};

use super::store::{ConversationQuery, JobStats, JobStore, JobStoreError};

/// Statements run by [`PostgresJobStore::ensure_schema`], in order.
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        job_id          UUID PRIMARY KEY,
        status          TEXT NOT NULL,
        job_type        TEXT NOT NULL,
        job_stage       TEXT NOT NULL,
        conversation_id TEXT NOT NULL,
        priority        INTEGER NOT NULL DEFAULT 0,
        parent_job_id   UUID NULL,
        root_job_id     UUID NULL,
        retry_count     INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
        max_retries     INTEGER NOT NULL DEFAULT 0 CHECK (max_retries >= 0),
        timeout_seconds BIGINT NOT NULL DEFAULT 0 CHECK (timeout_seconds >= 0),
        version         BIGINT NOT NULL CHECK (version >= 1),
        created_at      TIMESTAMPTZ NOT NULL,
        updated_at      TIMESTAMPTZ NOT NULL,
        started_at      TIMESTAMPTZ NULL,
        completed_at    TIMESTAMPTZ NULL,
        worker_id       TEXT NULL,
        job_config      JSONB NOT NULL DEFAULT 'null'::jsonb,
        job_results     JSONB NOT NULL DEFAULT 'null'::jsonb,
        logs            JSONB NOT NULL DEFAULT '[]'::jsonb,
        created_by      TEXT NULL,
        failure         JSONB NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS jobs_conversation_status_created_idx \
     ON jobs (conversation_id, status, created_at)",
    "CREATE INDEX IF NOT EXISTS jobs_root_job_idx ON jobs (root_job_id)",
    "CREATE INDEX IF NOT EXISTS jobs_status_started_idx ON jobs (status, started_at)",
];

const JOB_COLUMNS: &str = r#"
    job_id, status, job_type, job_stage, conversation_id, priority,
    parent_job_id, root_job_id, retry_count, max_retries, timeout_seconds,
    version, created_at, updated_at, started_at, completed_at, worker_id,
    job_config, job_results, logs, created_by, failure
"#;

/// Durable job store on a `sqlx` Postgres pool.
///
/// Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool for `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `jobs` table and its indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn load_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_job", e))?;

        row.map(|row| decode_job(&row)).transpose()
    }

    #[instrument(
        skip(self, job),
        fields(
            job_id = %job.job_id,
            conversation_id = %job.conversation_id,
            root_job_id = %job.root_job_id
        ),
        err
    )]
    pub async fn insert_job(&self, job: Job) -> Result<Job, JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, status, job_type, job_stage, conversation_id, priority,
                parent_job_id, root_job_id, retry_count, max_retries, timeout_seconds,
                version, created_at, updated_at, started_at, completed_at, worker_id,
                job_config, job_results, logs, created_by, failure
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22
            )
            "#,
        )
        .bind(job.job_id.as_uuid())
        .bind(job.status.as_str())
        .bind(job.job_type.as_str())
        .bind(job.job_stage.as_str())
        .bind(job.conversation_id.as_str())
        .bind(job.priority)
        .bind(job.parent_job_id.map(uuid::Uuid::from))
        .bind(job.root_job_id.as_uuid())
        .bind(to_db_count(job.retry_count, "retry_count")?)
        .bind(to_db_count(job.max_retries, "max_retries")?)
        .bind(to_db_i64(job.timeout_seconds, "timeout_seconds")?)
        .bind(to_db_i64(job.version, "version")?)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.worker_id.as_ref().map(WorkerId::as_str))
        .bind(&job.job_config)
        .bind(&job.job_results)
        .bind(Json(&job.logs))
        .bind(job.created_by.as_deref())
        .bind(job.failure.as_ref().map(Json))
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.job_id)
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;

        Ok(job)
    }

    #[instrument(
        skip(self, patch),
        fields(
            job_id = %job_id,
            expected_version = %expected,
            new_version = tracing::field::Empty
        ),
        err
    )]
    pub async fn update_job(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        patch: JobPatch,
    ) -> Result<Job, JobStoreError> {
        let mut job = self
            .load_job(job_id)
            .await?
            .ok_or(JobStoreError::NotFound(job_id))?;
        if !expected.matches(job.version) {
            return Err(JobStoreError::VersionConflict {
                job_id,
                expected: expected.get(),
                actual: job.version,
            });
        }

        job.apply_patch(patch, Utc::now());

        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = $3,
                job_stage = $4,
                worker_id = $5,
                started_at = $6,
                completed_at = $7,
                retry_count = $8,
                job_results = $9,
                failure = $10,
                logs = $11,
                version = $12,
                updated_at = $13
            WHERE job_id = $1 AND version = $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(to_db_i64(expected.get(), "version")?)
        .bind(job.status.as_str())
        .bind(job.job_stage.as_str())
        .bind(job.worker_id.as_ref().map(WorkerId::as_str))
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(to_db_count(job.retry_count, "retry_count")?)
        .bind(&job.job_results)
        .bind(job.failure.as_ref().map(Json))
        .bind(Json(&job.logs))
        .bind(to_db_i64(job.version, "version")?)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;

        if result.rows_affected() == 0 {
            // Lost the race between our read and our write.
            return match self.load_job(job_id).await? {
                None => Err(JobStoreError::NotFound(job_id)),
                Some(current) => Err(JobStoreError::VersionConflict {
                    job_id,
                    expected: expected.get(),
                    actual: current.version,
                }),
            };
        }

        Span::current().record("new_version", job.version);
        Ok(job)
    }

    #[instrument(
        skip(self, query),
        fields(
            conversation_id = %query.conversation_id,
            status = %query.status,
            limit = query.limit
        ),
        err
    )]
    pub async fn find_by_conversation(
        &self,
        query: &ConversationQuery,
    ) -> Result<Vec<Job>, JobStoreError> {
        let order = if query.newest_first { "DESC" } else { "ASC" };
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE conversation_id = $1
                AND status = $2
                AND ($3::text IS NULL OR job_stage = $3)
                AND ($4::text IS NULL OR job_type = $4)
            ORDER BY created_at {order}, job_id {order}
            LIMIT $5
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(query.conversation_id.as_str())
            .bind(query.status.as_str())
            .bind(query.job_stage.map(|s| s.as_str()))
            .bind(query.job_type.map(|t| t.as_str()))
            .bind(to_db_limit(query.limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_conversation", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self), fields(root_job_id = %root_job_id), err)]
    pub async fn find_by_root(&self, root_job_id: JobId) -> Result<Vec<Job>, JobStoreError> {
        // Root rows written before root_job_id existed fall back to their own id.
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE root_job_id = $1
                OR (root_job_id IS NULL AND parent_job_id IS NULL AND job_id = $1)
            ORDER BY created_at ASC, job_id ASC
            "#
        ))
        .bind(root_job_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_root", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self), fields(status = %status), err)]
    pub async fn find_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = $1
            ORDER BY created_at ASC, job_id ASC
            LIMIT $2
            "#
        ))
        .bind(status.as_str())
        .bind(to_db_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_status", e))?;

        rows.iter().map(decode_job).collect()
    }

    /// RUNNING rows past `started_at + timeout_seconds`, earliest deadline
    /// first. Served by `jobs_status_started_idx`.
    #[instrument(skip(self), err)]
    pub async fn find_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = $1
                AND started_at IS NOT NULL
                AND started_at <= $2
                AND started_at + timeout_seconds * INTERVAL '1 second' <= $2
            ORDER BY started_at + timeout_seconds * INTERVAL '1 second' ASC, job_id ASC
            LIMIT $3
            "#
        ))
        .bind(JobStatus::Running.as_str())
        .bind(now)
        .bind(to_db_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_expired", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self), err)]
    pub async fn count_by_status(
        &self,
        conversation_id: Option<&ConversationId>,
    ) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS total
            FROM jobs
            WHERE ($1::text IS NULL OR conversation_id = $1)
            GROUP BY status
            "#,
        )
        .bind(conversation_id.map(ConversationId::as_str))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_by_status", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(decode_error)?;
            let total: i64 = row.try_get("total").map_err(decode_error)?;
            let status = status
                .parse::<JobStatus>()
                .map_err(|e| JobStoreError::Decode(e.to_string()))?;
            stats.record(status, usize::try_from(total).unwrap_or(0));
        }
        Ok(stats)
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.load_job(job_id).await
    }

    async fn put_new(&self, job: Job) -> Result<Job, JobStoreError> {
        self.insert_job(job).await
    }

    async fn update_conditional(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        patch: JobPatch,
    ) -> Result<Job, JobStoreError> {
        self.update_job(job_id, expected, patch).await
    }

    async fn query_by_conversation_and_status(
        &self,
        query: &ConversationQuery,
    ) -> Result<Vec<Job>, JobStoreError> {
        self.find_by_conversation(query).await
    }

    async fn query_by_root(&self, root_job_id: JobId) -> Result<Vec<Job>, JobStoreError> {
        self.find_by_root(root_job_id).await
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        self.find_by_status(status, limit).await
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        self.find_expired(now, limit).await
    }

    async fn stats(
        &self,
        conversation_id: Option<&ConversationId>,
    ) -> Result<JobStats, JobStoreError> {
        self.count_by_status(conversation_id).await
    }
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Unavailable(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            JobStoreError::Decode(format!("{operation}: {err}"))
        }
        _ => JobStoreError::Unavailable(format!("sqlx error in {operation}: {err}")),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

fn decode_error(err: sqlx::Error) -> JobStoreError {
    JobStoreError::Decode(err.to_string())
}

fn to_db_count(value: u32, column: &str) -> Result<i32, JobStoreError> {
    i32::try_from(value)
        .map_err(|_| JobStoreError::Decode(format!("{column} out of range: {value}")))
}

fn to_db_i64(value: u64, column: &str) -> Result<i64, JobStoreError> {
    i64::try_from(value)
        .map_err(|_| JobStoreError::Decode(format!("{column} out of range: {value}")))
}

fn to_db_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    job_id: uuid::Uuid,
    status: String,
    job_type: String,
    job_stage: String,
    conversation_id: String,
    priority: i32,
    parent_job_id: Option<uuid::Uuid>,
    root_job_id: Option<uuid::Uuid>,
    retry_count: i32,
    max_retries: i32,
    timeout_seconds: i64,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    worker_id: Option<String>,
    job_config: JsonValue,
    job_results: JsonValue,
    logs: Json<Vec<LogEntry>>,
    created_by: Option<String>,
    failure: Option<Json<FailureRecord>>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            job_id: row.try_get("job_id")?,
            status: row.try_get("status")?,
            job_type: row.try_get("job_type")?,
            job_stage: row.try_get("job_stage")?,
            conversation_id: row.try_get("conversation_id")?,
            priority: row.try_get("priority")?,
            parent_job_id: row.try_get("parent_job_id")?,
            root_job_id: row.try_get("root_job_id")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            timeout_seconds: row.try_get("timeout_seconds")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            worker_id: row.try_get("worker_id")?,
            job_config: row.try_get("job_config")?,
            job_results: row.try_get("job_results")?,
            logs: row.try_get("logs")?,
            created_by: row.try_get("created_by")?,
            failure: row.try_get("failure")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let job_id = JobId::from_uuid(row.job_id);
        let parse = |field: &str, err: jobtree_core::DomainError| {
            JobStoreError::Decode(format!("job {job_id}: bad {field}: {err}"))
        };
        let parent_job_id = row.parent_job_id.map(JobId::from_uuid);
        // Only a root may omit root_job_id (rows written before the column).
        let root_job_id = match (row.root_job_id, parent_job_id) {
            (Some(root), _) => JobId::from_uuid(root),
            (None, None) => job_id,
            (None, Some(parent)) => {
                return Err(JobStoreError::Decode(format!(
                    "job {job_id}: child of {parent} has no root_job_id"
                )));
            }
        };
        let count = |field: &str, value: i64| {
            u64::try_from(value)
                .map_err(|_| JobStoreError::Decode(format!("job {job_id}: negative {field}")))
        };

        Ok(Job {
            job_id,
            status: row.status.parse().map_err(|e| parse("status", e))?,
            job_type: row.job_type.parse().map_err(|e| parse("job_type", e))?,
            job_stage: row.job_stage.parse().map_err(|e| parse("job_stage", e))?,
            conversation_id: ConversationId::new(row.conversation_id),
            priority: row.priority,
            parent_job_id,
            root_job_id,
            retry_count: u32::try_from(row.retry_count)
                .map_err(|_| JobStoreError::Decode(format!("job {job_id}: negative retry_count")))?,
            max_retries: u32::try_from(row.max_retries)
                .map_err(|_| JobStoreError::Decode(format!("job {job_id}: negative max_retries")))?,
            timeout_seconds: count("timeout_seconds", row.timeout_seconds)?,
            version: count("version", row.version)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            worker_id: row.worker_id.map(WorkerId::new),
            job_config: row.job_config,
            job_results: row.job_results,
            logs: row.logs.0,
            created_by: row.created_by,
            failure: row.failure.map(|f| f.0),
        })
    }
}

fn decode_job(row: &PgRow) -> Result<Job, JobStoreError> {
    let row = JobRow::from_row(row).map_err(|e| {
        JobStoreError::Decode(format!("failed to deserialize job row: {e}"))
    })?;
    Job::try_from(row)
}
