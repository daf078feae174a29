//! Lookup of the most recently created COMPLETED job of a conversation.

use tracing::debug;

use jobtree_core::{ConversationId, Job, JobStatus, JobType, Stage};

use super::error::JobTreeError;
use super::store::{ConversationQuery, JobStore};

#[derive(Debug, Clone)]
pub struct LatestJobResolver<S> {
    store: S,
}

impl<S: JobStore> LatestJobResolver<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// The COMPLETED job with the greatest `created_at`.
    ///
    /// Ordering is by creation, not by `completed_at`: a job created later but
    /// finished earlier still wins. Exact timestamp ties are unspecified.
    pub async fn get_latest_completed_job(
        &self,
        conversation_id: &ConversationId,
        job_stage: Option<Stage>,
        job_type: Option<JobType>,
    ) -> Result<Job, JobTreeError> {
        let query = ConversationQuery::new(conversation_id.clone(), JobStatus::Completed)
            .with_stage(job_stage)
            .with_type(job_type)
            .with_limit(1)
            .newest_first();

        let latest = self
            .store
            .query_by_conversation_and_status(&query)
            .await?
            .into_iter()
            .next();

        match latest {
            Some(job) => {
                debug!(conversation_id = %conversation_id, job_id = %job.job_id, "latest completed job");
                Ok(job)
            }
            None => Err(JobTreeError::NoCompletedJob {
                conversation_id: conversation_id.clone(),
                job_stage,
                job_type,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{DateTime, Duration, Utc};
    use jobtree_core::{ExpectedVersion, JobPatch, WorkerId};

    use crate::jobs::store::InMemoryJobStore;

    async fn completed(
        store: &InMemoryJobStore,
        conversation: &str,
        job_type: JobType,
        stage: Stage,
        created_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Job {
        let job = store
            .put_new(Job::new_root(
                ConversationId::new(conversation),
                job_type,
                stage,
                created_at,
            ))
            .await
            .unwrap();
        store
            .update_conditional(
                job.job_id,
                ExpectedVersion::new(1),
                JobPatch::new()
                    .with_status(JobStatus::Completed)
                    .with_worker_id(Some(WorkerId::new("w")))
                    .with_completed_at(Some(finished_at)),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn latest_is_by_creation_not_completion() {
        let store = InMemoryJobStore::arc();
        let base = Utc::now();

        let older = completed(
            &store,
            "42",
            JobType::Report,
            Stage::Report,
            base,
            base + Duration::hours(2),
        )
        .await;
        let newer = completed(
            &store,
            "42",
            JobType::Report,
            Stage::Report,
            base + Duration::minutes(1),
            base + Duration::minutes(2),
        )
        .await;

        let resolver = LatestJobResolver::new(store.clone());
        let got = resolver
            .get_latest_completed_job(&ConversationId::new("42"), Some(Stage::Report), None)
            .await
            .unwrap();
        assert_eq!(got.job_id, newer.job_id);
        assert_ne!(got.job_id, older.job_id);
    }

    #[tokio::test]
    async fn filters_by_stage_and_type() {
        let store = InMemoryJobStore::arc();
        let base = Utc::now();

        let report = completed(&store, "42", JobType::Report, Stage::Report, base, base).await;
        let pca = completed(
            &store,
            "42",
            JobType::Pca,
            Stage::Pca,
            base + Duration::seconds(5),
            base + Duration::seconds(5),
        )
        .await;
        let resolver = LatestJobResolver::new(Arc::clone(&store));
        let conversation = ConversationId::new("42");

        let any = resolver.get_latest_completed_job(&conversation, None, None).await.unwrap();
        assert_eq!(any.job_id, pca.job_id);

        let by_stage = resolver
            .get_latest_completed_job(&conversation, Some(Stage::Report), None)
            .await
            .unwrap();
        assert_eq!(by_stage.job_id, report.job_id);

        let by_type = resolver
            .get_latest_completed_job(&conversation, None, Some(JobType::Report))
            .await
            .unwrap();
        assert_eq!(by_type.job_id, report.job_id);
    }

    #[tokio::test]
    async fn pending_jobs_and_other_conversations_are_ignored() {
        let store = InMemoryJobStore::arc();
        store
            .put_new(Job::new_root(
                ConversationId::new("42"),
                JobType::Report,
                Stage::Report,
                Utc::now(),
            ))
            .await
            .unwrap();
        completed(&store, "7", JobType::Report, Stage::Report, Utc::now(), Utc::now()).await;

        let err = LatestJobResolver::new(store)
            .get_latest_completed_job(&ConversationId::new("42"), Some(Stage::Report), None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(
            err,
            JobTreeError::NoCompletedJob {
                conversation_id: ConversationId::new("42"),
                job_stage: Some(Stage::Report),
                job_type: None,
            }
        );
    }
}
