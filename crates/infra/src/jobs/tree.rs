//! Reconstruction of a job tree from its root identifier.
//!
//! The listing combines a direct lookup of the root with the store's
//! `root_job_id` index. Either half may fail on its own; the resolver then
//! answers with what the other half returned and logs a warning. A child
//! inserted concurrently may be missing from one read to the next.

use std::collections::HashMap;

use tracing::{debug, warn};

use jobtree_core::{Job, JobId};

use super::error::JobTreeError;
use super::store::JobStore;

#[derive(Debug, Clone)]
pub struct TreeResolver<S> {
    store: S,
}

impl<S: JobStore> TreeResolver<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// All jobs of the tree rooted at `root_job_id`, root first, then by
    /// `created_at` ascending.
    pub async fn get_tree(&self, root_job_id: JobId) -> Result<Vec<Job>, JobTreeError> {
        let root = self.store.get(root_job_id).await;
        let members = self.store.query_by_root(root_job_id).await;

        let (root, members) = match (root, members) {
            (Err(root_err), Err(members_err)) => {
                warn!(
                    root_job_id = %root_job_id,
                    root_error = %root_err,
                    members_error = %members_err,
                    "job tree unavailable"
                );
                return Err(JobTreeError::StoreUnavailable(format!(
                    "root lookup: {root_err}; membership query: {members_err}"
                )));
            }
            (Ok(root), Err(e)) => {
                warn!(root_job_id = %root_job_id, error = %e, "tree membership query failed; returning root only");
                (root, Vec::new())
            }
            (Err(e), Ok(members)) => {
                warn!(root_job_id = %root_job_id, error = %e, "root lookup failed; returning indexed members only");
                (None, members)
            }
            (Ok(root), Ok(members)) => (root, members),
        };

        let mut merged: HashMap<JobId, Job> = HashMap::with_capacity(members.len() + 1);
        for job in root.into_iter().chain(members) {
            if job.job_id != root_job_id && job.tree_root() != root_job_id {
                continue;
            }
            match merged.get(&job.job_id) {
                Some(seen) if seen.version >= job.version => {}
                _ => {
                    merged.insert(job.job_id, job);
                }
            }
        }

        if merged.is_empty() {
            return Err(JobTreeError::NotFound(root_job_id));
        }

        let mut tree: Vec<Job> = merged.into_values().collect();
        tree.sort_by(|a, b| {
            (a.job_id != root_job_id)
                .cmp(&(b.job_id != root_job_id))
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.job_id.cmp(&b.job_id))
        });

        debug!(root_job_id = %root_job_id, size = tree.len(), "job tree resolved");
        Ok(tree)
    }

    /// Tree containing `job_id`, whichever member it is.
    pub async fn get_tree_by_job_id(&self, job_id: JobId) -> Result<Vec<Job>, JobTreeError> {
        let job = self.store.require(job_id).await?;
        self.get_tree(job.tree_root()).await
    }

    /// Direct children of `job_id`, oldest first.
    pub async fn children_of(&self, job_id: JobId) -> Result<Vec<Job>, JobTreeError> {
        let tree = self.get_tree_by_job_id(job_id).await?;
        let mut children: Vec<Job> = tree
            .into_iter()
            .filter(|job| job.parent_job_id == Some(job_id))
            .collect();
        children.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};

    use jobtree_core::{
        ConversationId, ExpectedVersion, JobPatch, JobStatus, JobType, Stage,
    };

    use crate::jobs::store::{ConversationQuery, InMemoryJobStore, JobStats, JobStoreError};

    /// In-memory store whose root lookup and membership query can be made to
    /// fail, or whose membership query can come back empty.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryJobStore,
        fail_get: AtomicBool,
        fail_query_by_root: AtomicBool,
        empty_query_by_root: AtomicBool,
    }

    fn outage() -> JobStoreError {
        JobStoreError::Unavailable("connection reset".to_string())
    }

    #[async_trait]
    impl JobStore for FlakyStore {
        async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
            if self.fail_get.load(Ordering::SeqCst) {
                return Err(outage());
            }
            self.inner.get(job_id).await
        }

        async fn put_new(&self, job: Job) -> Result<Job, JobStoreError> {
            self.inner.put_new(job).await
        }

        async fn update_conditional(
            &self,
            job_id: JobId,
            expected: ExpectedVersion,
            patch: JobPatch,
        ) -> Result<Job, JobStoreError> {
            self.inner.update_conditional(job_id, expected, patch).await
        }

        async fn query_by_conversation_and_status(
            &self,
            query: &ConversationQuery,
        ) -> Result<Vec<Job>, JobStoreError> {
            self.inner.query_by_conversation_and_status(query).await
        }

        async fn query_by_root(&self, root_job_id: JobId) -> Result<Vec<Job>, JobStoreError> {
            if self.fail_query_by_root.load(Ordering::SeqCst) {
                return Err(outage());
            }
            if self.empty_query_by_root.load(Ordering::SeqCst) {
                return Ok(Vec::new());
            }
            self.inner.query_by_root(root_job_id).await
        }

        async fn list_by_status(
            &self,
            status: JobStatus,
            limit: usize,
        ) -> Result<Vec<Job>, JobStoreError> {
            self.inner.list_by_status(status, limit).await
        }

        async fn list_expired(
            &self,
            now: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<Job>, JobStoreError> {
            self.inner.list_expired(now, limit).await
        }

        async fn stats(
            &self,
            conversation_id: Option<&ConversationId>,
        ) -> Result<JobStats, JobStoreError> {
            self.inner.stats(conversation_id).await
        }
    }

    struct Fixture {
        store: Arc<FlakyStore>,
        root: Job,
        child: Job,
        grandchild: Job,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(FlakyStore::default());
        let base = Utc::now();
        let conversation = ConversationId::new("42");

        let root = Job::new_root(conversation.clone(), JobType::FullPipeline, Stage::Load, base);
        let child = Job::new_child(
            &root,
            conversation.clone(),
            JobType::FullPipeline,
            Stage::Pca,
            base + Duration::seconds(1),
        );
        let grandchild = Job::new_child(
            &child,
            conversation.clone(),
            JobType::FullPipeline,
            Stage::Umap,
            base + Duration::seconds(2),
        );

        // Insert out of order so sorting is exercised.
        store.put_new(grandchild.clone()).await.unwrap();
        store.put_new(root.clone()).await.unwrap();
        store.put_new(child.clone()).await.unwrap();
        store
            .put_new(Job::new_root(conversation, JobType::Pca, Stage::Pca, base))
            .await
            .unwrap();

        Fixture {
            store,
            root,
            child,
            grandchild,
        }
    }

    fn ids(jobs: &[Job]) -> Vec<JobId> {
        jobs.iter().map(|j| j.job_id).collect()
    }

    #[tokio::test]
    async fn tree_is_root_first_then_by_creation() {
        let f = fixture().await;
        let resolver = TreeResolver::new(f.store.clone());

        let tree = resolver.get_tree(f.root.job_id).await.unwrap();
        assert_eq!(
            ids(&tree),
            vec![f.root.job_id, f.child.job_id, f.grandchild.job_id]
        );
    }

    #[tokio::test]
    async fn tree_by_any_member_resolves_the_same_tree() {
        let f = fixture().await;
        let resolver = TreeResolver::new(f.store.clone());

        let from_root = resolver.get_tree(f.root.job_id).await.unwrap();
        let from_leaf = resolver.get_tree_by_job_id(f.grandchild.job_id).await.unwrap();
        assert_eq!(from_root, from_leaf);
    }

    #[tokio::test]
    async fn failing_membership_query_still_returns_root() {
        let f = fixture().await;
        f.store.fail_query_by_root.store(true, Ordering::SeqCst);
        let resolver = TreeResolver::new(f.store.clone());

        let tree = resolver.get_tree(f.root.job_id).await.unwrap();
        assert_eq!(ids(&tree), vec![f.root.job_id]);
    }

    #[tokio::test]
    async fn empty_membership_query_still_returns_root() {
        let f = fixture().await;
        f.store.empty_query_by_root.store(true, Ordering::SeqCst);
        let resolver = TreeResolver::new(f.store.clone());

        let tree = resolver.get_tree(f.root.job_id).await.unwrap();
        assert_eq!(ids(&tree), vec![f.root.job_id]);

        let from_leaf = resolver.get_tree_by_job_id(f.grandchild.job_id).await.unwrap();
        assert_eq!(ids(&from_leaf), vec![f.root.job_id]);
    }

    #[tokio::test]
    async fn failing_root_lookup_returns_indexed_members() {
        let f = fixture().await;
        f.store.fail_get.store(true, Ordering::SeqCst);
        let resolver = TreeResolver::new(f.store.clone());

        let tree = resolver.get_tree(f.root.job_id).await.unwrap();
        assert_eq!(tree.len(), 3);
        assert_eq!(tree[0].job_id, f.root.job_id);
    }

    #[tokio::test]
    async fn both_halves_failing_is_unavailable() {
        let f = fixture().await;
        f.store.fail_get.store(true, Ordering::SeqCst);
        f.store.fail_query_by_root.store(true, Ordering::SeqCst);
        let resolver = TreeResolver::new(f.store.clone());

        let err = resolver.get_tree(f.root.job_id).await.unwrap_err();
        assert!(matches!(err, JobTreeError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn unknown_root_is_not_found() {
        let f = fixture().await;
        let resolver = TreeResolver::new(f.store.clone());
        let missing = JobId::new();

        assert_eq!(
            resolver.get_tree(missing).await.unwrap_err(),
            JobTreeError::NotFound(missing)
        );
        assert_eq!(
            resolver.get_tree_by_job_id(missing).await.unwrap_err(),
            JobTreeError::NotFound(missing)
        );
    }

    #[tokio::test]
    async fn lone_root_is_its_own_tree() {
        let store = InMemoryJobStore::arc();
        let root = store
            .put_new(Job::new_root(
                ConversationId::new("1"),
                JobType::Report,
                Stage::Report,
                Utc::now(),
            ))
            .await
            .unwrap();

        let tree = TreeResolver::new(store).get_tree(root.job_id).await.unwrap();
        assert_eq!(tree, vec![root]);
    }

    #[tokio::test]
    async fn children_of_lists_direct_children_only() {
        let f = fixture().await;
        let resolver = TreeResolver::new(f.store.clone());

        let children = resolver.children_of(f.root.job_id).await.unwrap();
        assert_eq!(ids(&children), vec![f.child.job_id]);
        assert!(resolver.children_of(f.grandchild.job_id).await.unwrap().is_empty());
    }
}
