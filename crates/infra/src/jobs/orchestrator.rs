//! Bundle of the job tree services over one shared store.

use jobtree_core::StageSequencer;

use super::factory::JobFactory;
use super::latest::LatestJobResolver;
use super::policy::JobPolicy;
use super::store::JobStore;
use super::tree::TreeResolver;
use crate::config::OrchestratorConfig;

/// Factory, resolvers and policy wired to the same store.
///
/// `S` is usually an `Arc<impl JobStore>` or a cheaply clonable store such as
/// `PostgresJobStore`.
#[derive(Debug, Clone)]
pub struct JobOrchestrator<S> {
    pub factory: JobFactory<S>,
    pub tree: TreeResolver<S>,
    pub latest: LatestJobResolver<S>,
    pub policy: JobPolicy<S>,
    store: S,
}

impl<S: JobStore + Clone> JobOrchestrator<S> {
    pub fn new(store: S, config: &OrchestratorConfig) -> Self {
        Self {
            factory: JobFactory::new(store.clone(), config),
            tree: TreeResolver::new(store.clone()),
            latest: LatestJobResolver::new(store.clone()),
            policy: JobPolicy::new(store.clone(), config),
            store,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn sequencer(&self) -> &StageSequencer {
        self.factory.sequencer()
    }
}
