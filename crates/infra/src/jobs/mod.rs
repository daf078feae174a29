//! Hierarchical job pipeline: storage, creation, tree lookup and worker policy.
//!
//! ## Design
//!
//! - Jobs form trees: every job carries the id of its tree's root
//! - All mutation after creation is a version-guarded conditional update;
//!   there are no locks across processes
//! - Stage progression is a pure function of a configured stage table
//! - Workers are external; they talk to the store only through `JobPolicy`
//!
//! ## Components
//!
//! - `JobStore`: persistence boundary (in-memory or Postgres)
//! - `JobFactory`: creates root and child jobs with correct lineage
//! - `TreeResolver`: lists a tree, tolerating partial store failures
//! - `LatestJobResolver`: most recently created COMPLETED job of a conversation
//! - `JobPolicy`: claim / complete / fail / time out / cancel, plus timeout sweeps
//! - `JobOrchestrator`: all of the above over one store

pub mod error;
pub mod factory;
pub mod latest;
pub mod orchestrator;
pub mod policy;
pub mod postgres;
pub mod store;
pub mod tree;

pub use error::JobTreeError;
pub use factory::{JobFactory, NewChildJob, NewRootJob};
pub use latest::LatestJobResolver;
pub use orchestrator::JobOrchestrator;
pub use policy::{FailureOutcome, JobPolicy, SweepReport, TimeoutDisposition};
pub use postgres::PostgresJobStore;
pub use store::{ConversationQuery, InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use tree::TreeResolver;
