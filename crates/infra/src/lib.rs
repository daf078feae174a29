//! Infrastructure layer: job stores, job tree services, configuration.

pub mod config;
pub mod jobs;

pub use config::{ConfigError, OrchestratorConfig};
