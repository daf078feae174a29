//! Configuration loading and representation.
//!
//! Values come from the process environment (a `.env` file is loaded by the
//! binary before this runs). Every key is optional and falls back to the
//! defaults below.

use std::sync::Arc;

use jobtree_core::{EndOfPipeline, StageSequencer, StageTable};
use jobtree_observability::LogFormat;

use crate::jobs::policy::TimeoutDisposition;

pub const ENV_MAX_RETRIES: &str = "JOBTREE_MAX_RETRIES";
pub const ENV_TIMEOUT_SECONDS: &str = "JOBTREE_TIMEOUT_SECONDS";
pub const ENV_STAGE_WRAP: &str = "JOBTREE_STAGE_WRAP";
pub const ENV_TIMEOUT_STATUS: &str = "JOBTREE_TIMEOUT_STATUS";
pub const ENV_LOG_FORMAT: &str = "JOBTREE_LOG_FORMAT";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid value {value:?} for {key}: {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

/// Orchestrator-wide settings shared by the factory and the policy.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// `max_retries` stamped on new root jobs.
    pub default_max_retries: u32,
    /// `timeout_seconds` stamped on new root jobs.
    pub default_timeout_seconds: u64,
    pub stage_table: StageTable,
    pub end_of_pipeline: EndOfPipeline,
    pub timeout_disposition: TimeoutDisposition,
    pub database_url: Option<String>,
    pub log_format: LogFormat,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            default_timeout_seconds: 7200,
            stage_table: StageTable::default(),
            end_of_pipeline: EndOfPipeline::default(),
            timeout_disposition: TimeoutDisposition::default(),
            database_url: None,
            log_format: LogFormat::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup(ENV_MAX_RETRIES) {
            config.default_max_retries = parse(ENV_MAX_RETRIES, &v)?;
        }
        if let Some(v) = lookup(ENV_TIMEOUT_SECONDS) {
            config.default_timeout_seconds = parse(ENV_TIMEOUT_SECONDS, &v)?;
        }
        if let Some(v) = lookup(ENV_STAGE_WRAP) {
            config.end_of_pipeline = parse(ENV_STAGE_WRAP, &v)?;
        }
        if let Some(v) = lookup(ENV_TIMEOUT_STATUS) {
            config.timeout_disposition = parse(ENV_TIMEOUT_STATUS, &v)?;
        }
        if let Some(v) = lookup(ENV_LOG_FORMAT) {
            config.log_format = parse(ENV_LOG_FORMAT, &v)?;
        }
        config.database_url = lookup(ENV_DATABASE_URL).filter(|url| !url.trim().is_empty());

        Ok(config)
    }

    /// Build the stage sequencer described by this configuration.
    pub fn sequencer(&self) -> Arc<StageSequencer> {
        Arc::new(StageSequencer::new(
            self.stage_table.clone(),
            self.end_of_pipeline,
        ))
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = OrchestratorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.default_max_retries, 3);
        assert_eq!(config.default_timeout_seconds, 7200);
        assert_eq!(config.end_of_pipeline, EndOfPipeline::WrapToFirst);
        assert_eq!(config.timeout_disposition, TimeoutDisposition::FoldIntoFailed);
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            (ENV_MAX_RETRIES, "5"),
            (ENV_TIMEOUT_SECONDS, " 60 "),
            (ENV_STAGE_WRAP, "clamp"),
            (ENV_TIMEOUT_STATUS, "timed_out"),
            (ENV_LOG_FORMAT, "pretty"),
            (ENV_DATABASE_URL, "postgres://localhost/jobs"),
        ]))
        .unwrap();

        assert_eq!(config.default_max_retries, 5);
        assert_eq!(config.default_timeout_seconds, 60);
        assert_eq!(config.end_of_pipeline, EndOfPipeline::ClampAtLast);
        assert_eq!(config.timeout_disposition, TimeoutDisposition::DistinctStatus);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/jobs"));
    }

    #[test]
    fn malformed_values_name_the_key() {
        let err = OrchestratorConfig::from_lookup(lookup(&[(ENV_MAX_RETRIES, "lots")]))
            .unwrap_err();
        assert_eq!(err.key, ENV_MAX_RETRIES);
        assert_eq!(err.value, "lots");
    }

    #[test]
    fn sequencer_honours_end_of_pipeline() {
        let config = OrchestratorConfig {
            end_of_pipeline: EndOfPipeline::ClampAtLast,
            ..Default::default()
        };
        let seq = config.sequencer();
        assert_eq!(
            seq.next_stage(jobtree_core::JobType::FullPipeline, Some(jobtree_core::Stage::Complete)),
            jobtree_core::Stage::Complete
        );
    }
}
