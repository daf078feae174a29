//! Job types, pipeline stages and the stage state machine.
//!
//! Every [`JobType`] owns an ordered, fixed list of [`Stage`]s. The list lives
//! in a [`StageTable`] that is built once and handed to a [`StageSequencer`];
//! nothing here reads shared mutable state or performs I/O.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Kind of pipeline a job runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    FullPipeline,
    Pca,
    Umap,
    TopicNaming,
    Report,
}

impl JobType {
    pub const ALL: [JobType; 5] = [
        JobType::FullPipeline,
        JobType::Pca,
        JobType::Umap,
        JobType::TopicNaming,
        JobType::Report,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::FullPipeline => "FULL_PIPELINE",
            JobType::Pca => "PCA",
            JobType::Umap => "UMAP",
            JobType::TopicNaming => "TOPIC_NAMING",
            JobType::Report => "REPORT",
        }
    }

    /// Built-in stage list for this type.
    pub fn default_stages(&self) -> &'static [Stage] {
        match self {
            JobType::FullPipeline => &[
                Stage::Load,
                Stage::Pca,
                Stage::Umap,
                Stage::Topic,
                Stage::Report,
                Stage::Complete,
            ],
            JobType::Pca => &[Stage::Pca],
            JobType::Umap => &[Stage::Umap],
            JobType::TopicNaming => &[Stage::Topic],
            JobType::Report => &[Stage::Report],
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DomainError::invalid_id(format!("unknown job type: {s}")))
    }
}

/// A named step within a job type's pipeline.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Load,
    Pca,
    Umap,
    Topic,
    Report,
    Complete,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Load,
        Stage::Pca,
        Stage::Umap,
        Stage::Topic,
        Stage::Report,
        Stage::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Load => "LOAD",
            Stage::Pca => "PCA",
            Stage::Umap => "UMAP",
            Stage::Topic => "TOPIC",
            Stage::Report => "REPORT",
            Stage::Complete => "COMPLETE",
        }
    }
}

impl core::fmt::Display for Stage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DomainError::invalid_id(format!("unknown stage: {s}")))
    }
}

/// Job type → ordered stage list.
///
/// Types without an explicit entry fall back to [`JobType::default_stages`],
/// so every type always resolves to a non-empty list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageTable {
    overrides: BTreeMap<JobType, Vec<Stage>>,
}

impl StageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stage list for one job type.
    pub fn with_stages(mut self, job_type: JobType, stages: Vec<Stage>) -> DomainResult<Self> {
        if stages.is_empty() {
            return Err(DomainError::validation(format!(
                "stage list for {job_type} must not be empty"
            )));
        }
        for (idx, stage) in stages.iter().enumerate() {
            if stages[..idx].contains(stage) {
                return Err(DomainError::validation(format!(
                    "stage {stage} appears twice in the {job_type} pipeline"
                )));
            }
        }
        self.overrides.insert(job_type, stages);
        Ok(self)
    }

    pub fn stages(&self, job_type: JobType) -> &[Stage] {
        self.overrides
            .get(&job_type)
            .map(Vec::as_slice)
            .unwrap_or_else(|| job_type.default_stages())
    }

    pub fn first_stage(&self, job_type: JobType) -> Stage {
        // Lists are non-empty by construction.
        self.stages(job_type)[0]
    }

    pub fn contains(&self, job_type: JobType, stage: Stage) -> bool {
        self.stages(job_type).contains(&stage)
    }

    /// Fail with [`DomainError::InvalidStage`] if `stage` is foreign to `job_type`.
    pub fn ensure_contains(&self, job_type: JobType, stage: Stage) -> DomainResult<()> {
        if self.contains(job_type, stage) {
            Ok(())
        } else {
            Err(DomainError::InvalidStage { job_type, stage })
        }
    }
}

/// What `next_stage` returns when the current stage is the last one.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndOfPipeline {
    /// Start over at the first stage (reference behaviour).
    #[default]
    WrapToFirst,
    /// Stay on the last stage.
    ClampAtLast,
}

impl FromStr for EndOfPipeline {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wrap" | "wrap_to_first" => Ok(Self::WrapToFirst),
            "clamp" | "clamp_at_last" => Ok(Self::ClampAtLast),
            other => Err(DomainError::validation(format!(
                "unknown end-of-pipeline policy: {other} (expected wrap|clamp)"
            ))),
        }
    }
}

/// Pure mapping `(job type, current stage) → next stage`.
#[derive(Debug, Clone, Default)]
pub struct StageSequencer {
    table: StageTable,
    end_of_pipeline: EndOfPipeline,
}

impl StageSequencer {
    pub fn new(table: StageTable, end_of_pipeline: EndOfPipeline) -> Self {
        Self {
            table,
            end_of_pipeline,
        }
    }

    pub fn table(&self) -> &StageTable {
        &self.table
    }

    pub fn end_of_pipeline(&self) -> EndOfPipeline {
        self.end_of_pipeline
    }

    pub fn first_stage(&self, job_type: JobType) -> Stage {
        self.table.first_stage(job_type)
    }

    pub fn is_final_stage(&self, job_type: JobType, stage: Stage) -> bool {
        self.table.stages(job_type).last() == Some(&stage)
    }

    /// Stage that follows `current` in `job_type`'s pipeline.
    ///
    /// An absent or foreign `current` yields the first stage.
    pub fn next_stage(&self, job_type: JobType, current: Option<Stage>) -> Stage {
        let stages = self.table.stages(job_type);
        let Some(idx) = current.and_then(|c| stages.iter().position(|s| *s == c)) else {
            return stages[0];
        };

        match stages.get(idx + 1) {
            Some(next) => *next,
            None => match self.end_of_pipeline {
                EndOfPipeline::WrapToFirst => stages[0],
                EndOfPipeline::ClampAtLast => stages[idx],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn wrapping() -> StageSequencer {
        StageSequencer::default()
    }

    fn clamping() -> StageSequencer {
        StageSequencer::new(StageTable::new(), EndOfPipeline::ClampAtLast)
    }

    #[test]
    fn full_pipeline_walks_in_order() {
        let seq = wrapping();
        let t = JobType::FullPipeline;
        assert_eq!(seq.next_stage(t, None), Stage::Load);
        assert_eq!(seq.next_stage(t, Some(Stage::Load)), Stage::Pca);
        assert_eq!(seq.next_stage(t, Some(Stage::Pca)), Stage::Umap);
        assert_eq!(seq.next_stage(t, Some(Stage::Umap)), Stage::Topic);
        assert_eq!(seq.next_stage(t, Some(Stage::Topic)), Stage::Report);
        assert_eq!(seq.next_stage(t, Some(Stage::Report)), Stage::Complete);
    }

    #[test]
    fn last_stage_wraps_by_default() {
        assert_eq!(
            wrapping().next_stage(JobType::FullPipeline, Some(Stage::Complete)),
            Stage::Load
        );
    }

    #[test]
    fn last_stage_clamps_when_configured() {
        assert_eq!(
            clamping().next_stage(JobType::FullPipeline, Some(Stage::Complete)),
            Stage::Complete
        );
    }

    #[test]
    fn single_stage_types_always_return_their_stage() {
        let seq = wrapping();
        assert_eq!(seq.next_stage(JobType::Pca, Some(Stage::Pca)), Stage::Pca);
        assert_eq!(seq.next_stage(JobType::TopicNaming, None), Stage::Topic);
        assert_eq!(seq.next_stage(JobType::Report, Some(Stage::Load)), Stage::Report);
    }

    #[test]
    fn foreign_stage_restarts_pipeline() {
        assert_eq!(
            wrapping().next_stage(JobType::Umap, Some(Stage::Report)),
            Stage::Umap
        );
    }

    #[test]
    fn overrides_replace_stage_list() {
        let table = StageTable::new()
            .with_stages(JobType::Report, vec![Stage::Topic, Stage::Report])
            .unwrap();
        let seq = StageSequencer::new(table, EndOfPipeline::WrapToFirst);
        assert_eq!(seq.first_stage(JobType::Report), Stage::Topic);
        assert_eq!(seq.next_stage(JobType::Report, Some(Stage::Topic)), Stage::Report);
        assert!(seq.is_final_stage(JobType::Report, Stage::Report));
    }

    #[test]
    fn overrides_reject_empty_and_duplicate_lists() {
        assert!(StageTable::new().with_stages(JobType::Pca, vec![]).is_err());
        assert!(
            StageTable::new()
                .with_stages(JobType::Pca, vec![Stage::Pca, Stage::Pca])
                .is_err()
        );
    }

    #[test]
    fn ensure_contains_reports_invalid_stage() {
        let err = StageTable::new()
            .ensure_contains(JobType::Pca, Stage::Load)
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::InvalidStage {
                job_type: JobType::Pca,
                stage: Stage::Load
            }
        );
    }

    #[test]
    fn names_parse_case_insensitively() {
        assert_eq!("full_pipeline".parse::<JobType>().unwrap(), JobType::FullPipeline);
        assert_eq!("TOPIC".parse::<Stage>().unwrap(), Stage::Topic);
        assert!("SHUFFLE".parse::<Stage>().is_err());
        assert_eq!("clamp".parse::<EndOfPipeline>().unwrap(), EndOfPipeline::ClampAtLast);
    }

    #[test]
    fn serde_uses_screaming_snake_case() {
        assert_eq!(
            serde_json::to_value(JobType::TopicNaming).unwrap(),
            serde_json::json!("TOPIC_NAMING")
        );
        assert_eq!(serde_json::to_value(Stage::Umap).unwrap(), serde_json::json!("UMAP"));
    }

    fn any_job_type() -> impl Strategy<Value = JobType> {
        prop::sample::select(JobType::ALL.to_vec())
    }

    fn any_stage() -> impl Strategy<Value = Option<Stage>> {
        prop::option::of(prop::sample::select(Stage::ALL.to_vec()))
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: the next stage always belongs to the job type's pipeline.
        #[test]
        fn next_stage_stays_inside_pipeline(job_type in any_job_type(), current in any_stage()) {
            for seq in [wrapping(), clamping()] {
                let next = seq.next_stage(job_type, current);
                prop_assert!(seq.table().contains(job_type, next));
            }
        }

        /// Property: the mapping is deterministic.
        #[test]
        fn next_stage_is_pure(job_type in any_job_type(), current in any_stage()) {
            let seq = wrapping();
            prop_assert_eq!(seq.next_stage(job_type, current), seq.next_stage(job_type, current));
        }

        /// Property: walking a pipeline with wrap returns to the start after one lap.
        #[test]
        fn wrap_completes_a_lap(job_type in any_job_type()) {
            let seq = wrapping();
            let first = seq.first_stage(job_type);
            let mut stage = first;
            for _ in 0..seq.table().stages(job_type).len() {
                stage = seq.next_stage(job_type, Some(stage));
            }
            prop_assert_eq!(stage, first);
        }
    }
}
