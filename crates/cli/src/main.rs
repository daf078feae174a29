//! `jobtree` operator CLI.
//!
//! Drives the job tree services against the Postgres store named by
//! `DATABASE_URL` (or `--database-url`). Every command prints pretty JSON on
//! stdout; logs go to stderr.

use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use tracing::{info, warn};

use jobtree_core::{ConversationId, ExpectedVersion, JobId, JobType, Stage, WorkerId};
use jobtree_infra::OrchestratorConfig;
use jobtree_infra::jobs::{
    FailureOutcome, JobOrchestrator, JobPolicy, JobStore, JobTreeError, NewChildJob, NewRootJob,
    PostgresJobStore, SweepReport,
};
use jobtree_observability::LogFormat;

type Orchestrator = JobOrchestrator<PostgresJobStore>;

#[derive(Parser, Debug)]
#[command(name = "jobtree", version, about = "Inspect and drive analysis job trees")]
struct Cli {
    /// Postgres connection string (overrides DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Log output format: json or pretty (overrides JOBTREE_LOG_FORMAT)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the jobs table and indexes if missing
    Schema,

    /// Create a root job at the first stage of its type
    CreateRoot {
        conversation_id: String,

        #[arg(long, default_value = "full_pipeline")]
        job_type: JobType,

        #[arg(long, default_value_t = 0)]
        priority: i32,

        /// Job configuration as a JSON document
        #[arg(long)]
        config: Option<String>,

        #[arg(long)]
        created_by: Option<String>,

        #[arg(long)]
        max_retries: Option<u32>,

        #[arg(long)]
        timeout_seconds: Option<u64>,
    },

    /// Create a child job; omitted fields are taken from the parent
    CreateChild {
        parent_job_id: JobId,

        #[arg(long)]
        job_type: Option<JobType>,

        /// Defaults to the stage after the parent's
        #[arg(long)]
        stage: Option<Stage>,

        #[arg(long)]
        conversation_id: Option<String>,

        #[arg(long, default_value_t = 0)]
        priority: i32,

        #[arg(long)]
        config: Option<String>,
    },

    /// Show one job
    Get { job_id: JobId },

    /// Show the tree containing a job
    Tree {
        job_id: JobId,

        /// Only list the job's direct children
        #[arg(long)]
        children: bool,
    },

    /// Show the most recently created COMPLETED job of a conversation
    Latest {
        conversation_id: String,

        #[arg(long)]
        stage: Option<Stage>,

        #[arg(long)]
        job_type: Option<JobType>,
    },

    /// Claim a PENDING job for a worker
    Claim {
        job_id: JobId,
        #[arg(long)]
        version: u64,
        #[arg(long)]
        worker: String,
    },

    /// Mark a RUNNING job as completed
    Complete {
        job_id: JobId,
        #[arg(long)]
        version: u64,
        /// Results as a JSON document
        #[arg(long)]
        results: Option<String>,
    },

    /// Report a failure of a RUNNING job
    Fail {
        job_id: JobId,
        #[arg(long)]
        version: u64,
        #[arg(long)]
        message: String,
    },

    /// Cancel a PENDING or RUNNING job
    Cancel {
        job_id: JobId,
        #[arg(long)]
        version: u64,
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },

    /// Time out RUNNING jobs past their deadline
    Sweep {
        #[arg(long, default_value_t = 500)]
        limit: usize,

        /// Keep sweeping every N seconds until interrupted
        #[arg(long)]
        watch: Option<u64>,
    },

    /// Per-status job counts
    Stats {
        #[arg(long)]
        conversation_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = OrchestratorConfig::from_env().context("invalid configuration")?;
    if let Some(url) = cli.database_url {
        config.database_url = Some(url);
    }
    if let Some(format) = cli.log_format {
        config.log_format = format;
    }
    jobtree_observability::init(config.log_format);

    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL must be set (or pass --database-url)")?;
    let store = PostgresJobStore::connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    if let Command::Schema = cli.command {
        store.ensure_schema().await?;
        return print_json(&json!({ "schema": "ok" }));
    }

    let orchestrator = JobOrchestrator::new(store, &config);
    run(cli.command, &orchestrator).await
}

async fn run(command: Command, orchestrator: &Orchestrator) -> anyhow::Result<()> {
    match command {
        Command::Schema => Ok(()),

        Command::CreateRoot {
            conversation_id,
            job_type,
            priority,
            config,
            created_by,
            max_retries,
            timeout_seconds,
        } => {
            let mut request = NewRootJob::new(ConversationId::new(conversation_id), job_type)
                .with_priority(priority)
                .with_config(parse_json(config.as_deref(), "--config")?);
            request.created_by = created_by;
            request.max_retries = max_retries;
            request.timeout_seconds = timeout_seconds;

            print_json(&orchestrator.factory.create_root_job(request).await?)
        }

        Command::CreateChild {
            parent_job_id,
            job_type,
            stage,
            conversation_id,
            priority,
            config,
        } => {
            let mut request = NewChildJob::new(parent_job_id)
                .with_priority(priority)
                .with_config(parse_json(config.as_deref(), "--config")?);
            request.job_type = job_type;
            request.job_stage = stage;
            request.conversation_id = conversation_id.map(ConversationId::new);

            print_json(&orchestrator.factory.create_child_job(request).await?)
        }

        Command::Get { job_id } => print_json(&orchestrator.store().require(job_id).await?),

        Command::Tree { job_id, children } => {
            let jobs = if children {
                orchestrator.tree.children_of(job_id).await?
            } else {
                orchestrator.tree.get_tree_by_job_id(job_id).await?
            };
            print_json(&jobs)
        }

        Command::Latest {
            conversation_id,
            stage,
            job_type,
        } => {
            let job = orchestrator
                .latest
                .get_latest_completed_job(&ConversationId::new(conversation_id), stage, job_type)
                .await?;
            print_json(&job)
        }

        Command::Claim {
            job_id,
            version,
            worker,
        } => {
            let job = orchestrator
                .policy
                .claim(job_id, ExpectedVersion::new(version), WorkerId::new(worker))
                .await?;
            print_json(&job)
        }

        Command::Complete {
            job_id,
            version,
            results,
        } => {
            let results = parse_json(results.as_deref(), "--results")?;
            let job = orchestrator
                .policy
                .complete(job_id, ExpectedVersion::new(version), results)
                .await?;
            print_json(&job)
        }

        Command::Fail {
            job_id,
            version,
            message,
        } => {
            let outcome = orchestrator
                .policy
                .fail(job_id, ExpectedVersion::new(version), message)
                .await?;
            print_outcome(outcome)
        }

        Command::Cancel {
            job_id,
            version,
            reason,
        } => {
            let job = orchestrator
                .policy
                .cancel(job_id, ExpectedVersion::new(version), reason)
                .await?;
            print_json(&job)
        }

        Command::Sweep { limit, watch } => match watch {
            None => print_json(&orchestrator.policy.sweep_timeouts(Utc::now(), limit).await?),
            Some(seconds) => watch_timeouts(orchestrator, limit, seconds.max(1)).await,
        },

        Command::Stats { conversation_id } => {
            let conversation_id = conversation_id.map(ConversationId::new);
            let stats = orchestrator.store().stats(conversation_id.as_ref()).await?;
            print_json(&json!({
                "conversation_id": conversation_id,
                "total": stats.total(),
                "by_status": stats,
            }))
        }
    }
}

/// Sweep on a fixed interval until Ctrl-C.
async fn watch_timeouts(orchestrator: &Orchestrator, limit: usize, seconds: u64) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_secs(seconds));
    info!(interval_secs = seconds, limit, "timeout sweeper started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = sweep_tick(&orchestrator.policy, Utc::now(), limit).await?;
                if let Some(report) = report.filter(|r| r.timed_out() > 0 || r.conflicts > 0) {
                    print_json(&report)?;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("timeout sweeper stopping");
                return Ok(());
            }
        }
    }
}

/// One pass of the watch loop. A store outage skips the pass so the next tick
/// retries; any other error stops the sweeper.
async fn sweep_tick<S: JobStore>(
    policy: &JobPolicy<S>,
    now: DateTime<Utc>,
    limit: usize,
) -> Result<Option<SweepReport>, JobTreeError> {
    match policy.sweep_timeouts(now, limit).await {
        Ok(report) => Ok(Some(report)),
        Err(JobTreeError::StoreUnavailable(reason)) => {
            warn!(error = %reason, "timeout sweep skipped; store unavailable");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn parse_json(raw: Option<&str>, flag: &str) -> anyhow::Result<JsonValue> {
    match raw {
        None => Ok(JsonValue::Null),
        Some(raw) => serde_json::from_str(raw).with_context(|| format!("{flag} is not valid JSON")),
    }
}

fn print_outcome(outcome: FailureOutcome) -> anyhow::Result<()> {
    let label = if outcome.is_requeued() {
        "requeued"
    } else {
        "exhausted"
    };
    print_json(&json!({ "outcome": label, "job": outcome.into_job() }))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
