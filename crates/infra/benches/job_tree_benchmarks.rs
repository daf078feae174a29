use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;

use jobtree_core::{ConversationId, ExpectedVersion, JobId, JobType, Stage, StageSequencer, WorkerId};
use jobtree_infra::OrchestratorConfig;
use jobtree_infra::jobs::{InMemoryJobStore, JobOrchestrator, NewChildJob, NewRootJob};
use serde_json::json;
use tokio::runtime::Runtime;

type Orchestrator = JobOrchestrator<Arc<InMemoryJobStore>>;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("failed to build tokio runtime")
}

/// Build a tree of `size` jobs where every job hangs off a random earlier one.
fn build_tree(rt: &Runtime, orchestrator: &Orchestrator, size: usize) -> JobId {
    rt.block_on(async {
        let root = orchestrator
            .factory
            .create_root_job(NewRootJob::new(ConversationId::new("bench"), JobType::FullPipeline))
            .await
            .expect("create root");

        let mut ids = vec![root.job_id];
        for i in 1..size {
            // Deterministic spread without pulling in an RNG.
            let parent = ids[(i * 7919) % ids.len()];
            let child = orchestrator
                .factory
                .create_child_job(NewChildJob::new(parent))
                .await
                .expect("create child");
            ids.push(child.job_id);
        }
        root.job_id
    })
}

fn bench_tree_resolution(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("tree_resolution");

    for size in [10usize, 100, 1_000].iter() {
        let orchestrator = JobOrchestrator::new(InMemoryJobStore::arc(), &OrchestratorConfig::default());
        let root = build_tree(&rt, &orchestrator, *size);
        // Unrelated trees in the same store.
        for _ in 0..10 {
            build_tree(&rt, &orchestrator, *size);
        }

        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::new("get_tree", size), size, |b, _| {
            b.iter(|| {
                let tree = rt
                    .block_on(orchestrator.tree.get_tree(black_box(root)))
                    .expect("tree");
                black_box(tree);
            })
        });
    }

    group.finish();
}

fn bench_job_lifecycle(c: &mut Criterion) {
    let rt = runtime();
    let orchestrator = JobOrchestrator::new(InMemoryJobStore::arc(), &OrchestratorConfig::default());
    let mut group = c.benchmark_group("job_lifecycle");

    group.bench_function("create_claim_complete", |b| {
        b.iter(|| {
            rt.block_on(async {
                let job = orchestrator
                    .factory
                    .create_root_job(NewRootJob::new(ConversationId::new("bench"), JobType::Pca))
                    .await
                    .expect("create");
                let held = orchestrator
                    .policy
                    .claim(job.job_id, ExpectedVersion::new(job.version), WorkerId::new("w"))
                    .await
                    .expect("claim");
                let done = orchestrator
                    .policy
                    .complete(held.job_id, ExpectedVersion::new(held.version), json!({}))
                    .await
                    .expect("complete");
                black_box(done);
            })
        })
    });

    group.finish();
}

fn bench_next_stage(c: &mut Criterion) {
    let sequencer = StageSequencer::default();

    c.bench_function("next_stage_full_pipeline", |b| {
        b.iter(|| {
            let mut stage = Some(Stage::Load);
            for _ in 0..6 {
                stage = Some(sequencer.next_stage(black_box(JobType::FullPipeline), stage));
            }
            black_box(stage);
        })
    });
}

criterion_group!(
    benches,
    bench_tree_resolution,
    bench_job_lifecycle,
    bench_next_stage
);
criterion_main!(benches);
