use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use criterion::{
    BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main,
};
use serde_json::json;

use forgeq_core::{Job, JobStatus, WorkerId};
use forgeq_infra::lock::{InMemoryLockService, LockService};
use forgeq_infra::{InMemoryJobStore, JobStore};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
}

fn job_types() -> Vec<String> {
    vec!["email".to_string(), "report".to_string()]
}

fn bench_enqueue(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("job_enqueue");
    group.throughput(Throughput::Elements(1));

    group.bench_function("in_memory", |b| {
        let store = InMemoryJobStore::new();
        b.to_async(&rt).iter(|| {
            let store = store.clone();
            async move {
                let job = Job::new("email", json!({ "to": "ops@example.com" }), Utc::now());
                black_box(store.enqueue(job).await.expect("enqueue"));
            }
        });
    });

    group.finish();
}

/// Claim + complete cycle draining a queue of `depth` waiting jobs.
fn bench_claim_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("job_claim_throughput");
    group.sample_size(20);

    for depth in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter_batched(
                || rt.block_on(seeded_store(depth)),
                |store| rt.block_on(drain_queue(store)),
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

async fn seeded_store(depth: usize) -> InMemoryJobStore {
    let store = InMemoryJobStore::new();
    let now = Utc::now();
    for i in 0..depth {
        let job_type = if i % 2 == 0 { "email" } else { "report" };
        store
            .enqueue(Job::new(job_type, json!({ "n": i }), now))
            .await
            .expect("seed");
    }
    store
}

async fn drain_queue(store: InMemoryJobStore) {
    let owner = WorkerId::new("bench");
    let types = job_types();
    loop {
        let now = Utc::now();
        let claimed = store
            .claim_next(&owner, &types, now, now + ChronoDuration::seconds(30))
            .await
            .expect("claim");
        let Some(mut job) = claimed else { break };
        job.complete(now).expect("complete");
        store
            .compare_and_set(&job, JobStatus::Active, Some(&owner))
            .await
            .expect("cas");
    }
}

fn bench_lock_contention(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("lock_acquire_release");

    group.bench_function("uncontended", |b| {
        let locks = Arc::new(InMemoryLockService::new());
        b.to_async(&rt).iter(|| {
            let locks = locks.clone();
            async move {
                let token = locks
                    .acquire("job:sync", "bench", Duration::from_secs(5))
                    .await
                    .expect("acquire");
                locks.release("job:sync", token).await.expect("release");
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_enqueue, bench_claim_throughput, bench_lock_contention);
criterion_main!(benches);
