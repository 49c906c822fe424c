use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use crmflow_core::{JobType, MessageId, OrganizationId};
use crmflow_infra::jobs::{InMemoryJobStore, JobStore, NewJob, DEFAULT_CLAIM_LEASE};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
}

fn normalize_job(org: OrganizationId, priority: i32) -> NewJob {
    NewJob::message(
        org,
        JobType::NormalizeMessage,
        MessageId::new(),
        priority,
        serde_json::json!({ "source": "bench" }),
    )
}

/// Enqueue cost grows with the in-flight scan; measure it at a few queue sizes.
fn bench_enqueue(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("job_store_enqueue");
    group.throughput(Throughput::Elements(1));

    for queued in [0usize, 1_000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(queued), queued, |b, &queued| {
            let store = InMemoryJobStore::new();
            let org = OrganizationId::new();
            rt.block_on(async {
                for i in 0..queued {
                    store.enqueue(normalize_job(org, (i % 20) as i32)).await.unwrap();
                }
            });

            b.iter(|| {
                rt.block_on(async {
                    black_box(store.enqueue(normalize_job(org, 10)).await.unwrap());
                })
            });
        });
    }

    group.finish();
}

fn bench_claim_batch(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("job_store_claim_batch");

    for batch_size in [1u32, 20, 100].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            batch_size,
            |b, &batch_size| {
                b.iter_batched(
                    || {
                        let store = InMemoryJobStore::new();
                        let org = OrganizationId::new();
                        rt.block_on(async {
                            for i in 0..2_000 {
                                store.enqueue(normalize_job(org, i % 20)).await.unwrap();
                            }
                        });
                        store
                    },
                    |store| {
                        rt.block_on(async {
                            black_box(
                                store
                                    .claim_batch(JobType::NormalizeMessage, batch_size, DEFAULT_CLAIM_LEASE)
                                    .await
                                    .unwrap(),
                            );
                        })
                    },
                    criterion::BatchSize::LargeInput,
                );
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_enqueue, bench_claim_batch);
criterion_main!(benches);
