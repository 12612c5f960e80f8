//! Ledger write and query benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rvs_core::{ContentId, ContentSelection, Store, CORE_REPOSITORY_TYPE};
use tokio::runtime::Runtime;

fn bench_bulk_add(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("bulk_add");

    for size in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(format!("{}_units", size)), &size, |b, &size| {
            let (store, repo) = rt.block_on(async {
                let store = Store::open_in_memory().unwrap();
                let repo = store
                    .create_repository("bench", CORE_REPOSITORY_TYPE, None)
                    .await
                    .unwrap();
                (store, repo)
            });
            let units = rt.block_on(store.register_contents("file.file", size)).unwrap();

            b.to_async(&rt).iter(|| async {
                let mut open = repo.begin_version(None).await.unwrap();
                open.add_content(black_box(&units)).await.unwrap();
                // abort so every iteration starts from the same state
                open.abort().await.unwrap();
            });
        });
    }
    group.finish();
}

fn bench_content_query(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("content_at");

    for versions in [10usize, 100] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}_versions", versions)),
            &versions,
            |b, &versions| {
                let latest = rt.block_on(async {
                    let store = Store::open_in_memory().unwrap();
                    let repo = store
                        .create_repository("history", CORE_REPOSITORY_TYPE, None)
                        .await
                        .unwrap();
                    let mut latest = None;
                    let mut previous: Vec<ContentId> = Vec::new();
                    for _ in 0..versions {
                        let units = store.register_contents("file.file", 50).await.unwrap();
                        let remove = ContentSelection::Units(previous.iter().take(10).copied().collect());
                        latest = repo.modify(None, &units, &remove).await.unwrap();
                        previous = units;
                    }
                    latest.unwrap()
                });

                b.to_async(&rt)
                    .iter(|| async { black_box(latest.content().await.unwrap().len()) });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_bulk_add, bench_content_query);
criterion_main!(benches);
