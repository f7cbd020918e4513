//! Benchmarks for the chatstore storage engine
//!
//! Run with: cargo bench

use chatstore::accounts::{AccountRecord, BlobHeap, TreeStore};
use chatstore::storage::*;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tempfile::tempdir;

fn create_test_payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| b'a' + (i % 26) as u8).collect()
}

fn bench_event_log(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("event_log");

    group.bench_function("append_single", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let dir = tempdir().unwrap();
                let log = EventLog::open(dir.path(), DEFAULT_BLOCK_CAPACITY, DEFAULT_READ_LIMIT)
                    .await
                    .unwrap();
                let payload = create_test_payload(64);

                let start = std::time::Instant::now();

                for i in 0..iters {
                    log.append(i as i64, payload.clone()).await.unwrap();
                }

                start.elapsed()
            })
        });
    });

    group.bench_function("append_small_blocks", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let dir = tempdir().unwrap();
                // Every tenth append starts a block
                let log = EventLog::open(dir.path(), 10, DEFAULT_READ_LIMIT).await.unwrap();
                let payload = create_test_payload(64);

                let start = std::time::Instant::now();

                for i in 0..iters {
                    log.append(i as i64, payload.clone()).await.unwrap();
                }

                start.elapsed()
            })
        });
    });

    for size in [100, 1000] {
        group.throughput(Throughput::Elements(size as u64));

        group.bench_function(format!("range_query_{}", size), |b| {
            b.iter_custom(|iters| {
                rt.block_on(async {
                    let dir = tempdir().unwrap();
                    let log = EventLog::open(dir.path(), 100, DEFAULT_READ_LIMIT)
                        .await
                        .unwrap();
                    let payload = create_test_payload(64);

                    // Setup: 5000 entries one second apart
                    for i in 0..5000i64 {
                        log.append(i * 1000, payload.clone()).await.unwrap();
                    }

                    let from = 1000 * 1000;
                    let to = from + (size as i64 - 1) * 1000;

                    let start = std::time::Instant::now();

                    for _ in 0..iters {
                        let entries = log.range_query(black_box(from), black_box(to)).await.unwrap();
                        assert_eq!(entries.len(), size);
                    }

                    start.elapsed()
                })
            });
        });
    }

    group.throughput(Throughput::Elements(20));
    group.bench_function("near_query_20", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let dir = tempdir().unwrap();
                let log = EventLog::open(dir.path(), 100, DEFAULT_READ_LIMIT).await.unwrap();
                let payload = create_test_payload(64);

                for i in 0..5000i64 {
                    log.append(i * 1000, payload.clone()).await.unwrap();
                }

                let start = std::time::Instant::now();

                for _ in 0..iters {
                    let _ = log.near_query(black_box(2_500_000), 20, true).await.unwrap();
                }

                start.elapsed()
            })
        });
    });

    group.finish();
}

fn bench_accounts(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("accounts");

    group.bench_function("tree_insert", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let dir = tempdir().unwrap();
                let tree = TreeStore::new(dir.path().join("bench.tree"));
                tree.create(true).await.unwrap();
                let record = AccountRecord::new("Bench", "User", "$2b$10$hash");

                let start = std::time::Instant::now();

                for i in 0..iters {
                    tree.insert(&format!("user{}", i), &record).await.unwrap();
                }

                start.elapsed()
            })
        });
    });

    group.bench_function("tree_get", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let dir = tempdir().unwrap();
                let tree = TreeStore::new(dir.path().join("bench.tree"));
                tree.create(true).await.unwrap();
                let record = AccountRecord::new("Bench", "User", "$2b$10$hash");

                for i in 0..1000 {
                    tree.insert(&format!("user{}", i), &record).await.unwrap();
                }

                let start = std::time::Instant::now();

                for i in 0..iters {
                    let name = format!("user{}", i % 1000);
                    tree.get(black_box(&name)).await.unwrap();
                }

                start.elapsed()
            })
        });
    });

    group.bench_function("blob_allocate_free", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let dir = tempdir().unwrap();
                let heap = BlobHeap::new(dir.path().join("bench.heap"), 128);
                heap.create(true).await.unwrap();

                let start = std::time::Instant::now();

                for i in 0..iters {
                    let handle = heap.allocate(black_box(256 + (i % 7) * 100)).await.unwrap();
                    heap.deallocate(handle).await.unwrap();
                }

                start.elapsed()
            })
        });
    });

    group.bench_function("blob_write_read_4k", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let dir = tempdir().unwrap();
                let heap = BlobHeap::new(dir.path().join("bench.heap"), 128);
                heap.create(true).await.unwrap();
                let picture = create_test_payload(4096);
                let handle = heap.allocate(picture.len() as u64).await.unwrap();

                let start = std::time::Instant::now();

                for _ in 0..iters {
                    heap.write_to_entry(handle, &picture).await.unwrap();
                    let _ = heap.get_data(black_box(handle)).await.unwrap();
                }

                start.elapsed()
            })
        });
    });

    group.finish();
}

criterion_group!(benches, bench_event_log, bench_accounts);
criterion_main!(benches);
