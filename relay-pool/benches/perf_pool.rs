//! Benchmarks for WorkerPool submit and execution throughput.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use crossbeam_channel::bounded;
use relay_pool::WorkerPool;

// ============================================================================
// Submit latency
// ============================================================================

fn bench_submit(c: &mut Criterion) {
    let mut group = c.benchmark_group("submit");

    group.bench_function("empty_task", |b| {
        let pool = WorkerPool::new(1, 1 << 16);

        b.iter(|| {
            pool.submit(|| {});
        });

        pool.stop_wait();
    });

    group.finish();
}

// ============================================================================
// Execution throughput at several worker counts
// ============================================================================

fn bench_execute(c: &mut Criterion) {
    const TASKS: usize = 1000;

    let mut group = c.benchmark_group("execute");
    group.throughput(Throughput::Elements(TASKS as u64));

    for workers in [1usize, 2, 4, 16] {
        group.bench_with_input(
            BenchmarkId::from_parameter(workers),
            &workers,
            |b, &workers| {
                let pool = WorkerPool::new(workers, TASKS);
                let (done_tx, done_rx) = bounded(TASKS);

                b.iter(|| {
                    for _ in 0..TASKS {
                        let done = done_tx.clone();
                        pool.submit(move || {
                            let _ = done.send(());
                        });
                    }
                    for _ in 0..TASKS {
                        done_rx.recv().unwrap();
                    }
                });

                pool.stop();
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_submit, bench_execute);
criterion_main!(benches);
