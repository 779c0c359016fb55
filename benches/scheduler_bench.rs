// Scheduler Performance Benchmarks
// Batch throughput and chain latency over the node-queue scheduler.

use basalt::scheduler::{NodeQueueScheduler, SchedulePriority, Scheduler, Task, Topology};
use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn bench_independent_batch(c: &mut Criterion) {
    let scheduler = NodeQueueScheduler::new(Topology::fake(1, 4));
    scheduler.begin();

    c.bench_function("schedule_and_wait_256_tasks", |b| {
        b.iter(|| {
            let counter = Arc::new(AtomicU64::new(0));
            let tasks: Vec<_> = (0..256)
                .map(|_| {
                    let counter = counter.clone();
                    Task::new(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    })
                })
                .collect();
            scheduler.schedule_and_wait(tasks);
            assert_eq!(counter.load(Ordering::Relaxed), 256);
        });
    });
    scheduler.finish();
}

fn bench_dependency_chain(c: &mut Criterion) {
    let scheduler = NodeQueueScheduler::new(Topology::fake(1, 2));
    scheduler.begin();

    c.bench_function("chain_of_64", |b| {
        b.iter(|| {
            let counter = Arc::new(AtomicU64::new(0));
            let tasks: Vec<_> = (0..64)
                .map(|_| {
                    let counter = counter.clone();
                    Task::new(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    })
                })
                .collect();
            for pair in tasks.windows(2) {
                pair[0].set_as_predecessor_of(&pair[1]);
            }
            for task in &tasks {
                scheduler.schedule(task.clone(), None, SchedulePriority::Default);
            }
            scheduler.wait_for_tasks(&tasks);
            assert_eq!(counter.load(Ordering::Relaxed), 64);
        });
    });
    scheduler.finish();
}

criterion_group!(benches, bench_independent_batch, bench_dependency_chain);
criterion_main!(benches);
