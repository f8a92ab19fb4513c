//! Engine Benchmarks for virtbench
//!
//! Measures the per-outcome cost of the parts that run once per target,
//! independent of any cluster:
//!
//! 1. **Aggregation**: `summarize`, batch folding and summary merging
//! 2. **Interleaving**: reordering a batch across node groups
//! 3. **Dispatch**: bounded-concurrency `run_all` with trivial work

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use virtbench::aggregate::{fold, summarize, FailureReason, Outcome, RunSummary};
use virtbench::dispatcher::{interleave, never_stop, Dispatcher};
use virtbench::target::Target;
use virtbench::telemetry::NullObserver;

fn outcomes(count: usize) -> Vec<Outcome> {
    (0..count)
        .map(|i| {
            let target = Target::vm("rhel-9-vm", format!("bench-{}", i));
            match i % 10 {
                0 => Outcome::failed(target, FailureReason::Timeout, "no Running"),
                1 => Outcome::not_dispatched(target, FailureReason::Skipped),
                _ => Outcome::succeeded(target)
                    .with_duration("running", 30.0 + (i % 17) as f64)
                    .with_duration("clone", 5.0 + (i % 7) as f64),
            }
        })
        .collect()
}

fn bench_aggregation(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregation");

    for size in [100usize, 1_000, 10_000] {
        let batch = outcomes(size);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("summarize", size), &batch, |b, batch| {
            b.iter(|| summarize(black_box(batch)))
        });

        group.bench_with_input(BenchmarkId::new("fold_in_batches", size), &batch, |b, batch| {
            b.iter(|| {
                batch
                    .chunks(50)
                    .fold(RunSummary::new(), |acc, chunk| fold(acc, black_box(chunk)))
            })
        });

        let halves: Vec<RunSummary> = batch.chunks(size / 2).map(summarize).collect();
        group.bench_with_input(BenchmarkId::new("merge", size), &halves, |b, halves| {
            b.iter(|| {
                let mut merged = halves[0].clone();
                merged.merge(black_box(&halves[1]));
                merged
            })
        });
    }

    group.finish();
}

fn bench_interleave(c: &mut Criterion) {
    let mut group = c.benchmark_group("interleave");

    for groups in [1usize, 4, 16] {
        let targets: Vec<Target> = (0..1_000)
            .map(|i| Target::vm("rhel-9-vm", format!("bench-{}", i)))
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(groups), &targets, |b, targets| {
            b.iter(|| interleave(black_box(targets.clone()), groups))
        });
    }

    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(1_000));

    for concurrency in [1usize, 10, 100] {
        group.bench_function(BenchmarkId::from_parameter(concurrency), |b| {
            b.to_async(&rt).iter(|| async move {
                let dispatcher = Dispatcher::new(concurrency, Arc::new(NullObserver), CancellationToken::new());
                let targets: Vec<Target> = (0..1_000)
                    .map(|i| Target::vm("rhel-9-vm", format!("bench-{}", i)))
                    .collect();
                let outcomes = dispatcher
                    .run_all(
                        targets,
                        |target: Target| async move { Outcome::succeeded(target).with_duration("running", 1.0) },
                        never_stop,
                    )
                    .await;
                black_box(outcomes)
            })
        });
    }

    group.finish();
}

criterion_group!(aggregation, bench_aggregation);
criterion_group!(ordering, bench_interleave);
criterion_group!(dispatch, bench_dispatch);

criterion_main!(aggregation, ordering, dispatch);
