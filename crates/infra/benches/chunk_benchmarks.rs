use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use forgebatch_core::{BatchResult, CancellationToken, JobParameters, StepExecution};
use forgebatch_infra::item::{ChunkOrientedHandler, ListItemReader, ListItemWriter};
use forgebatch_infra::repository::{InMemoryJobRepository, JobRepository};
use forgebatch_infra::step::{ChunkStep, Step};
use forgebatch_infra::transaction::InMemoryTransactionManager;
use forgebatch_repeat::{CompositeCompletionPolicy, SimpleCompletionPolicy, TimeoutCompletionPolicy};
use std::sync::Arc;
use std::time::Duration;

const ITEMS: u64 = 10_000;

fn registered_step_execution(repository: &InMemoryJobRepository, run: u64) -> StepExecution {
    let parameters = JobParameters::new().with("run", run as i64);
    let mut job = repository
        .create_job_execution("bench", &parameters)
        .unwrap();
    let mut step = job.create_step_execution("load").clone();
    repository.add_step_execution(&mut step).unwrap();
    step
}

fn chunk_step(
    repository: &Arc<InMemoryJobRepository>,
    commit_interval: usize,
    throttle_limit: usize,
) -> ChunkStep {
    let handler = ChunkOrientedHandler::new(
        ListItemReader::new("numbers", (0..ITEMS).collect()).with_save_state(false),
        |n: u64| -> BatchResult<Option<u64>> { Ok(Some(n.wrapping_mul(31))) },
        ListItemWriter::new(),
    )
    .with_commit_interval(commit_interval);
    ChunkStep::new(
        "load",
        handler,
        repository.clone(),
        InMemoryTransactionManager::arc(),
    )
    .with_throttle_limit(throttle_limit)
}

/// Items per second through a sequential chunk step, by commit interval.
fn bench_chunk_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_step_throughput");
    group.throughput(Throughput::Elements(ITEMS));
    group.sample_size(20);

    for commit_interval in [1usize, 10, 100, 1000].iter() {
        group.bench_with_input(
            BenchmarkId::new("commit_interval", commit_interval),
            commit_interval,
            |b, &interval| {
                let repository = InMemoryJobRepository::arc();
                let mut run = 0;
                b.iter(|| {
                    run += 1;
                    let step = chunk_step(&repository, interval, 1);
                    let mut execution = registered_step_execution(&repository, run);
                    step.execute(&mut execution, None, &CancellationToken::new())
                        .unwrap();
                    black_box(execution.write_count());
                });
            },
        );
    }

    group.finish();
}

/// Same workload fanned out over worker threads.
fn bench_concurrent_chunks(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_step_concurrency");
    group.throughput(Throughput::Elements(ITEMS));
    group.sample_size(20);

    for throttle_limit in [1usize, 2, 4].iter() {
        group.bench_with_input(
            BenchmarkId::new("throttle_limit", throttle_limit),
            throttle_limit,
            |b, &limit| {
                let repository = InMemoryJobRepository::arc();
                let mut run = 0;
                b.iter(|| {
                    run += 1;
                    let step = chunk_step(&repository, 100, limit);
                    let mut execution = registered_step_execution(&repository, run);
                    step.execute(&mut execution, None, &CancellationToken::new())
                        .unwrap();
                    black_box(execution.read_count());
                });
            },
        );
    }

    group.finish();
}

/// Cost of the completion-policy checks alone.
fn bench_completion_policies(c: &mut Criterion) {
    use forgebatch_repeat::CompletionPolicy;

    let mut group = c.benchmark_group("completion_policy");

    group.bench_function("simple_100", |b| {
        let policy = SimpleCompletionPolicy::new(100);
        b.iter(|| {
            let context = policy.start(None);
            while !policy.is_complete(&context) {
                policy.update(&context);
            }
            black_box(context.started_count());
        });
    });

    group.bench_function("composite_size_or_timeout_100", |b| {
        let policy = CompositeCompletionPolicy::new()
            .with_policy(SimpleCompletionPolicy::new(100))
            .with_policy(TimeoutCompletionPolicy::new(Duration::from_secs(60)));
        b.iter(|| {
            let context = policy.start(None);
            while !policy.is_complete(&context) {
                policy.update(&context);
            }
            black_box(context.close().is_ok());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_chunk_throughput,
    bench_concurrent_chunks,
    bench_completion_policies
);
criterion_main!(benches);
