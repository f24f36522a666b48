use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lookup_engine::models::{BatchId, Job, JobKind, Priority};
use lookup_engine::orchestration::{JobQueue, RetryPolicy};

fn jobs(count: usize) -> Vec<Job> {
    let batch_id = BatchId::new();
    let priorities = [Priority::Low, Priority::Normal, Priority::High, Priority::Critical];
    (0..count)
        .map(|i| {
            Job::new(
                batch_id,
                i,
                format!("apn-{i}"),
                JobKind::BasicSearch,
                priorities[i % priorities.len()],
            )
        })
        .collect()
}

fn benchmark_enqueue_dequeue(c: &mut Criterion) {
    c.bench_function("queue_enqueue_dequeue_1000", |b| {
        b.iter_batched(
            || jobs(1_000),
            |jobs| {
                let queue = JobQueue::new();
                queue.enqueue_all(jobs).unwrap();
                while let Some(job) = queue.try_dequeue() {
                    black_box(job);
                }
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

fn benchmark_remove_batch(c: &mut Criterion) {
    c.bench_function("queue_remove_batch_1000", |b| {
        b.iter_batched(
            || {
                let queue = JobQueue::new();
                let jobs = jobs(1_000);
                let batch_id = jobs[0].batch_id;
                queue.enqueue_all(jobs).unwrap();
                (queue, batch_id)
            },
            |(queue, batch_id)| black_box(queue.remove_batch(batch_id)),
            criterion::BatchSize::SmallInput,
        )
    });
}

fn benchmark_backoff(c: &mut Criterion) {
    let policy = RetryPolicy::default();
    c.bench_function("retry_delay_for_attempt", |b| {
        b.iter(|| policy.delay_for_attempt(black_box(3)))
    });
}

criterion_group!(
    benches,
    benchmark_enqueue_dequeue,
    benchmark_remove_batch,
    benchmark_backoff
);
criterion_main!(benches);
