//! Cache mutation benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use vigil_bench::{confirmed, filled_cache, shuffled_history, CONVERSATION};
use vigil_protocol::ConversationId;
use vigil_sync::{ApplyMode, CacheConfig, CacheStore, EventBus};

/// Benchmark inserting a shuffled history into an empty window.
fn bench_insert_history(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_history");
    let id = ConversationId::from(CONVERSATION);

    for count in [50, 200, 500].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let history = shuffled_history(count);
            b.iter(|| {
                let cache = CacheStore::new(CacheConfig::default(), EventBus::new(16));
                for message in &history {
                    cache.apply_message(&id, message.clone(), ApplyMode::Insert);
                }
                black_box(cache.stats());
            });
        });
    }

    group.finish();
}

/// Benchmark a duplicate delivery against windows of varying size.
fn bench_duplicate_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("duplicate_insert");
    let id = ConversationId::from(CONVERSATION);

    for window in [50, 200, 500].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(window), window, |b, &window| {
            let cache = filled_cache(window);
            let duplicate = confirmed(window / 2, (window / 2) as i64 * 1_000);
            b.iter(|| {
                let message = black_box(duplicate.clone());
                black_box(cache.apply_message(&id, message, ApplyMode::Insert));
            });
        });
    }

    group.finish();
}

/// Benchmark appending to a full window, which trims the oldest message.
fn bench_append_with_trim(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_with_trim");
    let id = ConversationId::from(CONVERSATION);

    for window in [50, 500].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(window), window, |b, &window| {
            let cache = filled_cache(window);
            let mut next = window;
            b.iter(|| {
                let message = confirmed(next, next as i64 * 1_000);
                next += 1;
                black_box(cache.apply_message(&id, message, ApplyMode::Insert));
            });
        });
    }

    group.finish();
}

/// Benchmark eviction across many conversations.
fn bench_eviction(c: &mut Criterion) {
    let mut group = c.benchmark_group("eviction");
    group.sample_size(20);

    group.bench_function("200_conversations", |b| {
        b.iter(|| {
            let cache = Arc::new(CacheStore::new(
                CacheConfig::new(50, 20, 1_000),
                EventBus::new(16),
            ));
            for conv in 0..200 {
                let id = ConversationId::from(format!("c-{conv}"));
                for n in 0..10 {
                    let mut message = confirmed(n, n as i64);
                    message.conversation_id = id.clone();
                    cache.apply_message(&id, message, ApplyMode::Insert);
                }
            }
            black_box(cache.stats());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_insert_history,
    bench_duplicate_insert,
    bench_append_with_trim,
    bench_eviction,
);
criterion_main!(benches);
