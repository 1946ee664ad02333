//! Benchmarks for the result cache and sequential execution.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use stagecraft::cache::CacheStore;
use stagecraft::config::CacheConfig;
use stagecraft::pipeline::{Engine, ExecuteOptions, ExecutionStrategy};
use stagecraft::stages::{NoOpStage, Stage, StageDescriptor};
use stagecraft::testing::{budget_fixture, engine_config, registry_with};
use std::sync::Arc;
use std::time::Duration;

fn cache_benchmark(c: &mut Criterion) {
    let store = CacheStore::in_memory(&CacheConfig::default());
    let value = vec![7u8; 256];

    c.bench_function("cache_set", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            store.set(
                &format!("key-{}", i % 512),
                value.clone(),
                Duration::ZERO,
                ["bench"],
            );
        });
    });

    store.set("hot", value.clone(), Duration::ZERO, ["bench"]);
    c.bench_function("cache_peek_hit", |b| {
        b.iter(|| black_box(store.peek(black_box("hot"))));
    });
}

fn sequential_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let stages: Vec<Arc<dyn Stage>> = vec![
        Arc::new(NoOpStage::new(StageDescriptor::new("parse"))),
        Arc::new(NoOpStage::new(StageDescriptor::new("plan").with_dependency("parse"))),
        Arc::new(NoOpStage::new(StageDescriptor::new("apply").with_dependency("plan"))),
    ];
    let engine = Engine::new(
        registry_with(stages).unwrap(),
        engine_config(ExecutionStrategy::Sequential),
    )
    .unwrap();

    c.bench_function("sequential_three_stages", |b| {
        b.iter(|| {
            let result = runtime.block_on(engine.execute(
                "fix",
                json!({"path": "src/lib.rs"}),
                ExecuteOptions::new().with_budget(budget_fixture()),
            ));
            black_box(result.success)
        });
    });
}

criterion_group!(benches, cache_benchmark, sequential_benchmark);
criterion_main!(benches);
