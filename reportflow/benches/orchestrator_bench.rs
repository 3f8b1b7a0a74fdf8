//! Benchmarks for run orchestration.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use reportflow::contracts::normalize_report;
use reportflow::core::TriggerEvent;
use reportflow::events::NoOpEventSink;
use reportflow::pipeline::{ChainBuilder, ChainRegistry, Orchestrator};
use reportflow::testing::ScriptedStage;
use reportflow::utils::fingerprint;

fn orchestrator() -> Orchestrator {
    let chains = ChainRegistry::new();
    let mut chain = ChainBuilder::new("bench");
    for name in ["intake", "analysis", "report"] {
        chain = chain.stage(Arc::new(ScriptedStage::new(name))).unwrap();
    }
    chains.register(chain.build().unwrap()).unwrap();
    Orchestrator::builder(Arc::new(chains))
        .with_events(Arc::new(NoOpEventSink))
        .build()
        .unwrap()
}

fn run_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let orchestrator = orchestrator();
    let counter = AtomicU64::new(0);

    c.bench_function("three_stage_run", |b| {
        b.iter(|| {
            let id = format!("run-{}", counter.fetch_add(1, Ordering::Relaxed));
            let trigger = TriggerEvent::new(id, "bench", serde_json::json!({"problem": "glare"}));
            black_box(runtime.block_on(orchestrator.trigger(trigger)).unwrap())
        })
    });
}

fn helpers_benchmark(c: &mut Criterion) {
    let input = serde_json::json!({
        "input": {"problem": "reduce heat loss through a glazed facade"},
        "previous": {
            "intake": {"summary": "north facade, single glazing"},
            "analysis": {"options": ["secondary glazing", "film", "replacement"]}
        }
    });
    c.bench_function("fingerprint", |b| b.iter(|| fingerprint(black_box(&input))));

    let artifact = serde_json::json!({
        "quick_reference": {"title": "Glazing retrofit options", "one_liner": "Add secondary glazing."},
        "prose_report": "Secondary glazing halves the loss."
    });
    c.bench_function("normalize_report", |b| {
        b.iter(|| normalize_report(black_box(&artifact)))
    });
}

criterion_group!(benches, run_benchmark, helpers_benchmark);
criterion_main!(benches);
