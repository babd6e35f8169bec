use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

use llm_token_ops::{Detector, EventBus, ModelPricing, PatternRegistry, SourceKind};

fn bench_cost_calculation(c: &mut Criterion) {
    let pricing = ModelPricing::new(dec!(0.003), dec!(0.015));
    c.bench_function("model_pricing_cost", |b| {
        b.iter(|| pricing.cost(black_box(12_345), black_box(6_789)))
    });
}

fn bench_line_pipeline(c: &mut Criterion) {
    let registry = Arc::new(PatternRegistry::with_defaults().unwrap());
    let detector = Detector::new(
        registry,
        EventBus::new(16),
        Duration::from_millis(0),
        1000,
    );

    let hit = "anthropic usage: tokens: 1500 input: 1000 output: 500 model: claude-3-5-sonnet";
    let miss = "plain log line without any usage information at all";

    let mut group = c.benchmark_group("detector_process_line");
    let mut n = 0u64;
    group.bench_function("matching_line", |b| {
        b.iter(|| {
            n += 1;
            // Distinct source ids keep debounce out of the measurement.
            detector.process_line(SourceKind::File, &format!("bench-{}", n), black_box(hit))
        })
    });
    group.bench_function("non_matching_line", |b| {
        b.iter(|| detector.process_line(SourceKind::File, "bench-miss", black_box(miss)))
    });
    group.finish();
}

criterion_group!(benches, bench_cost_calculation, bench_line_pipeline);
criterion_main!(benches);
