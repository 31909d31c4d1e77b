// Criterion benchmarks for amrpc-common topic matching and envelopes
//
// Run benchmarks with:
//   cargo bench -p amrpc-common
//
// For detailed output with plots:
//   cargo bench -p amrpc-common -- --save-baseline main

use amrpc_common::transport::JsonCodec;
use amrpc_common::{Envelope, Naming, TopicPattern};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

fn bench_pattern_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("pattern_compile");

    group.bench_function("literal", |b| {
        b.iter(|| TopicPattern::compile(black_box("am.math.divide")))
    });

    group.bench_function("wildcard", |b| {
        b.iter(|| TopicPattern::compile(black_box("am.*.get.*")))
    });

    group.finish();
}

fn bench_pattern_match(c: &mut Criterion) {
    let mut group = c.benchmark_group("pattern_match");

    let literal = TopicPattern::compile("am.math.divide").unwrap();
    let wildcard = TopicPattern::compile("am.*.get").unwrap();

    group.bench_function("literal_hit", |b| {
        b.iter(|| literal.matches(black_box("am.math.divide")))
    });

    group.bench_function("wildcard_hit", |b| {
        b.iter(|| wildcard.matches(black_box("am.users.get")))
    });

    group.bench_function("wildcard_miss", |b| {
        b.iter(|| wildcard.matches(black_box("am.users.orders.get")))
    });

    group.finish();
}

fn bench_first_match_scan(c: &mut Criterion) {
    let naming = Naming::new("am", "svc");
    let patterns: Vec<TopicPattern> = (0..64)
        .map(|i| TopicPattern::compile(&naming.routing_key(&format!("method_{}", i))).unwrap())
        .collect();

    c.bench_function("first_match_of_64", |b| {
        b.iter(|| {
            patterns
                .iter()
                .position(|p| p.matches(black_box("am.svc.method_63")))
        })
    });
}

fn bench_envelope(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope");
    let envelope = Envelope::new()
        .arg(10)
        .arg(json!({"nested": [1, 2, 3]}))
        .kwarg("precision", 2);
    let encoded = envelope.encode(&JsonCodec).unwrap();

    group.bench_function("encode", |b| {
        b.iter(|| black_box(&envelope).encode(&JsonCodec))
    });

    group.bench_function("decode", |b| {
        b.iter(|| Envelope::decode(&JsonCodec, black_box(&encoded)))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_pattern_compile,
    bench_pattern_match,
    bench_first_match_scan,
    bench_envelope,
);
criterion_main!(benches);
