use criterion::{criterion_group, criterion_main, Criterion};
use flywheel_engine::claims::split;
use std::hint::black_box;

fn bench_split_non_platform_token(c: &mut Criterion) {
    c.bench_function("split_non_platform_token", |b| {
        b.iter(|| split(black_box(2.5), black_box(0.1), black_box(10.0), black_box(false)))
    });
}

fn bench_split_platform_token_exemption(c: &mut Criterion) {
    c.bench_function("split_platform_token_exemption", |b| {
        b.iter(|| split(black_box(2.5), black_box(0.1), black_box(10.0), black_box(true)))
    });
}

criterion_group!(benches, bench_split_non_platform_token, bench_split_platform_token_exemption);
criterion_main!(benches);
