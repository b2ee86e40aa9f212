use criterion::{criterion_group, criterion_main, Criterion};
use flywheel_engine::flywheel::state::{record_failure, record_success};
use flywheel_engine::model::FlywheelState;
use std::hint::black_box;

fn bench_record_success(c: &mut Criterion) {
    c.bench_function("record_success", |b| {
        b.iter(|| {
            let mut state = FlywheelState::new("bench-token");
            for i in 1..=10u32 {
                record_success(&mut state, black_box(5), black_box(5), i as i64);
            }
            state
        })
    });
}

fn bench_record_failure_to_breaker(c: &mut Criterion) {
    c.bench_function("record_failure_to_breaker", |b| {
        b.iter(|| {
            let mut state = FlywheelState::new("bench-token");
            for i in 1..=5i64 {
                record_failure(&mut state, black_box(i));
            }
            state
        })
    });
}

criterion_group!(benches, bench_record_success, bench_record_failure_to_breaker);
criterion_main!(benches);
