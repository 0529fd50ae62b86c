use criterion::{criterion_group, criterion_main, Criterion};
use sedasim::prelude::*;
use std::hint::black_box;

fn reference_pk() -> PkParams {
    derive_parameters(&Patient::reference()).unwrap().pk
}

fn induction_hour(c: &mut Criterion) {
    let pk = reference_pk();
    c.bench_function("rk4_induction_hour", |b| {
        b.iter(|| {
            let mut state = CompartmentState::with_bolus(140.0);
            for _ in 0..6_000 {
                state = step_rk4(&pk, &state, 200.0 / 60.0, DT_LIVE_MIN);
            }
            black_box(state)
        })
    });

    c.bench_function("euler_induction_hour", |b| {
        b.iter(|| {
            let mut state = CompartmentState::with_bolus(140.0);
            for _ in 0..6_000 {
                state = step_euler(&pk, &state, 200.0 / 60.0, DT_LIVE_MIN);
            }
            black_box(state)
        })
    });
}

fn protocol_scan(c: &mut Criterion) {
    let patient = Patient::reference();
    let settings = ProtocolSettings::new(3.0, 140.0, 20.0);
    c.bench_function("protocol_grid_search", |b| {
        b.iter(|| black_box(optimize_protocol(&patient, &settings).unwrap()))
    });
}

criterion_group!(benches, induction_hour, protocol_scan);
criterion_main!(benches);
