//! Overhead of the start/stop hot path.

use criterion::{criterion_group, criterion_main, Criterion};
use permon::{CounterBackend, FakeCounters, HwpcChooser, Monitor, RuntimeEnv};
use std::sync::Arc;

fn bench_user_mode_pair(c: &mut Criterion) {
    let env = RuntimeEnv {
        hwpc: HwpcChooser::User,
        ..RuntimeEnv::default()
    };
    let pm = Monitor::builder().env(env).initialize(10);
    pm.start("warmup");
    pm.stop("warmup", 0.0, 1);

    c.bench_function("start_stop_user_mode", |b| {
        b.iter(|| {
            pm.start("bench");
            pm.stop("bench", 100.0, 1);
        })
    });
}

fn bench_hwpc_pair(c: &mut Criterion) {
    let fake = Arc::new(FakeCounters::new(rayon::current_num_threads(), 2));
    let env = RuntimeEnv {
        hwpc: HwpcChooser::Flops,
        ..RuntimeEnv::default()
    };
    let pm = Monitor::builder()
        .env(env)
        .counters(fake as Arc<dyn CounterBackend>)
        .initialize(10);
    pm.start("warmup");
    pm.stop("warmup", 0.0, 1);

    // Includes the fan-out counter read over every pool thread.
    c.bench_function("start_stop_with_counter_fanout", |b| {
        b.iter(|| {
            pm.start("bench");
            pm.stop("bench", 0.0, 1);
        })
    });
}

criterion_group!(benches, bench_user_mode_pair, bench_hwpc_pair);
criterion_main!(benches);
