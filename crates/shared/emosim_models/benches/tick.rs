//! Criterion benchmarks for the simulation tick with the reference models.
//!
//! Run with:
//!   cargo bench -p emosim_models
//!
//! Results are saved to target/criterion/

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use emosim::config::SimConfig;
use emosim::storage::MemoryStore;
use emosim_models::{assemble, Assembled};

fn make_sim(base_state_dim: usize, emotion_dim: usize) -> emosim::simulation::Simulation {
    let cfg = SimConfig {
        base_state_dim,
        emotion_dim,
        ..SimConfig::default()
    };
    let Assembled { mut simulation, .. } =
        assemble(cfg, Box::new(MemoryStore::new()), 42).expect("assemble");
    simulation.start().expect("start");
    simulation
}

/// Benchmark tick() with varying state widths.
fn bench_tick_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("tick_size");

    for dim in [12usize, 48, 192].iter() {
        group.throughput(Throughput::Elements(*dim as u64));
        group.bench_with_input(BenchmarkId::new("reference", dim), dim, |b, &dim| {
            let mut sim = make_sim(dim, 10);
            b.iter(|| black_box(sim.tick()));
        });
    }

    group.finish();
}

/// Benchmark the save/load round trip at the default dimensions.
fn bench_snapshot(c: &mut Criterion) {
    let mut sim = make_sim(12, 10);
    for _ in 0..32 {
        sim.tick();
    }
    c.bench_function("save", |b| b.iter(|| black_box(sim.save().expect("save"))));
    c.bench_function("load", |b| b.iter(|| black_box(sim.load().expect("load"))));
}

criterion_group!(benches, bench_tick_sizes, bench_snapshot);
criterion_main!(benches);
