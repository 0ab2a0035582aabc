//! Benchmarks for prediction and reconciliation
//!
//! Run with: cargo bench --bench reconcile

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use rewind_sync::{
    InputFrame, NoopSimulation, PlayerId, PlayerState, PredictionConfig, Predictor,
    StateSnapshot, StateUpdater, Tick, Vec2, WireMessage,
};
use std::hint::black_box;

const LOCAL: PlayerId = PlayerId::new(0);
const PLAYERS: u32 = 8;

struct Walk;

impl StateUpdater for Walk {
    fn step(&mut self, previous: &StateSnapshot, next: &mut StateSnapshot, input: &InputFrame, delta: f32) {
        if let (Some(before), Some(after)) = (previous.player(LOCAL), next.player_mut(LOCAL)) {
            after.velocity = input.movement.scaled(5.0);
            after.position = before.position + after.velocity.scaled(delta);
        }
    }

    fn needs_correction(&self, local: &StateSnapshot, remote: &StateSnapshot) -> bool {
        match (local.player(LOCAL), remote.player(LOCAL)) {
            (Some(l), Some(r)) => l.position.distance(r.position) > 0.01,
            _ => false,
        }
    }

    fn update_from_authoritative(&mut self, state: &mut StateSnapshot, authoritative: &StateSnapshot) {
        if let (Some(target), Some(source)) = (state.player_mut(LOCAL), authoritative.player(LOCAL)) {
            *target = *source;
        }
    }
}

struct Drain;

impl StateUpdater for Drain {
    fn step(&mut self, previous: &StateSnapshot, next: &mut StateSnapshot, input: &InputFrame, delta: f32) {
        if let (Some(before), Some(after)) = (previous.player(LOCAL), next.player_mut(LOCAL)) {
            let change = if input.sprinting { -4.0 } else { 1.0 };
            after.stamina = (before.stamina + change * delta).clamp(0.0, 10.0);
        }
    }

    fn needs_correction(&self, local: &StateSnapshot, remote: &StateSnapshot) -> bool {
        match (local.player(LOCAL), remote.player(LOCAL)) {
            (Some(l), Some(r)) => (l.stamina - r.stamina).abs() > 0.5,
            _ => false,
        }
    }

    fn update_from_authoritative(&mut self, state: &mut StateSnapshot, authoritative: &StateSnapshot) {
        if let (Some(target), Some(source)) = (state.player_mut(LOCAL), authoritative.player(LOCAL)) {
            target.stamina = source.stamina;
        }
    }
}

fn roster() -> Vec<PlayerState> {
    (0..PLAYERS)
        .map(|id| PlayerState::at(PlayerId::new(id), Vec2::new(id as f32, 0.0), 10.0))
        .collect()
}

fn input(tick: u32) -> InputFrame {
    let angle = tick as f32 * 0.05;
    InputFrame::new(Vec2::new(angle.cos(), angle.sin()), tick % 4 == 0)
}

/// A predictor that has already predicted `ticks` ticks.
fn warmed_predictor(ticks: u32) -> Predictor {
    let config = PredictionConfig {
        history_capacity: 64,
        ..PredictionConfig::default()
    };
    let initial = StateSnapshot::new(Tick::ZERO, LOCAL, roster());
    let mut predictor =
        Predictor::new(LOCAL, config, initial, Box::new(NoopSimulation)).expect("valid config");
    predictor.add_updater(Box::new(Walk));
    predictor.add_updater(Box::new(Drain));
    for t in 1..=ticks {
        predictor.step_tick(input(t));
    }
    predictor
}

fn bench_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("Predictor");

    group.bench_function("step_tick", |b| {
        let mut predictor = warmed_predictor(64);
        let mut t = 65;
        b.iter(|| {
            t += 1;
            black_box(predictor.step_tick(input(t)))
        });
    });

    group.bench_function("build_input_message", |b| {
        let predictor = warmed_predictor(64);
        b.iter(|| black_box(predictor.build_input_message()));
    });

    group.finish();
}

fn bench_reconcile(c: &mut Criterion) {
    let mut group = c.benchmark_group("Reconcile");

    for back in [1u32, 5, 20, 60] {
        group.bench_with_input(BenchmarkId::new("diverged", back), &back, |b, &back| {
            b.iter_batched(
                || {
                    let predictor = warmed_predictor(100);
                    let tick = Tick::new(100 - back);
                    let mut snapshot = predictor
                        .history()
                        .state(tick)
                        .expect("tick retained")
                        .clone();
                    if let Some(me) = snapshot.player_mut(LOCAL) {
                        me.position.x += 1.0;
                    }
                    (predictor, snapshot)
                },
                |(mut predictor, snapshot)| black_box(predictor.reconcile(&snapshot)),
                BatchSize::SmallInput,
            );
        });
    }

    group.bench_function("matching", |b| {
        let mut predictor = warmed_predictor(100);
        let snapshot = predictor
            .history()
            .state(Tick::new(95))
            .expect("tick retained")
            .clone();
        b.iter(|| black_box(predictor.reconcile(black_box(&snapshot))));
    });

    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("Codec");
    let snapshot = WireMessage::StateSnapshot(StateSnapshot::new(Tick::new(42), LOCAL, roster()));
    let encoded = snapshot.encode().expect("encodable");

    group.bench_function("encode_snapshot", |b| {
        let mut buffer = Vec::with_capacity(encoded.len());
        b.iter(|| {
            buffer.clear();
            black_box(snapshot.encode_append(&mut buffer))
        });
    });

    group.bench_function("decode_snapshot", |b| {
        b.iter(|| black_box(rewind_sync::network::codec::decode(black_box(&encoded))));
    });

    group.finish();
}

criterion_group!(benches, bench_step, bench_reconcile, bench_codec);
criterion_main!(benches);
