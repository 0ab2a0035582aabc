//! Rewind-and-replay behaviour of the predictor against authoritative snapshots.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use rewind_sync::telemetry::{CollectingObserver, ViolationKind};
use rewind_sync::{InputWindow, PlayerId, PredictionConfig, StateSnapshot, Tick};

use crate::common::init_tracing;
use crate::common::stubs::{predictor_with_stubs, scripted_input, LOCAL};

const POSITION: usize = 0;
const STAMINA: usize = 1;

fn config() -> PredictionConfig {
    PredictionConfig {
        history_capacity: 64,
        simulation_buffer: 4,
        ..PredictionConfig::default()
    }
}

fn stamina_bits(state: &StateSnapshot) -> u32 {
    state.player(LOCAL).unwrap().stamina.to_bits()
}

#[test]
fn snapshot_five_ticks_back_replays_only_the_diverging_updater() {
    init_tracing();
    let (mut predictor, handles) = predictor_with_stubs(config());
    for t in 1..=100 {
        predictor.step_tick(scripted_input(t));
    }
    assert_eq!(predictor.local_tick(), Tick::new(101));

    let before: Vec<StateSnapshot> = (95..=100)
        .map(|t| predictor.history().state(Tick::new(t)).unwrap().clone())
        .collect();
    let position_steps = handles.position_steps.load(Ordering::SeqCst);
    let stamina_steps = handles.stamina_steps.load(Ordering::SeqCst);
    let advances = handles.simulation.count();

    let mut snapshot = before[0].clone();
    snapshot.player_mut(LOCAL).unwrap().position.x += 1.0;

    let report = predictor.reconcile(&snapshot).unwrap();
    assert_eq!(report.snapshot_tick, Tick::new(95));
    assert_eq!(report.corrected.as_slice(), &[POSITION]);
    assert_eq!(report.replayed_ticks, 5);

    assert_eq!(handles.position_steps.load(Ordering::SeqCst), position_steps + 5);
    assert_eq!(handles.stamina_steps.load(Ordering::SeqCst), stamina_steps);
    assert_eq!(handles.simulation.count(), advances + 5);
    assert_eq!(predictor.local_tick(), Tick::new(101));

    for (offset, old) in before.iter().enumerate() {
        let tick = Tick::new(95 + offset as u32);
        let new = predictor.history().state(tick).unwrap();
        let old_pos = old.player(LOCAL).unwrap().position;
        let new_pos = new.player(LOCAL).unwrap().position;
        assert!((new_pos.x - old_pos.x - 1.0).abs() < 1e-3, "tick {tick}");
        assert!((new_pos.y - old_pos.y).abs() < 1e-3, "tick {tick}");
        assert_eq!(stamina_bits(new), stamina_bits(old), "tick {tick}");
        assert_eq!(new.player(PlayerId::new(2)), old.player(PlayerId::new(2)));
    }
    assert_ne!(predictor.history().state(Tick::new(100)).unwrap(), &before[5]);
}

#[test]
fn stamina_divergence_leaves_position_history_identical() {
    let (mut predictor, handles) = predictor_with_stubs(config());
    for t in 1..=30 {
        predictor.step_tick(scripted_input(t));
    }
    let positions_before: Vec<_> = (20..=30)
        .map(|t| {
            let p = predictor.history().state(Tick::new(t)).unwrap().player(LOCAL).unwrap();
            (p.position.x.to_bits(), p.position.y.to_bits(), p.velocity.x.to_bits())
        })
        .collect();

    let mut snapshot = predictor.history().state(Tick::new(20)).unwrap().clone();
    snapshot.player_mut(LOCAL).unwrap().stamina = 0.0;
    let position_steps = handles.position_steps.load(Ordering::SeqCst);

    let report = predictor.reconcile(&snapshot).unwrap();
    assert_eq!(report.corrected.as_slice(), &[STAMINA]);
    assert_eq!(report.replayed_ticks, 10);
    assert_eq!(handles.position_steps.load(Ordering::SeqCst), position_steps);

    let positions_after: Vec<_> = (20..=30)
        .map(|t| {
            let p = predictor.history().state(Tick::new(t)).unwrap().player(LOCAL).unwrap();
            (p.position.x.to_bits(), p.position.y.to_bits(), p.velocity.x.to_bits())
        })
        .collect();
    assert_eq!(positions_before, positions_after);
    assert_eq!(
        predictor.history().state(Tick::new(20)).unwrap().player(LOCAL).unwrap().stamina,
        0.0
    );
}

#[test]
fn replaying_the_same_snapshot_is_deterministic() {
    let (mut a, _) = predictor_with_stubs(config());
    let (mut b, _) = predictor_with_stubs(config());
    for t in 1..=40 {
        a.step_tick(scripted_input(t));
        b.step_tick(scripted_input(t));
    }
    let mut snapshot = a.history().state(Tick::new(36)).unwrap().clone();
    snapshot.player_mut(LOCAL).unwrap().position.y -= 2.0;
    snapshot.player_mut(LOCAL).unwrap().stamina = 1.0;

    let report_a = a.reconcile(&snapshot).unwrap();
    let report_b = b.reconcile(&snapshot).unwrap();
    assert_eq!(report_a, report_b);
    assert_eq!(report_a.corrected.as_slice(), &[POSITION, STAMINA]);
    for t in 36..=40 {
        let tick = Tick::new(t);
        assert_eq!(a.checksum_at(tick), b.checksum_at(tick), "tick {t}");
    }

    // Already corrected: the second pass finds nothing to do.
    let again = a.reconcile(&snapshot).unwrap();
    assert!(!again.corrected_any());
}

#[test]
fn correction_through_the_inbox_on_fixed_step() {
    let observer = Arc::new(CollectingObserver::new());
    let (mut predictor, _) = predictor_with_stubs(config());
    predictor.set_violation_observer(Some(observer.clone()));
    let inbox = predictor.inbox();

    for t in 1..=10 {
        predictor.on_fixed_step(Some(scripted_input(t)));
    }
    let mut snapshot = predictor.history().state(Tick::new(8)).unwrap().clone();
    snapshot.player_mut(LOCAL).unwrap().position.x += 0.5;
    // An older snapshot arriving later is discarded by the inbox.
    let older = predictor.history().state(Tick::new(7)).unwrap().clone();
    inbox.offer(snapshot);
    inbox.offer(older);

    let outcome = predictor.on_fixed_step(Some(scripted_input(11)));
    let report = outcome.reconcile.unwrap();
    assert_eq!(report.snapshot_tick, Tick::new(8));
    assert_eq!(report.replayed_ticks, 3);
    assert!(outcome.catch_up.is_none());
    assert!(observer.is_empty());
    assert_eq!(predictor.remote_tick(), Some(Tick::new(8)));
}

#[test]
fn input_window_starts_at_remote_tick_once_known() {
    let config = PredictionConfig {
        input_window: InputWindow::SinceRemoteTick,
        ..config()
    };
    let (mut predictor, _) = predictor_with_stubs(config);
    for t in 1..=12 {
        predictor.step_tick(scripted_input(t));
    }
    assert_eq!(predictor.build_input_message().start_tick, Tick::ZERO);

    let snapshot = predictor.history().state(Tick::new(9)).unwrap().clone();
    predictor.reconcile(&snapshot);
    let message = predictor.build_input_message();
    assert_eq!(message.start_tick, Tick::new(9));
    assert_eq!(message.frames.len(), 4);
    assert_eq!(message.frames[0], scripted_input(9).at_tick(Tick::new(9)));
}

#[test]
fn lockstep_snapshot_after_clamp_is_still_corrected() {
    let observer = Arc::new(CollectingObserver::new());
    let (mut predictor, handles) = predictor_with_stubs(config());
    predictor.set_violation_observer(Some(observer.clone()));
    for t in 1..=20 {
        predictor.step_tick(scripted_input(t));
    }
    let moved = predictor.catch_up(Tick::new(10));
    assert!(matches!(moved, Some(rewind_sync::CatchUp::Clamp { .. })));
    let newest = predictor.history().newest();
    assert_eq!(newest, Tick::new(9));

    // The server now reports exactly the tick the client last predicted.
    let mut snapshot = predictor.history().state(newest).unwrap().clone();
    snapshot.player_mut(LOCAL).unwrap().position.x += 2.0;
    let position_steps = handles.position_steps.load(Ordering::SeqCst);
    let advances = handles.simulation.count();

    let report = predictor.reconcile(&snapshot).unwrap();
    assert_eq!(report.snapshot_tick, newest);
    assert_eq!(report.corrected.as_slice(), &[POSITION]);
    assert_eq!(report.replayed_ticks, 0);
    assert_eq!(handles.position_steps.load(Ordering::SeqCst), position_steps);
    assert_eq!(handles.simulation.count(), advances);
    assert_eq!(
        predictor.latest_state().unwrap().player(LOCAL).unwrap().position,
        snapshot.player(LOCAL).unwrap().position
    );
    assert!(observer.is_empty());
}

#[test]
fn snapshot_outside_history_is_dropped_but_tracked() {
    let observer = Arc::new(CollectingObserver::new());
    let (mut predictor, handles) = predictor_with_stubs(config());
    predictor.set_violation_observer(Some(observer.clone()));
    for t in 1..=80 {
        predictor.step_tick(scripted_input(t));
    }
    let advances = handles.simulation.count();
    let stale = StateSnapshot::new(Tick::new(10), LOCAL, Vec::new());
    assert!(predictor.reconcile(&stale).is_none());
    assert_eq!(handles.simulation.count(), advances);
    assert_eq!(predictor.remote_tick(), Some(Tick::new(10)));
    let reported = observer.violations_of_kind(ViolationKind::Reconciliation);
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].tick, Some(Tick::new(10)));
}

#[test]
fn reconciliation_across_the_tick_wrap() {
    let (mut predictor, _) = predictor_with_stubs(config());
    // Tick 1 is "ahead" of u32::MAX - 10 under serial arithmetic, so this clamps.
    let moved = predictor.catch_up(Tick::new(u32::MAX - 10));
    assert!(matches!(moved, Some(rewind_sync::CatchUp::Clamp { .. })));
    assert_eq!(predictor.local_tick(), Tick::new(u32::MAX - 10));
    for t in 0..20 {
        predictor.step_tick(scripted_input(t));
    }
    assert!(predictor.local_tick().is_after(Tick::new(u32::MAX)));

    let target = Tick::new(u32::MAX - 1);
    let mut snapshot = predictor.history().state(target).unwrap().clone();
    snapshot.player_mut(LOCAL).unwrap().position.x -= 3.0;
    let report = predictor.reconcile(&snapshot).unwrap();
    assert_eq!(report.corrected.as_slice(), &[POSITION]);
    assert_eq!(
        report.replayed_ticks as i32,
        predictor.history().newest().ticks_since(target)
    );
}
