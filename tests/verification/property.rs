//! Property-based tests for tick arithmetic, the codecs and the predictor.
//!
//! # Properties Tested
//!
//! ## Ticks and history
//! - `t` and `t + capacity` share a ring slot, across the 32-bit wrap
//! - `ticks_since` recovers any forward distance below 2^31
//! - a history stays contiguous and self-consistent under any mix of push, fast-forward
//!   and rewind
//!
//! ## Wire
//! - decoding arbitrary bytes never panics
//! - input batches and snapshots survive an encode/decode cycle
//! - stream framing is independent of how the bytes were split into reads
//!
//! ## Prediction
//! - after catch-up the local tick is within the simulation buffer of the server tick
//! - two predictors fed the same inputs and snapshot end up bit-identical

use proptest::prelude::*;
use rewind_sync::__internal::TickHistory;
use rewind_sync::network::codec::decode;
use rewind_sync::network::framing::encode_frame;
use rewind_sync::telemetry::InvariantChecker;
use rewind_sync::{
    InputFrame, InputMessage, PlayerId, PlayerState, PredictionConfig, StateSnapshot,
    StreamFramer, Tick, Vec2, WireMessage,
};

use crate::common::stubs::{initial_state, predictor_with_stubs, scripted_input, LOCAL};

// ============================================================================
// Strategies
// ============================================================================

fn capacity_strategy() -> impl Strategy<Value = usize> {
    prop_oneof![Just(2usize), Just(8), Just(64), Just(256)]
}

fn vec2_strategy() -> impl Strategy<Value = Vec2> {
    (-1000.0f32..1000.0, -1000.0f32..1000.0).prop_map(|(x, y)| Vec2::new(x, y))
}

fn input_strategy() -> impl Strategy<Value = InputFrame> {
    (any::<u32>(), vec2_strategy(), any::<bool>())
        .prop_map(|(tick, movement, sprinting)| {
            InputFrame::new(movement, sprinting).at_tick(Tick::new(tick))
        })
}

fn player_strategy() -> impl Strategy<Value = PlayerState> {
    (any::<u32>(), vec2_strategy(), vec2_strategy(), 0.0f32..100.0).prop_map(
        |(id, position, velocity, stamina)| PlayerState {
            id: PlayerId::new(id),
            position,
            velocity,
            stamina,
        },
    )
}

#[derive(Debug, Clone)]
enum HistoryOp {
    Push,
    FastForward(u32),
    Rewind(u32),
}

fn history_op_strategy() -> impl Strategy<Value = HistoryOp> {
    prop_oneof![
        6 => Just(HistoryOp::Push),
        1 => (1u32..300).prop_map(HistoryOp::FastForward),
        1 => (1u32..300).prop_map(HistoryOp::Rewind),
    ]
}

// ============================================================================
// Ticks and history
// ============================================================================

proptest! {
    #[test]
    fn prop_slot_is_shared_one_ring_apart(raw in any::<u32>(), capacity in capacity_strategy()) {
        let tick = Tick::new(raw);
        let lap = tick.wrapping_add(capacity as u32);
        prop_assert_eq!(tick.buffer_index(capacity), lap.buffer_index(capacity));
        prop_assert!(tick.buffer_index(capacity) < capacity);
        prop_assert_ne!(tick.buffer_index(capacity), tick.next().buffer_index(capacity));
    }

    #[test]
    fn prop_forward_distance_survives_the_wrap(raw in any::<u32>(), distance in 0u32..(1 << 31)) {
        let earlier = Tick::new(raw);
        let later = earlier.wrapping_add(distance);
        prop_assert_eq!(later.ticks_since(earlier), distance as i32);
        prop_assert_eq!(later.latest(earlier), later);
        if distance > 0 {
            prop_assert!(later.is_after(earlier));
            prop_assert!(earlier.is_before(later));
        }
    }

    #[test]
    fn prop_history_stays_consistent(
        start in any::<u32>(),
        capacity in capacity_strategy(),
        ops in prop::collection::vec(history_op_strategy(), 1..200),
    ) {
        let mut seed = initial_state();
        seed.tick = Tick::new(start);
        let mut history = TickHistory::new(capacity, seed).unwrap();

        for op in ops {
            let before = history.newest();
            match op {
                HistoryOp::Push => {
                    let tick = history.push(InputFrame::new(Vec2::new(1.0, 0.0), false));
                    prop_assert_eq!(tick, before.next());
                },
                HistoryOp::FastForward(by) => {
                    history.fast_forward(before.wrapping_add(by));
                    prop_assert_eq!(history.newest(), before.wrapping_add(by));
                },
                HistoryOp::Rewind(by) => {
                    history.rewind_to(before.wrapping_sub(by));
                    prop_assert_eq!(history.newest(), before.wrapping_sub(by));
                },
            }

            prop_assert!(history.check_invariants().is_ok(), "{:?}", history.check_invariants());
            prop_assert!(history.len() >= 1 && history.len() <= capacity);
            for tick in history.ticks() {
                prop_assert_eq!(history.state(tick).map(|s| s.tick), Some(tick));
                prop_assert_eq!(history.input(tick).map(|i| i.tick), Some(tick));
            }
            prop_assert!(history.state(history.newest().next()).is_none());
            prop_assert!(history.state(history.oldest().wrapping_sub(1)).is_none());
        }
    }
}

// ============================================================================
// Wire
// ============================================================================

proptest! {
    #[test]
    fn prop_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = decode(&bytes);
    }

    #[test]
    fn prop_decode_with_valid_tag_never_panics(
        tag in 0u8..16,
        body in prop::collection::vec(any::<u8>(), 0..128),
    ) {
        let mut bytes = vec![tag];
        bytes.extend(body);
        let _ = decode(&bytes);
    }

    #[test]
    fn prop_input_batches_and_snapshots_survive_the_codec(
        player in any::<u32>(),
        frames in prop::collection::vec(input_strategy(), 0..20),
        tick in any::<u32>(),
        players in prop::collection::vec(player_strategy(), 0..8),
    ) {
        let start = frames.first().map_or(Tick::ZERO, |f| f.tick);
        let batch = WireMessage::InputMessage(InputMessage::new(PlayerId::new(player), start, frames));
        prop_assert_eq!(decode(&batch.encode().unwrap()), Some(batch));

        let snapshot = WireMessage::StateSnapshot(StateSnapshot::new(Tick::new(tick), PlayerId::new(player), players));
        let encoded = snapshot.encode().unwrap();
        prop_assert_eq!(decode(&encoded), Some(snapshot));
        // Any truncation is rejected rather than misread.
        prop_assert_eq!(decode(&encoded[..encoded.len() - 1]), None);
    }

    #[test]
    fn prop_framing_ignores_read_boundaries(
        frames in prop::collection::vec(
            (any::<u32>(), prop::collection::vec(any::<u8>(), 0..64)),
            1..10,
        ),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..12),
    ) {
        let mut wire = Vec::new();
        for (sender, payload) in &frames {
            wire.extend(encode_frame(PlayerId::new(*sender), payload).unwrap());
        }
        let mut boundaries: Vec<usize> = cuts.iter().map(|c| c.index(wire.len() + 1)).collect();
        boundaries.push(0);
        boundaries.push(wire.len());
        boundaries.sort_unstable();
        boundaries.dedup();

        let mut framer = StreamFramer::new();
        let mut decoded = Vec::new();
        for window in boundaries.windows(2) {
            framer.push(&wire[window[0]..window[1]]);
            while let Some(frame) = framer.next_frame().unwrap() {
                decoded.push((frame.sender.as_u32(), frame.payload));
            }
            framer.compact();
        }
        prop_assert_eq!(decoded, frames);
        prop_assert_eq!(framer.pending(), 0);
    }
}

// ============================================================================
// Prediction
// ============================================================================

fn prediction_config(buffer: u32) -> PredictionConfig {
    PredictionConfig {
        history_capacity: 64,
        simulation_buffer: buffer,
        ..PredictionConfig::default()
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    })]

    #[test]
    fn prop_catch_up_bounds_the_lead(
        steps in 0u32..40,
        remote in 0u32..200,
        buffer in 1u32..8,
    ) {
        let (mut predictor, _) = predictor_with_stubs(prediction_config(buffer));
        for t in 1..=steps {
            predictor.step_tick(scripted_input(t));
        }
        let remote = Tick::new(remote);
        let lead = predictor.local_tick().ticks_since(remote);
        let moved = predictor.catch_up(remote);
        let after = predictor.local_tick().ticks_since(remote);

        if lead < -(buffer as i32) {
            prop_assert_eq!(after, buffer as i32);
        } else if lead > buffer as i32 {
            prop_assert_eq!(after, 0);
        } else {
            prop_assert!(moved.is_none());
            prop_assert_eq!(after, lead);
        }
        prop_assert_eq!(predictor.local_tick(), predictor.history().newest().next());
    }

    #[test]
    fn prop_reconcile_is_deterministic(
        steps in 10u32..60,
        back in 1u32..10,
        shift in vec2_strategy(),
        stamina in 0.0f32..10.0,
    ) {
        let (mut a, _) = predictor_with_stubs(prediction_config(4));
        let (mut b, _) = predictor_with_stubs(prediction_config(4));
        for t in 1..=steps {
            a.step_tick(scripted_input(t));
            b.step_tick(scripted_input(t));
        }
        let target = a.history().newest().wrapping_sub(back);
        let mut snapshot = a.history().state(target).unwrap().clone();
        {
            let me = snapshot.player_mut(LOCAL).unwrap();
            me.position = me.position + shift;
            me.stamina = stamina;
        }

        let report_a = a.reconcile(&snapshot);
        let report_b = b.reconcile(&snapshot);
        prop_assert_eq!(&report_a, &report_b);
        let report = report_a.unwrap();
        let expected = if report.corrected_any() { back } else { 0 };
        prop_assert_eq!(report.replayed_ticks, expected);
        for tick in a.history().ticks() {
            prop_assert_eq!(a.history().state(tick), b.history().state(tick));
        }
    }
}
