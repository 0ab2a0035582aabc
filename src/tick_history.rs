//! Circular input and state histories indexed by `tick mod capacity`.
//!
//! # Note
//!
//! [`TickHistory`] is re-exported in [`__internal`](crate::__internal) for property tests
//! and benchmarks.

use crate::error::SyncError;
use crate::input::InputFrame;
use crate::state::StateSnapshot;
use crate::telemetry::{InvariantChecker, InvariantViolation};
use crate::Tick;

/// History capacity used while a session is still in its init phase.
pub const INIT_HISTORY_CAPACITY: usize = 256;

/// History capacity used in the play phase.
pub const PLAY_HISTORY_CAPACITY: usize = 64;

/// Two parallel rings holding the input and the resulting state of the most recent ticks.
///
/// The retained ticks are always contiguous and end at [`newest`](Self::newest). Writing a
/// new tick silently overwrites the slot of the tick `capacity` ticks earlier, so anything
/// older than [`oldest`](Self::oldest) is gone and every accessor returns `None` for it.
///
/// Capacity must be a power of two so that `t` and `t + capacity` share a slot even when
/// the 32-bit counter wraps between them.
#[derive(Debug, Clone)]
pub struct TickHistory {
    inputs: Vec<InputFrame>,
    states: Vec<StateSnapshot>,
    newest: Tick,
    len: usize,
}

impl TickHistory {
    /// Creates a history seeded with `initial` at `initial.tick`, paired with a neutral input.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidConfig`] if `capacity` is not a power of two or is smaller than 2.
    pub fn new(capacity: usize, initial: StateSnapshot) -> Result<Self, SyncError> {
        if capacity < 2 || !capacity.is_power_of_two() {
            return Err(SyncError::InvalidConfig {
                info: format!("history capacity must be a power of two >= 2, got {capacity}"),
            });
        }
        let tick = initial.tick;
        let mut history = Self {
            inputs: vec![InputFrame::default(); capacity],
            states: vec![StateSnapshot::default(); capacity],
            newest: tick,
            len: 1,
        };
        let slot = history.slot(tick);
        history.inputs[slot] = InputFrame::neutral(tick);
        history.states[slot] = initial;
        Ok(history)
    }

    #[inline]
    fn slot(&self, tick: Tick) -> usize {
        tick.buffer_index(self.states.len())
    }

    /// Number of slots in each ring.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.states.len()
    }

    /// Number of retained ticks, between 1 and [`capacity`](Self::capacity).
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always `false`; a history holds at least its seed tick.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The last tick written.
    #[must_use]
    pub fn newest(&self) -> Tick {
        self.newest
    }

    /// The oldest tick still retained.
    #[must_use]
    pub fn oldest(&self) -> Tick {
        self.newest.wrapping_sub(self.len as u32 - 1)
    }

    /// Returns `true` if `tick` is within the retained window.
    #[must_use]
    pub fn contains(&self, tick: Tick) -> bool {
        let back = self.newest.ticks_since(tick);
        back >= 0 && (back as usize) < self.len
    }

    /// Input stored for `tick`.
    #[must_use]
    pub fn input(&self, tick: Tick) -> Option<&InputFrame> {
        self.contains(tick).then(|| &self.inputs[self.slot(tick)])
    }

    /// State stored for `tick`.
    #[must_use]
    pub fn state(&self, tick: Tick) -> Option<&StateSnapshot> {
        self.contains(tick).then(|| &self.states[self.slot(tick)])
    }

    /// Mutable state stored for `tick`.
    pub fn state_mut(&mut self, tick: Tick) -> Option<&mut StateSnapshot> {
        if !self.contains(tick) {
            return None;
        }
        let slot = self.slot(tick);
        self.states.get_mut(slot)
    }

    /// Like [`state`](Self::state), but reports the retained range on a miss.
    pub fn require_state(&self, tick: Tick) -> Result<&StateSnapshot, SyncError> {
        self.state(tick).ok_or(SyncError::TickOutOfRange {
            tick,
            oldest: self.oldest(),
            newest: self.newest,
        })
    }

    /// Appends the next tick: stores `input` stamped with `newest + 1` and seeds that
    /// tick's state with a copy of the current newest state. Returns the new tick.
    ///
    /// The caller then steps the seeded state in place via [`step_slots`](Self::step_slots).
    pub fn push(&mut self, input: InputFrame) -> Tick {
        let previous_slot = self.slot(self.newest);
        let tick = self.newest.next();
        let slot = self.slot(tick);
        self.inputs[slot] = input.at_tick(tick);

        // previous_slot != slot since capacity >= 2
        let (source, target) = pair_mut(&mut self.states, previous_slot, slot);
        target.carry_forward(source, tick);

        self.newest = tick;
        self.len = (self.len + 1).min(self.capacity());
        tick
    }

    /// Borrows what stepping `tick` needs: its input, the previous tick's state and the
    /// state slot for `tick` itself.
    ///
    /// Returns `None` unless both `tick` and the tick before it are retained.
    pub fn step_slots(
        &mut self,
        tick: Tick,
    ) -> Option<(&InputFrame, &StateSnapshot, &mut StateSnapshot)> {
        let previous = tick.wrapping_sub(1);
        if !self.contains(tick) || !self.contains(previous) {
            return None;
        }
        let slot = self.slot(tick);
        let previous_slot = self.slot(previous);
        let (source, target) = pair_mut(&mut self.states, previous_slot, slot);
        Some((&self.inputs[slot], source, target))
    }

    /// Jumps forward so that `tick` becomes the newest tick.
    ///
    /// Every skipped tick (at most one full ring) is filled with a neutral input and a
    /// copy of the last stored state, so later reads never see a stale slot. Does nothing
    /// if `tick` is not after the current newest tick. Returns the number of slots filled.
    pub fn fast_forward(&mut self, tick: Tick) -> usize {
        let gap = tick.ticks_since(self.newest);
        if gap <= 0 {
            return 0;
        }
        let last = self.states[self.slot(self.newest)].clone();
        let fill = (gap as usize).min(self.capacity());
        let first = tick.wrapping_sub(fill as u32 - 1);
        for offset in 0..fill {
            let t = first.wrapping_add(offset as u32);
            let slot = self.slot(t);
            self.inputs[slot] = InputFrame::neutral(t);
            self.states[slot].carry_forward(&last, t);
        }
        self.newest = tick;
        self.len = (self.len + gap as usize).min(self.capacity());
        fill
    }

    /// Moves the newest tick back to `tick`, discarding everything after it.
    ///
    /// If `tick` is no longer retained the history is re-seeded at `tick` from the oldest
    /// retained state. Does nothing if `tick` is not before the current newest tick.
    pub fn rewind_to(&mut self, tick: Tick) {
        let back = self.newest.ticks_since(tick);
        if back <= 0 {
            return;
        }
        if self.contains(tick) {
            self.len -= back as usize;
            self.newest = tick;
            return;
        }
        let seed = self.states[self.slot(self.oldest())].clone();
        let slot = self.slot(tick);
        self.states[slot].carry_forward(&seed, tick);
        self.inputs[slot] = InputFrame::neutral(tick);
        self.newest = tick;
        self.len = 1;
    }

    /// Iterates the retained ticks from oldest to newest.
    pub fn ticks(&self) -> impl Iterator<Item = Tick> + '_ {
        let oldest = self.oldest();
        (0..self.len).map(move |offset| oldest.wrapping_add(offset as u32))
    }
}

/// Borrows `slots[read]` shared and `slots[write]` mutably. The indices must differ.
fn pair_mut(
    slots: &mut [StateSnapshot],
    read: usize,
    write: usize,
) -> (&StateSnapshot, &mut StateSnapshot) {
    if read < write {
        let (left, right) = slots.split_at_mut(write);
        (&left[read], &mut right[0])
    } else {
        let (left, right) = slots.split_at_mut(read);
        (&right[0], &mut left[write])
    }
}

impl InvariantChecker for TickHistory {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let capacity = self.capacity();
        if capacity < 2 || !capacity.is_power_of_two() {
            return Err(InvariantViolation::new(
                "TickHistory",
                "capacity is not a power of two >= 2",
            )
            .with_details(format!("capacity={capacity}")));
        }
        if self.inputs.len() != capacity {
            return Err(InvariantViolation::new(
                "TickHistory",
                "input and state rings differ in size",
            )
            .with_details(format!("inputs={}, states={capacity}", self.inputs.len())));
        }
        if self.len == 0 || self.len > capacity {
            return Err(InvariantViolation::new("TickHistory", "retained length out of range")
                .with_details(format!("len={}, capacity={capacity}", self.len)));
        }
        for tick in self.ticks() {
            let slot = self.slot(tick);
            if self.inputs[slot].tick != tick || self.states[slot].tick != tick {
                return Err(InvariantViolation::new(
                    "TickHistory",
                    "retained slot is stamped with the wrong tick",
                )
                .with_details(format!(
                    "tick={tick}, input_tick={}, state_tick={}",
                    self.inputs[slot].tick, self.states[slot].tick
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::state::PlayerState;
    use crate::{PlayerId, Vec2};

    fn seed(tick: u32) -> StateSnapshot {
        StateSnapshot::new(
            Tick::new(tick),
            PlayerId::new(1),
            vec![PlayerState::at(PlayerId::new(1), Vec2::ZERO, 10.0)],
        )
    }

    fn moving(x: f32) -> InputFrame {
        InputFrame::new(Vec2::new(x, 0.0), false)
    }

    #[test]
    fn rejects_bad_capacities() {
        for capacity in [0, 1, 3, 48, 100] {
            assert!(matches!(
                TickHistory::new(capacity, seed(0)),
                Err(SyncError::InvalidConfig { .. })
            ));
        }
        assert!(TickHistory::new(PLAY_HISTORY_CAPACITY, seed(0)).is_ok());
        assert!(TickHistory::new(INIT_HISTORY_CAPACITY, seed(0)).is_ok());
    }

    #[test]
    fn push_stamps_and_carries_forward() {
        let mut history = TickHistory::new(8, seed(10)).unwrap();
        let tick = history.push(moving(1.0));
        assert_eq!(tick, Tick::new(11));
        assert_eq!(history.input(tick).unwrap().tick, tick);
        assert_eq!(history.state(tick).unwrap().tick, tick);
        assert_eq!(history.state(tick).unwrap().players, seed(10).players);
        assert_eq!(history.len(), 2);
        assert!(history.check_invariants().is_ok());
    }

    #[test]
    fn old_ticks_fall_out_of_the_window() {
        let mut history = TickHistory::new(4, seed(0)).unwrap();
        for _ in 0..6 {
            history.push(moving(0.0));
        }
        assert_eq!(history.newest(), Tick::new(6));
        assert_eq!(history.oldest(), Tick::new(3));
        assert!(history.state(Tick::new(2)).is_none());
        assert!(history.input(Tick::new(7)).is_none());
        assert!(matches!(
            history.require_state(Tick::new(2)),
            Err(SyncError::TickOutOfRange { oldest, newest, .. })
                if oldest == Tick::new(3) && newest == Tick::new(6)
        ));
        assert_eq!(history.ticks().count(), 4);
    }

    #[test]
    fn slots_line_up_across_the_wrap() {
        let mut history = TickHistory::new(8, seed(u32::MAX - 2)).unwrap();
        for i in 0..5 {
            history.push(moving(i as f32));
        }
        assert_eq!(history.newest(), Tick::new(2));
        assert_eq!(history.oldest(), Tick::new(u32::MAX - 2));
        assert_eq!(history.input(Tick::new(0)).unwrap().movement.x, 2.0);
        assert!(history.check_invariants().is_ok());
    }

    #[test]
    fn step_slots_needs_both_ticks() {
        let mut history = TickHistory::new(4, seed(0)).unwrap();
        assert!(history.step_slots(Tick::ZERO).is_none());
        history.push(moving(3.0));
        let (input, previous, next) = history.step_slots(Tick::new(1)).unwrap();
        assert_eq!(input.movement.x, 3.0);
        assert_eq!(previous.tick, Tick::ZERO);
        next.players[0].position.x = 9.0;
        assert_eq!(history.state(Tick::new(1)).unwrap().players[0].position.x, 9.0);
        assert_eq!(history.state(Tick::ZERO).unwrap().players[0].position.x, 0.0);
    }

    #[test]
    fn step_slots_at_ring_boundary() {
        let mut history = TickHistory::new(4, seed(3)).unwrap();
        history.push(moving(0.0));
        // tick 4 lives in slot 0, tick 3 in slot 3
        let (_, previous, next) = history.step_slots(Tick::new(4)).unwrap();
        assert_eq!(previous.tick, Tick::new(3));
        assert_eq!(next.tick, Tick::new(4));
    }

    #[test]
    fn fast_forward_fills_gap_with_neutral_input() {
        let mut history = TickHistory::new(8, seed(0)).unwrap();
        history.push(moving(1.0));
        let filled = history.fast_forward(Tick::new(4));
        assert_eq!(filled, 3);
        assert_eq!(history.newest(), Tick::new(4));
        assert_eq!(history.len(), 5);
        assert!(history.input(Tick::new(3)).unwrap().is_neutral());
        assert!(!history.input(Tick::new(1)).unwrap().is_neutral());
        assert!(history.check_invariants().is_ok());
    }

    #[test]
    fn fast_forward_is_capped_at_capacity() {
        let mut history = TickHistory::new(4, seed(0)).unwrap();
        assert_eq!(history.fast_forward(Tick::new(1000)), 4);
        assert_eq!(history.oldest(), Tick::new(997));
        assert_eq!(history.len(), 4);
        assert!(history.check_invariants().is_ok());
        assert_eq!(history.fast_forward(Tick::new(10)), 0);
    }

    #[test]
    fn rewind_within_window_truncates() {
        let mut history = TickHistory::new(8, seed(0)).unwrap();
        for _ in 0..5 {
            history.push(moving(0.0));
        }
        history.rewind_to(Tick::new(2));
        assert_eq!(history.newest(), Tick::new(2));
        assert_eq!(history.len(), 3);
        assert!(history.state(Tick::new(3)).is_none());
        assert!(history.check_invariants().is_ok());
    }

    #[test]
    fn rewind_past_window_reseeds() {
        let mut history = TickHistory::new(4, seed(100)).unwrap();
        for _ in 0..10 {
            history.push(moving(0.0));
        }
        history.rewind_to(Tick::new(50));
        assert_eq!(history.newest(), Tick::new(50));
        assert_eq!(history.len(), 1);
        assert_eq!(history.state(Tick::new(50)).unwrap().tick, Tick::new(50));
        assert!(history.check_invariants().is_ok());
    }
}
