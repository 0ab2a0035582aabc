//! Server-side merge of the redundant input windows clients send every tick.

use std::collections::BTreeMap;

use tracing::trace;

use crate::error::SyncError;
use crate::input::{InputFrame, InputMessage};
use crate::{PlayerId, Tick};

#[derive(Debug, Clone)]
struct PlayerInputs {
    slots: Vec<Option<InputFrame>>,
    newest: Tick,
}

impl PlayerInputs {
    fn get(&self, tick: Tick) -> Option<&InputFrame> {
        self.slots
            .get(tick.buffer_index(self.slots.len()))
            .and_then(Option::as_ref)
            .filter(|frame| frame.tick == tick)
    }
}

/// Per-player rings of received inputs, merged by tick.
///
/// Consecutive [`InputMessage`]s overlap heavily and may arrive out of order or twice;
/// merging by tick makes that harmless. The first frame received for a tick is kept.
/// Frames more than `capacity - 1` ticks older than the newest one seen for that player
/// are ignored.
#[derive(Debug, Clone)]
pub struct RemoteInputBuffer {
    capacity: usize,
    players: BTreeMap<PlayerId, PlayerInputs>,
}

impl RemoteInputBuffer {
    /// Creates an empty buffer keeping `capacity` ticks per player.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidConfig`] if `capacity` is not a power of two or is smaller than 2.
    pub fn new(capacity: usize) -> Result<Self, SyncError> {
        if capacity < 2 || !capacity.is_power_of_two() {
            return Err(SyncError::InvalidConfig {
                info: format!("input buffer capacity must be a power of two >= 2, got {capacity}"),
            });
        }
        Ok(Self {
            capacity,
            players: BTreeMap::new(),
        })
    }

    /// Merges every frame of `message` and returns how many were new.
    pub fn merge(&mut self, message: &InputMessage) -> usize {
        let capacity = self.capacity;
        let Some(first) = message.frames.first() else {
            return 0;
        };
        let inputs = self
            .players
            .entry(message.player_id)
            .or_insert_with(|| PlayerInputs {
                slots: vec![None; capacity],
                newest: first.tick,
            });

        let mut added = 0;
        for frame in &message.frames {
            if inputs.newest.ticks_since(frame.tick) >= capacity as i32 {
                continue;
            }
            if inputs.get(frame.tick).is_some() {
                continue;
            }
            if let Some(slot) = inputs.slots.get_mut(frame.tick.buffer_index(capacity)) {
                *slot = Some(*frame);
                added += 1;
            }
            inputs.newest = inputs.newest.latest(frame.tick);
        }
        trace!(
            player = %message.player_id,
            start = %message.start_tick,
            added,
            "merged input window"
        );
        added
    }

    /// The input `player` sent for `tick`, or a neutral frame if none is stored.
    #[must_use]
    pub fn input(&self, player: PlayerId, tick: Tick) -> InputFrame {
        self.players
            .get(&player)
            .and_then(|inputs| inputs.get(tick))
            .copied()
            .unwrap_or_else(|| InputFrame::neutral(tick))
    }

    /// Returns `true` if an actual input from `player` is stored for `tick`.
    #[must_use]
    pub fn has_input(&self, player: PlayerId, tick: Tick) -> bool {
        self.players
            .get(&player)
            .is_some_and(|inputs| inputs.get(tick).is_some())
    }

    /// Newest tick received from `player`.
    #[must_use]
    pub fn newest_tick(&self, player: PlayerId) -> Option<Tick> {
        self.players.get(&player).map(|inputs| inputs.newest)
    }

    /// Forgets everything received from `player`.
    pub fn remove_player(&mut self, player: PlayerId) -> bool {
        self.players.remove(&player).is_some()
    }

    /// Players with at least one stored input, in ascending order.
    pub fn players(&self) -> impl Iterator<Item = PlayerId> + '_ {
        self.players.keys().copied()
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
    use crate::Vec2;

    const P: PlayerId = PlayerId::new(3);

    fn window(start: u32, end: u32) -> InputMessage {
        let frames = (start..=end)
            .map(|t| InputFrame::new(Vec2::new(t as f32, 0.0), false).at_tick(Tick::new(t)))
            .collect();
        InputMessage::new(P, Tick::new(start), frames)
    }

    #[test]
    fn overlapping_windows_merge_by_tick() {
        let mut buffer = RemoteInputBuffer::new(16).unwrap();
        assert_eq!(buffer.merge(&window(1, 4)), 4);
        assert_eq!(buffer.merge(&window(3, 6)), 2);
        assert_eq!(buffer.merge(&window(2, 5)), 0);
        assert_eq!(buffer.newest_tick(P), Some(Tick::new(6)));
        for t in 1..=6 {
            assert_eq!(buffer.input(P, Tick::new(t)).movement.x, t as f32);
        }
    }

    #[test]
    fn out_of_order_arrival_fills_gaps() {
        let mut buffer = RemoteInputBuffer::new(16).unwrap();
        buffer.merge(&window(8, 10));
        assert!(!buffer.has_input(P, Tick::new(5)));
        buffer.merge(&window(4, 7));
        assert!(buffer.has_input(P, Tick::new(5)));
        assert_eq!(buffer.newest_tick(P), Some(Tick::new(10)));
    }

    #[test]
    fn missing_ticks_are_neutral() {
        let mut buffer = RemoteInputBuffer::new(8).unwrap();
        buffer.merge(&window(1, 2));
        let frame = buffer.input(P, Tick::new(5));
        assert!(frame.is_neutral());
        assert_eq!(frame.tick, Tick::new(5));
        assert!(buffer.input(PlayerId::new(99), Tick::new(1)).is_neutral());
    }

    #[test]
    fn ticks_outside_the_window_are_ignored() {
        let mut buffer = RemoteInputBuffer::new(8).unwrap();
        buffer.merge(&window(20, 20));
        assert_eq!(buffer.merge(&window(10, 12)), 0);
        assert_eq!(buffer.merge(&window(13, 13)), 1);
        // 21 shares a slot with 13
        buffer.merge(&window(21, 21));
        assert!(!buffer.has_input(P, Tick::new(13)));
        assert!(buffer.has_input(P, Tick::new(21)));
    }

    #[test]
    fn windows_merge_across_the_wrap() {
        let mut buffer = RemoteInputBuffer::new(8).unwrap();
        let frames = [u32::MAX - 1, u32::MAX, 0, 1]
            .iter()
            .map(|&t| InputFrame::new(Vec2::new(1.0, 1.0), true).at_tick(Tick::new(t)))
            .collect();
        buffer.merge(&InputMessage::new(P, Tick::new(u32::MAX - 1), frames));
        assert_eq!(buffer.newest_tick(P), Some(Tick::new(1)));
        assert!(buffer.has_input(P, Tick::new(u32::MAX)));
        assert!(buffer.remove_player(P));
        assert_eq!(buffer.players().count(), 0);
    }

    #[test]
    fn rejects_bad_capacity() {
        assert!(RemoteInputBuffer::new(12).is_err());
    }
}
