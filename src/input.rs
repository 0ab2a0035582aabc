//! Per-tick player intent and the redundant batches it travels in.

use serde::{Deserialize, Serialize};

use crate::{PlayerId, Tick};

/// A 2D vector of `f32` components, used for movement, positions and velocities.
#[derive(Debug, Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    /// Horizontal component.
    pub x: f32,
    /// Vertical component.
    pub y: f32,
}

impl Vec2 {
    /// The zero vector.
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    /// Creates a new vector.
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean length.
    #[must_use]
    pub fn length(self) -> f32 {
        self.x.hypot(self.y)
    }

    /// Distance between two points.
    #[must_use]
    pub fn distance(self, other: Vec2) -> f32 {
        (self - other).length()
    }

    /// Multiplies both components by `factor`.
    #[must_use]
    pub fn scaled(self, factor: f32) -> Self {
        Self::new(self.x * factor, self.y * factor)
    }
}

impl std::ops::Add for Vec2 {
    type Output = Vec2;

    fn add(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl std::ops::Sub for Vec2 {
    type Output = Vec2;

    fn sub(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

/// Player intent for one tick.
///
/// Frames are immutable once stored in the history. When no live input is available for a
/// tick (the host did not sample one, or the session is still connecting) a
/// [`neutral`](InputFrame::neutral) frame is stored instead.
///
/// On the wire this is a fixed 13-byte record: tick, movement x/y, sprint flag.
#[derive(Debug, Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InputFrame {
    /// Tick this input applies to.
    pub tick: Tick,
    /// Requested movement direction.
    pub movement: Vec2,
    /// Whether the sprint action is held.
    pub sprinting: bool,
}

impl InputFrame {
    /// Creates an input frame for an unspecified tick; the history stamps the tick when
    /// the frame is stored.
    #[must_use]
    pub const fn new(movement: Vec2, sprinting: bool) -> Self {
        Self {
            tick: Tick::ZERO,
            movement,
            sprinting,
        }
    }

    /// The "no intent" input used when nothing was sampled for `tick`.
    #[must_use]
    pub const fn neutral(tick: Tick) -> Self {
        Self {
            tick,
            movement: Vec2::ZERO,
            sprinting: false,
        }
    }

    /// Returns `true` if this frame carries no intent.
    #[must_use]
    pub fn is_neutral(&self) -> bool {
        self.movement == Vec2::ZERO && !self.sprinting
    }

    /// Returns a copy of this frame stamped with `tick`.
    #[must_use]
    pub const fn at_tick(mut self, tick: Tick) -> Self {
        self.tick = tick;
        self
    }
}

/// A contiguous run of a player's input frames, re-sent every tick.
///
/// Consecutive messages overlap, so losing one datagram does not lose an input: the next
/// message covers the same ticks again. Receivers merge by tick (see
/// [`RemoteInputBuffer`](crate::RemoteInputBuffer)) and must not assume in-order arrival.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InputMessage {
    /// The sending player.
    pub player_id: PlayerId,
    /// Tick of the first frame in `frames`.
    pub start_tick: Tick,
    /// Frames for `start_tick, start_tick + 1, ...`.
    pub frames: Vec<InputFrame>,
}

impl InputMessage {
    /// Creates a new input message.
    #[must_use]
    pub fn new(player_id: PlayerId, start_tick: Tick, frames: Vec<InputFrame>) -> Self {
        Self {
            player_id,
            start_tick,
            frames,
        }
    }

    /// Tick of the last frame, or `None` for an empty message.
    #[must_use]
    pub fn end_tick(&self) -> Option<Tick> {
        self.frames.last().map(|frame| frame.tick)
    }

    /// The frame carried for `tick`, if this message covers it.
    #[must_use]
    pub fn frame_for(&self, tick: Tick) -> Option<&InputFrame> {
        let offset = tick.ticks_since(self.start_tick);
        if offset < 0 {
            return None;
        }
        self.frames
            .get(offset as usize)
            .filter(|frame| frame.tick == tick)
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

    fn frames(start: u32, count: u32) -> Vec<InputFrame> {
        (0..count)
            .map(|i| InputFrame::new(Vec2::new(i as f32, 0.0), false).at_tick(Tick::new(start.wrapping_add(i))))
            .collect()
    }

    #[test]
    fn neutral_frame_has_no_intent() {
        let frame = InputFrame::neutral(Tick::new(9));
        assert!(frame.is_neutral());
        assert_eq!(frame.tick, Tick::new(9));
        assert!(!InputFrame::new(Vec2::new(1.0, 0.0), false).is_neutral());
        assert!(!InputFrame::new(Vec2::ZERO, true).is_neutral());
    }

    #[test]
    fn default_is_neutral() {
        assert!(InputFrame::default().is_neutral());
    }

    #[test]
    fn frame_for_finds_covered_ticks() {
        let msg = InputMessage::new(PlayerId::new(1), Tick::new(10), frames(10, 5));
        assert_eq!(msg.end_tick(), Some(Tick::new(14)));
        assert_eq!(msg.frame_for(Tick::new(12)).unwrap().movement.x, 2.0);
        assert!(msg.frame_for(Tick::new(9)).is_none());
        assert!(msg.frame_for(Tick::new(15)).is_none());
    }

    #[test]
    fn frame_for_across_wrap() {
        let start = u32::MAX - 1;
        let msg = InputMessage::new(PlayerId::new(1), Tick::new(start), frames(start, 4));
        assert_eq!(msg.frame_for(Tick::new(1)).unwrap().movement.x, 3.0);
        assert_eq!(msg.end_tick(), Some(Tick::new(1)));
    }

    #[test]
    fn empty_message_has_no_end() {
        let msg = InputMessage::default();
        assert_eq!(msg.end_tick(), None);
        assert!(msg.frame_for(Tick::ZERO).is_none());
    }

    #[test]
    fn vec2_math() {
        let a = Vec2::new(3.0, 4.0);
        assert_eq!(a.length(), 5.0);
        assert_eq!((a - Vec2::new(3.0, 0.0)).length(), 4.0);
        assert_eq!(a.scaled(2.0), Vec2::new(6.0, 8.0));
        assert_eq!(a.distance(Vec2::ZERO), 5.0);
    }
}
