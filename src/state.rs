//! Per-tick world state as exchanged between client and server.

use serde::{Deserialize, Serialize};

use crate::world::CellInfo;
use crate::{PlayerId, Tick, Vec2};

/// State of one player for one tick.
///
/// On the wire this is a fixed 24-byte record: id, position, velocity, stamina.
#[derive(Debug, Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlayerState {
    /// Which player this is.
    pub id: PlayerId,
    /// World position.
    pub position: Vec2,
    /// Velocity in world units per second.
    pub velocity: Vec2,
    /// Remaining sprint stamina.
    pub stamina: f32,
}

impl PlayerState {
    /// A player at rest at `position` with the given stamina.
    #[must_use]
    pub const fn at(id: PlayerId, position: Vec2, stamina: f32) -> Self {
        Self {
            id,
            position,
            velocity: Vec2::ZERO,
            stamina,
        }
    }
}

/// Everything the simulation knows about one tick.
///
/// The server produces one authoritative snapshot per tick; the client produces one
/// predicted snapshot per tick into its history. The embedded `tick` lets a receiver
/// align a snapshot with its local history.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StateSnapshot {
    /// Tick this state is the result of.
    pub tick: Tick,
    /// The player this snapshot was produced for.
    pub owner: PlayerId,
    /// Every player's state.
    pub players: Vec<PlayerState>,
}

impl StateSnapshot {
    /// Creates a new snapshot.
    #[must_use]
    pub fn new(tick: Tick, owner: PlayerId, players: Vec<PlayerState>) -> Self {
        Self {
            tick,
            owner,
            players,
        }
    }

    /// State of player `id`, if present.
    #[must_use]
    pub fn player(&self, id: PlayerId) -> Option<&PlayerState> {
        self.players.iter().find(|p| p.id == id)
    }

    /// Mutable state of player `id`, if present.
    pub fn player_mut(&mut self, id: PlayerId) -> Option<&mut PlayerState> {
        self.players.iter_mut().find(|p| p.id == id)
    }

    /// Copies `previous` into `self` for a new tick, reusing the player allocation.
    pub fn carry_forward(&mut self, previous: &StateSnapshot, tick: Tick) {
        self.tick = tick;
        self.owner = previous.owner;
        self.players.clone_from(&previous.players);
    }
}

/// Handshake payload announcing the start of a game.
///
/// Delivered once over the reliable channel: the roster, the simulation buffer the
/// client must keep between itself and the server, and the world layout.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GameStart {
    /// How many ticks the client may run ahead of (or behind) the server.
    pub simulation_buffer: u32,
    /// Initial state of every player.
    pub players: Vec<PlayerState>,
    /// Width of the world grid in cells; `cells` is row-major.
    pub grid_width: u32,
    /// World cells.
    pub cells: Vec<CellInfo>,
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

    fn two_players() -> Vec<PlayerState> {
        vec![
            PlayerState::at(PlayerId::new(1), Vec2::new(1.0, 1.0), 10.0),
            PlayerState::at(PlayerId::new(2), Vec2::new(5.0, 2.0), 8.0),
        ]
    }

    #[test]
    fn player_lookup() {
        let mut snapshot = StateSnapshot::new(Tick::new(3), PlayerId::new(1), two_players());
        assert_eq!(snapshot.player(PlayerId::new(2)).unwrap().stamina, 8.0);
        assert!(snapshot.player(PlayerId::new(9)).is_none());

        snapshot.player_mut(PlayerId::new(1)).unwrap().stamina = 0.5;
        assert_eq!(snapshot.players[0].stamina, 0.5);
    }

    #[test]
    fn carry_forward_copies_everything_but_tick() {
        let previous = StateSnapshot::new(Tick::new(3), PlayerId::new(1), two_players());
        let mut next = StateSnapshot::default();
        next.carry_forward(&previous, Tick::new(4));
        assert_eq!(next.tick, Tick::new(4));
        assert_eq!(next.owner, previous.owner);
        assert_eq!(next.players, previous.players);
    }
}
