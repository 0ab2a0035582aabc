//! # rewind-sync
//!
//! Client-side prediction and server reconciliation for fixed-tick multiplayer games.
//!
//! A client simulates every tick locally from player input, keeps the last few ticks of
//! input and predicted state in circular histories, and when the server's authoritative
//! snapshot for an older tick arrives it checks each registered [`StateUpdater`] for
//! divergence, rewinds the ones that mispredicted and replays them forward from the stored
//! inputs. Only the subsystems that actually diverged are corrected.
//!
//! Alongside the predictor the crate ships the wire protocol it talks:
//!
//! - a self-describing binary codec ([`WireMessage`]) with a leading tag byte,
//!   little-endian fixed-width fields and count-prefixed lists,
//! - datagram transport for gameplay traffic ([`UdpNonBlockingSocket`]),
//! - a reliable, reconnect-tolerant stream channel for the handshake
//!   ([`ConnectionManager`] on the server, [`ReliableClient`] on the client), framed as
//!   `[sender][length][payload]` with empty payloads acting as keep-alives.
//!
//! The host drives a session through two entry points: [`ClientSession::on_frame`] samples
//! the latest input at whatever rate the host renders, and [`ClientSession::on_fixed_step`]
//! runs one deterministic tick. Nothing here depends on a particular engine loop.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use error::SyncError;
pub use input::{InputFrame, InputMessage, Vec2};
pub use network::codec::{MessageTag, WireMessage};
pub use network::connection_manager::{ConnectionListener, ConnectionManager};
pub use network::endpoint_registry::{EndpointRegistry, Identified};
pub use network::framing::{StreamFrame, StreamFramer};
pub use network::reliable_client::ReliableClient;
#[cfg(feature = "tokio")]
pub use network::tokio_socket::TokioUdpSocket;
pub use network::udp_socket::UdpNonBlockingSocket;
pub use sessions::builder::ClientSessionBuilder;
pub use sessions::client_session::{ClientSession, SessionEvent, SessionPhase};
pub use sessions::config::{InputWindow, PredictionConfig, TransportConfig};
pub use sessions::predictor::{CatchUp, CorrectedUpdaters, Predictor, ReconcileReport, StepOutcome};
pub use sessions::remote_inputs::RemoteInputBuffer;
pub use sessions::snapshot_inbox::SnapshotInbox;
pub use state::{GameStart, PlayerState, StateSnapshot};
pub use tick_history::{TickHistory, INIT_HISTORY_CAPACITY, PLAY_HISTORY_CAPACITY};
pub use world::{CellInfo, CellKind, DoorType, LogicCell};

/// Deterministic checksums over the wire encoding of snapshots.
pub mod checksum;
#[doc(hidden)]
pub mod error;
pub mod input;
pub mod prelude;
pub mod state;
pub mod telemetry;
#[doc(hidden)]
pub mod tick_history;
pub mod world;
#[doc(hidden)]
pub mod sessions {
    #[doc(hidden)]
    pub mod builder;
    pub mod client_session;
    pub mod config;
    #[doc(hidden)]
    pub mod predictor;
    pub mod remote_inputs;
    pub mod snapshot_inbox;
}
#[doc(hidden)]
pub mod network {
    /// Binary codec for the tagged wire messages.
    ///
    /// Records are serialized with bincode's fixed-width little-endian configuration;
    /// tags and list counts are laid out by hand so that every length can be checked
    /// against the remaining buffer before anything is allocated.
    pub mod codec;
    pub mod connection_manager;
    pub mod endpoint_registry;
    pub mod framing;
    pub mod reliable_client;
    #[cfg(feature = "tokio")]
    pub mod tokio_socket;
    #[doc(hidden)]
    pub mod udp_socket;
}

/// Internal module exposing implementation details for integration tests, property
/// tests and benchmarks.
///
/// **This module is NOT part of the public API.** Nothing here is covered by semver and
/// it may change without notice.
#[doc(hidden)]
pub mod __internal {
    pub use crate::network::codec::{
        decode_record, encode_record, INPUT_FRAME_RECORD_SIZE, PLAYER_STATE_RECORD_SIZE,
    };
    pub use crate::network::framing::{
        first_frame_from_bytes, is_keep_alive_datagram, FRAME_HEADER_SIZE, MAX_STREAM_PAYLOAD,
    };
    pub use crate::tick_history::TickHistory;
}

// #############
// # CONSTANTS #
// #############

/// A tick is one discrete step of the fixed-rate simulation clock.
///
/// Ticks are unsigned 32-bit counters that wrap around modulo 2^32. Because a long-running
/// session will eventually wrap, `Tick` does not implement `Ord`; ordering is defined with
/// serial-number arithmetic instead: `a` is after `b` when the wrapping difference
/// `a - b`, read as a signed 32-bit value, is positive. This is correct as long as the two
/// ticks are less than 2^31 apart, which any retained history trivially satisfies.
///
/// # Examples
///
/// ```
/// use rewind_sync::Tick;
///
/// let last = Tick::new(u32::MAX);
/// let wrapped = last.next();
/// assert_eq!(wrapped.as_u32(), 0);
/// assert!(wrapped.is_after(last));
/// assert_eq!(wrapped.ticks_since(last), 1);
///
/// // Buffer slots line up across the wrap for power-of-two capacities.
/// assert_eq!(Tick::new(u32::MAX - 63).buffer_index(64), wrapped.buffer_index(64));
/// ```
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
pub struct Tick(u32);

impl Tick {
    /// The first tick of a session.
    pub const ZERO: Tick = Tick(0);

    /// Creates a new `Tick` from a raw counter value.
    #[inline]
    #[must_use]
    pub const fn new(tick: u32) -> Self {
        Tick(tick)
    }

    /// Returns the underlying counter value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// The tick immediately after this one, wrapping at `u32::MAX`.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Tick(self.0.wrapping_add(1))
    }

    /// Moves `n` ticks forward, wrapping.
    #[inline]
    #[must_use]
    pub const fn wrapping_add(self, n: u32) -> Self {
        Tick(self.0.wrapping_add(n))
    }

    /// Moves `n` ticks backward, wrapping.
    #[inline]
    #[must_use]
    pub const fn wrapping_sub(self, n: u32) -> Self {
        Tick(self.0.wrapping_sub(n))
    }

    /// Signed distance from `earlier` to `self` under serial-number arithmetic.
    ///
    /// Positive when `self` is after `earlier`, negative when before.
    #[inline]
    #[must_use]
    pub const fn ticks_since(self, earlier: Tick) -> i32 {
        self.0.wrapping_sub(earlier.0) as i32
    }

    /// Returns `true` if `self` comes strictly after `other`.
    #[inline]
    #[must_use]
    pub const fn is_after(self, other: Tick) -> bool {
        self.ticks_since(other) > 0
    }

    /// Returns `true` if `self` comes strictly before `other`.
    #[inline]
    #[must_use]
    pub const fn is_before(self, other: Tick) -> bool {
        self.ticks_since(other) < 0
    }

    /// The later of the two ticks, by serial-number ordering.
    #[inline]
    #[must_use]
    pub const fn latest(self, other: Tick) -> Tick {
        if other.is_after(self) {
            other
        } else {
            self
        }
    }

    /// Slot of this tick in a circular buffer of `capacity` entries (`tick mod capacity`).
    ///
    /// A zero capacity maps every tick to slot 0; histories reject zero capacities at
    /// construction so this never indexes an empty buffer.
    #[inline]
    #[must_use]
    pub const fn buffer_index(self, capacity: usize) -> usize {
        if capacity == 0 {
            0
        } else {
            (self.0 as usize) % capacity
        }
    }
}

impl std::fmt::Display for Tick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Tick {
    #[inline]
    fn from(value: u32) -> Self {
        Tick(value)
    }
}

impl From<Tick> for u32 {
    #[inline]
    fn from(tick: Tick) -> Self {
        tick.0
    }
}

/// Stable identity of a player across transport reconnects.
///
/// The server assigns it during the handshake; the reliable channel uses it to re-home a
/// peer whose endpoint changed.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PlayerId(u32);

impl PlayerId {
    /// Creates a new `PlayerId`.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        PlayerId(id)
    }

    /// Returns the underlying identifier.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PlayerId {
    fn from(id: u32) -> Self {
        PlayerId(id)
    }
}

/// A subsystem that owns one slice of the [`StateSnapshot`] and knows how to step it,
/// test it for divergence, and overwrite it from an authoritative source.
///
/// The [`Predictor`] holds a list of these as trait objects and never looks at the
/// concrete subsystem types. Implementations must only touch their own slice of `next`
/// and `state`: during a partial correction the other updaters' data in those snapshots
/// must be left exactly as it was.
///
/// `step` must be deterministic: given the same `previous`, `input` and `delta` it must
/// produce the same slice, because it is re-run during replay.
pub trait StateUpdater {
    /// Short name used in logs and telemetry.
    fn name(&self) -> &'static str {
        "state_updater"
    }

    /// Advances this updater's slice from `previous` into `next` using `input`.
    ///
    /// `next` arrives pre-populated with the rest of the state for that tick.
    fn step(
        &mut self,
        previous: &StateSnapshot,
        next: &mut StateSnapshot,
        input: &InputFrame,
        delta: f32,
    );

    /// Returns `true` if `local` differs from `remote` beyond this updater's tolerance.
    fn needs_correction(&self, local: &StateSnapshot, remote: &StateSnapshot) -> bool;

    /// Overwrites this updater's slice of `state` from `authoritative`.
    fn update_from_authoritative(&mut self, state: &mut StateSnapshot, authoritative: &StateSnapshot);
}

/// The opaque world/physics step shared by all updaters.
///
/// It is advanced exactly once per simulated tick, including once per replayed tick, so
/// it must be deterministic given the same sequence of calls.
pub trait Simulation {
    /// Advances the world by `delta` seconds.
    fn advance(&mut self, delta: f32);
}

/// A simulation that does nothing, for hosts whose updaters carry all the state.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSimulation;

impl Simulation for NoopSimulation {
    fn advance(&mut self, _delta: f32) {}
}

/// Reliable, ordered byte channel used for the handshake.
///
/// [`ReliableClient`] implements it over TCP; tests can implement it with an in-memory queue.
pub trait ReliableChannel {
    /// Queues one application payload for delivery.
    fn send(&mut self, payload: &[u8]) -> Result<(), SyncError>;

    /// Returns every non-keep-alive payload received since the last call.
    fn poll(&mut self) -> Vec<Vec<u8>>;

    /// Updates the identity stamped on outgoing frames once the server has assigned one.
    fn set_identity(&mut self, _player: PlayerId) {}
}

/// Endpoint type identifying the server on the unreliable channel.
///
/// Implemented for every type with the listed bounds; `SocketAddr` is the usual choice,
/// tests often use a small integer.
#[cfg(feature = "sync-send")]
pub trait Address: Clone + PartialEq + Eq + std::hash::Hash + std::fmt::Debug + Send + Sync + 'static {}

#[cfg(feature = "sync-send")]
impl<T> Address for T where
    T: Clone + PartialEq + Eq + std::hash::Hash + std::fmt::Debug + Send + Sync + 'static
{
}

/// Endpoint type identifying the server on the unreliable channel.
///
/// Implemented for every type with the listed bounds; `SocketAddr` is the usual choice,
/// tests often use a small integer.
#[cfg(not(feature = "sync-send"))]
pub trait Address: Clone + PartialEq + Eq + std::hash::Hash + std::fmt::Debug + 'static {}

#[cfg(not(feature = "sync-send"))]
impl<T> Address for T where T: Clone + PartialEq + Eq + std::hash::Hash + std::fmt::Debug + 'static {}

/// This [`NonBlockingSocket`] trait carries gameplay traffic over an unreliable transport.
/// Messages are sent in an UDP-like fashion: one [`WireMessage`] per datagram, unordered
/// and possibly lost. Keep-alive datagrams must never be surfaced by
/// [`receive_all_messages`](NonBlockingSocket::receive_all_messages), and neither may
/// anything that fails to decode.
#[cfg(feature = "sync-send")]
pub trait NonBlockingSocket<A>: Send + Sync
where
    A: Clone + PartialEq + Eq + std::hash::Hash + Send + Sync,
{
    /// Takes a [`WireMessage`] and sends it to the given address.
    fn send_to(&mut self, msg: &WireMessage, addr: &A);

    /// Sends an empty datagram to keep the path alive.
    fn send_keep_alive(&mut self, addr: &A);

    /// This method should return all messages received since the last time this method was called.
    /// The pairs `(A, WireMessage)` indicate from which address each packet was received.
    fn receive_all_messages(&mut self) -> Vec<(A, WireMessage)>;
}

/// This [`NonBlockingSocket`] trait carries gameplay traffic over an unreliable transport.
/// Messages are sent in an UDP-like fashion: one [`WireMessage`] per datagram, unordered
/// and possibly lost. Keep-alive datagrams must never be surfaced by
/// [`receive_all_messages`](NonBlockingSocket::receive_all_messages), and neither may
/// anything that fails to decode.
#[cfg(not(feature = "sync-send"))]
pub trait NonBlockingSocket<A>
where
    A: Clone + PartialEq + Eq + std::hash::Hash,
{
    /// Takes a [`WireMessage`] and sends it to the given address.
    fn send_to(&mut self, msg: &WireMessage, addr: &A);

    /// Sends an empty datagram to keep the path alive.
    fn send_keep_alive(&mut self, addr: &A);

    /// This method should return all messages received since the last time this method was called.
    /// The pairs `(A, WireMessage)` indicate from which address each packet was received.
    fn receive_all_messages(&mut self) -> Vec<(A, WireMessage)>;
}

// ###################
// # UNIT TESTS      #
// ###################

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    // ==========================================
    // Tick Tests
    // ==========================================

    #[test]
    fn tick_next_wraps_at_max() {
        assert_eq!(Tick::new(u32::MAX).next(), Tick::ZERO);
        assert_eq!(Tick::new(41).next().as_u32(), 42);
    }

    #[test]
    fn tick_ordering_survives_wraparound() {
        let before_wrap = Tick::new(u32::MAX - 2);
        let after_wrap = Tick::new(3);
        assert!(after_wrap.is_after(before_wrap));
        assert!(before_wrap.is_before(after_wrap));
        assert_eq!(after_wrap.ticks_since(before_wrap), 6);
        assert_eq!(before_wrap.ticks_since(after_wrap), -6);
    }

    #[test]
    fn tick_is_neither_before_nor_after_itself() {
        let t = Tick::new(1234);
        assert!(!t.is_after(t));
        assert!(!t.is_before(t));
        assert_eq!(t.ticks_since(t), 0);
    }

    #[test]
    fn tick_latest_picks_serial_maximum() {
        let a = Tick::new(u32::MAX);
        let b = Tick::new(1);
        assert_eq!(a.latest(b), b);
        assert_eq!(b.latest(a), b);
        assert_eq!(a.latest(a), a);
    }

    #[test]
    fn tick_wrapping_add_and_sub_are_inverse() {
        let t = Tick::new(5);
        assert_eq!(t.wrapping_sub(10).wrapping_add(10), t);
        assert_eq!(t.wrapping_sub(10).as_u32(), u32::MAX - 4);
    }

    #[test]
    fn buffer_index_matches_modulo() {
        assert_eq!(Tick::new(100).buffer_index(64), 36);
        assert_eq!(Tick::new(64).buffer_index(64), 0);
        assert_eq!(Tick::new(7).buffer_index(0), 0);
    }

    #[test]
    fn buffer_index_aligned_across_wrap_for_powers_of_two() {
        for capacity in [1usize, 2, 64, 256, 1024] {
            let t1 = Tick::new(u32::MAX - 5);
            let t2 = t1.wrapping_add(capacity as u32);
            assert_eq!(t1.buffer_index(capacity), t2.buffer_index(capacity));
        }
    }

    #[test]
    fn tick_display_is_raw_number() {
        assert_eq!(Tick::new(95).to_string(), "95");
    }

    // ==========================================
    // PlayerId Tests
    // ==========================================

    #[test]
    fn player_id_round_trips_through_u32() {
        let id = PlayerId::from(7);
        assert_eq!(id.as_u32(), 7);
        assert_eq!(id.to_string(), "7");
    }

    #[test]
    fn noop_simulation_advances_without_effect() {
        let mut sim = NoopSimulation;
        sim.advance(0.02);
    }
}
