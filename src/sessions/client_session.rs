//! The client session: handshake over the reliable channel, then the prediction loop.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::error::SyncError;
use crate::input::InputFrame;
use crate::network::codec::{self, WireMessage};
use crate::sessions::config::PredictionConfig;
use crate::sessions::predictor::{CatchUp, Predictor, ReconcileReport, StepOutcome};
use crate::state::{GameStart, PlayerState, StateSnapshot};
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{
    report_violation_to, Address, NonBlockingSocket, NoopSimulation, PlayerId, ReliableChannel,
    Simulation, StateUpdater, Tick,
};

/// Maximum number of events kept before the oldest are dropped.
const MAX_EVENT_QUEUE_SIZE: usize = 64;

/// Where a [`ClientSession`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    /// Connecting: waiting for an identity, the game roster and the world.
    Init,
    /// Running the fixed-tick prediction loop.
    Play,
}

impl SessionPhase {
    /// Lowercase name, as used in errors and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Play => "play",
        }
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications a [`ClientSession`] queues for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionEvent {
    /// The server assigned this client an identity.
    Identified {
        /// The assigned identity.
        player_id: PlayerId,
    },
    /// The server announced the game; the host should build the world from
    /// [`ClientSession::game_start`] and then call [`ClientSession::mark_world_built`].
    GameStarted {
        /// Number of players in the roster.
        players: usize,
        /// Simulation buffer the server asked for.
        simulation_buffer: u32,
    },
    /// The session entered the play phase.
    EnteredPlay {
        /// The local identity.
        player_id: PlayerId,
        /// `true` if the session runs without a server.
        offline: bool,
    },
    /// A snapshot corrected at least one updater.
    Reconciled(ReconcileReport),
    /// The local tick was moved to stay near the server.
    CaughtUp(CatchUp),
}

struct Transport<A: Address> {
    reliable: Box<dyn ReliableChannel>,
    socket: Box<dyn NonBlockingSocket<A>>,
    server: A,
}

/// A client of an authoritative server, driven by the host's loop.
///
/// The session starts in [`SessionPhase::Init`]. The server's `Identification` assigns the
/// local identity, which is echoed on the unreliable channel so the server learns the
/// datagram endpoint. `GameStart` delivers the roster, the simulation buffer and the world
/// cells. Once the host has built its world it calls [`mark_world_built`], which sends
/// `ClientReady` and switches to [`SessionPhase::Play`]. [`play_offline`] skips the server
/// entirely.
///
/// In the play phase the host calls [`on_frame`] whenever it samples input and
/// [`on_fixed_step`] once per simulation tick.
///
/// [`mark_world_built`]: Self::mark_world_built
/// [`play_offline`]: Self::play_offline
/// [`on_frame`]: Self::on_frame
/// [`on_fixed_step`]: Self::on_fixed_step
pub struct ClientSession<A: Address> {
    phase: SessionPhase,
    player_id: Option<PlayerId>,
    transport: Option<Transport<A>>,
    config: PredictionConfig,
    game_start: Option<GameStart>,
    pending_updaters: Vec<Box<dyn StateUpdater>>,
    pending_simulation: Option<Box<dyn Simulation>>,
    predictor: Option<Predictor>,
    latest_input: Option<InputFrame>,
    event_queue: VecDeque<SessionEvent>,
    observer: Option<Arc<dyn ViolationObserver>>,
}

impl<A: Address> ClientSession<A> {
    pub(crate) fn new(
        config: PredictionConfig,
        updaters: Vec<Box<dyn StateUpdater>>,
        simulation: Box<dyn Simulation>,
        observer: Option<Arc<dyn ViolationObserver>>,
        reliable: Box<dyn ReliableChannel>,
        socket: Box<dyn NonBlockingSocket<A>>,
        server: A,
    ) -> Self {
        Self {
            phase: SessionPhase::Init,
            player_id: None,
            transport: Some(Transport {
                reliable,
                socket,
                server,
            }),
            config,
            game_start: None,
            pending_updaters: updaters,
            pending_simulation: Some(simulation),
            predictor: None,
            latest_input: None,
            event_queue: VecDeque::new(),
            observer,
        }
    }

    pub(crate) fn new_offline(
        config: PredictionConfig,
        updaters: Vec<Box<dyn StateUpdater>>,
        simulation: Box<dyn Simulation>,
        observer: Option<Arc<dyn ViolationObserver>>,
    ) -> Self {
        Self {
            phase: SessionPhase::Init,
            player_id: None,
            transport: None,
            config,
            game_start: None,
            pending_updaters: updaters,
            pending_simulation: Some(simulation),
            predictor: None,
            latest_input: None,
            event_queue: VecDeque::new(),
            observer,
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Identity assigned by the server, or chosen for offline play.
    #[must_use]
    pub fn player_id(&self) -> Option<PlayerId> {
        self.player_id
    }

    /// Returns `true` if the session runs without a server.
    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.transport.is_none()
    }

    /// The server's game announcement, once received.
    #[must_use]
    pub fn game_start(&self) -> Option<&GameStart> {
        self.game_start.as_ref()
    }

    /// Active prediction settings. The simulation buffer follows the server's `GameStart`.
    pub fn config(&self) -> &PredictionConfig {
        &self.config
    }

    /// The predictor; `None` until the play phase.
    #[must_use]
    pub fn predictor(&self) -> Option<&Predictor> {
        self.predictor.as_ref()
    }

    /// Next tick to simulate; `None` until the play phase.
    #[must_use]
    pub fn local_tick(&self) -> Option<Tick> {
        self.predictor.as_ref().map(Predictor::local_tick)
    }

    /// Drains the queued events.
    pub fn events(&mut self) -> std::collections::vec_deque::Drain<'_, SessionEvent> {
        self.event_queue.drain(..)
    }

    /// Processes everything received on both channels since the last call.
    ///
    /// Handshake messages are only honoured in the init phase and snapshots only in the
    /// play phase; anything else is dropped. A handshake message that fails does not stop
    /// the rest of the batch or the datagrams from being processed.
    ///
    /// # Errors
    ///
    /// The first failure of the batch: [`SyncError::InvalidConfig`] if the server's
    /// simulation buffer does not fit the configured history, or a send error while
    /// answering the handshake. Later failures are reported to the violation observer.
    pub fn poll_network(&mut self) -> Result<(), SyncError> {
        let Some(transport) = self.transport.as_mut() else {
            return Ok(());
        };
        let payloads = transport.reliable.poll();
        let mut first_error = None;
        for payload in payloads {
            match codec::decode(&payload) {
                Some(message) => {
                    let tag = message.tag();
                    if let Err(e) = self.handle_reliable(message) {
                        if first_error.is_none() {
                            first_error = Some(e);
                        } else {
                            report_violation_to!(
                                &self.observer,
                                ViolationSeverity::Error,
                                ViolationKind::Configuration,
                                "{:?} from the server rejected: {}",
                                tag,
                                e
                            );
                        }
                    }
                },
                None => {
                    report_violation_to!(
                        &self.observer,
                        ViolationSeverity::Warning,
                        ViolationKind::WireProtocol,
                        "dropping undecodable {}-byte handshake payload",
                        payload.len()
                    );
                },
            }
        }

        if let Some(transport) = self.transport.as_mut() {
            let server = transport.server.clone();
            for (from, message) in transport.socket.receive_all_messages() {
                if from != server {
                    trace!(endpoint = ?from, "ignoring datagram from unknown endpoint");
                    continue;
                }
                self.handle_datagram(message);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Records the latest sampled input; the next fixed step consumes it.
    pub fn on_frame(&mut self, input: InputFrame) {
        self.latest_input = Some(input);
    }

    /// Runs one simulation tick and sends the resulting input window to the server.
    ///
    /// Uses the input recorded by the last [`on_frame`](Self::on_frame) since the previous
    /// step, or a neutral input if there was none.
    ///
    /// # Errors
    ///
    /// [`SyncError::WrongPhase`] outside the play phase, plus anything
    /// [`poll_network`](Self::poll_network) returns.
    pub fn on_fixed_step(&mut self) -> Result<StepOutcome, SyncError> {
        self.require_phase(SessionPhase::Play)?;
        self.poll_network()?;

        let input = self.latest_input.take();
        let Some(predictor) = self.predictor.as_mut() else {
            return Err(SyncError::InternalError {
                context: "play phase without a predictor".to_owned(),
            });
        };
        let outcome = predictor.on_fixed_step(input);

        if let Some(transport) = self.transport.as_mut() {
            let message = WireMessage::InputMessage(outcome.input_message.clone());
            transport.socket.send_to(&message, &transport.server);
        }
        if let Some(report) = outcome.reconcile.as_ref().filter(|r| r.corrected_any()) {
            self.push_event(SessionEvent::Reconciled(report.clone()));
        }
        if let Some(catch_up) = outcome.catch_up {
            self.push_event(SessionEvent::CaughtUp(catch_up));
        }
        Ok(outcome)
    }

    /// Tells the server the world is built and enters the play phase.
    ///
    /// # Errors
    ///
    /// [`SyncError::WrongPhase`] outside the init phase, [`SyncError::InvalidRequest`]
    /// before both `Identification` and `GameStart` were received, or a send error.
    pub fn mark_world_built(&mut self) -> Result<(), SyncError> {
        self.require_phase(SessionPhase::Init)?;
        let Some(player_id) = self.player_id else {
            return Err(SyncError::InvalidRequest {
                info: "no identity has been assigned yet".to_owned(),
            });
        };
        let Some(players) = self.game_start.as_ref().map(|start| start.players.clone()) else {
            return Err(SyncError::InvalidRequest {
                info: "the game has not been started by the server yet".to_owned(),
            });
        };

        if let Some(transport) = self.transport.as_mut() {
            let ready = WireMessage::ClientReady { player_id }.encode()?;
            transport.reliable.send(&ready)?;
        }
        self.enter_play(player_id, players)
    }

    /// Enters the play phase without a server, with only the local player.
    ///
    /// The local player keeps the assigned identity (or 0) and its roster entry if a
    /// `GameStart` was already received. Nothing is sent on either channel afterwards.
    ///
    /// # Errors
    ///
    /// [`SyncError::WrongPhase`] outside the init phase.
    pub fn play_offline(&mut self) -> Result<(), SyncError> {
        self.require_phase(SessionPhase::Init)?;
        let player_id = self.player_id.unwrap_or_default();
        let local = self
            .game_start
            .as_ref()
            .and_then(|start| start.players.iter().find(|p| p.id == player_id).copied())
            .unwrap_or(PlayerState {
                id: player_id,
                ..PlayerState::default()
            });
        self.transport = None;
        self.player_id = Some(player_id);
        self.enter_play(player_id, vec![local])
    }

    fn enter_play(&mut self, player_id: PlayerId, players: Vec<PlayerState>) -> Result<(), SyncError> {
        self.config.validate()?;
        let simulation = self
            .pending_simulation
            .take()
            .unwrap_or_else(|| Box::new(NoopSimulation));
        let initial = StateSnapshot::new(Tick::ZERO, player_id, players);
        let mut predictor = Predictor::new(player_id, self.config, initial, simulation)?;
        for updater in self.pending_updaters.drain(..) {
            predictor.add_updater(updater);
        }
        predictor.set_violation_observer(self.observer.clone());

        self.predictor = Some(predictor);
        self.phase = SessionPhase::Play;
        let offline = self.is_offline();
        info!(player = %player_id, offline, "entering play phase");
        self.push_event(SessionEvent::EnteredPlay { player_id, offline });
        Ok(())
    }

    fn handle_reliable(&mut self, message: WireMessage) -> Result<(), SyncError> {
        if self.phase != SessionPhase::Init {
            trace!(tag = ?message.tag(), "ignoring handshake message during play");
            return Ok(());
        }
        match message {
            WireMessage::Identification { player_id } => {
                self.player_id = Some(player_id);
                if let Some(transport) = self.transport.as_mut() {
                    transport.reliable.set_identity(player_id);
                    transport
                        .socket
                        .send_to(&WireMessage::Identification { player_id }, &transport.server);
                }
                info!(player = %player_id, "identified by server");
                self.push_event(SessionEvent::Identified { player_id });
            },
            WireMessage::GameStart(start) => {
                let config = self.config.with_simulation_buffer(start.simulation_buffer);
                config.validate()?;
                self.config = config;
                info!(
                    players = start.players.len(),
                    simulation_buffer = start.simulation_buffer,
                    cells = start.cells.len(),
                    "game started"
                );
                self.push_event(SessionEvent::GameStarted {
                    players: start.players.len(),
                    simulation_buffer: start.simulation_buffer,
                });
                self.game_start = Some(start);
            },
            other => {
                debug!(tag = ?other.tag(), "unexpected message on the reliable channel");
            },
        }
        Ok(())
    }

    fn handle_datagram(&mut self, message: WireMessage) {
        match (message, self.predictor.as_ref()) {
            (WireMessage::StateSnapshot(mut snapshot), Some(predictor)) => {
                // Snapshots are compared player by player; align the owner with ours so
                // checksums of corrected states match the local ones.
                snapshot.owner = predictor.player_id();
                predictor.inbox().offer(snapshot);
            },
            (other, _) => {
                trace!(tag = ?other.tag(), phase = %self.phase, "ignoring datagram");
            },
        }
    }

    fn require_phase(&self, expected: SessionPhase) -> Result<(), SyncError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(SyncError::WrongPhase {
                expected: expected.as_str(),
                actual: self.phase.as_str(),
            })
        }
    }

    fn push_event(&mut self, event: SessionEvent) {
        if self.event_queue.len() >= MAX_EVENT_QUEUE_SIZE {
            self.event_queue.pop_front();
        }
        self.event_queue.push_back(event);
    }
}

impl<A: Address> std::fmt::Debug for ClientSession<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("phase", &self.phase)
            .field("player_id", &self.player_id)
            .field("server", &self.transport.as_ref().map(|t| &t.server))
            .field("predictor", &self.predictor)
            .finish_non_exhaustive()
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
    use crate::{Vec2, WireMessage};
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct Channel {
        inbound: Arc<Mutex<Vec<Vec<u8>>>>,
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        identity: Arc<Mutex<Option<PlayerId>>>,
    }

    impl ReliableChannel for Channel {
        fn send(&mut self, payload: &[u8]) -> Result<(), SyncError> {
            self.sent.lock().push(payload.to_vec());
            Ok(())
        }

        fn poll(&mut self) -> Vec<Vec<u8>> {
            std::mem::take(&mut *self.inbound.lock())
        }

        fn set_identity(&mut self, player: PlayerId) {
            *self.identity.lock() = Some(player);
        }
    }

    #[derive(Clone, Default)]
    struct Datagrams {
        inbound: Arc<Mutex<Vec<(u8, WireMessage)>>>,
        sent: Arc<Mutex<Vec<(u8, WireMessage)>>>,
    }

    impl NonBlockingSocket<u8> for Datagrams {
        fn send_to(&mut self, msg: &WireMessage, addr: &u8) {
            self.sent.lock().push((*addr, msg.clone()));
        }

        fn send_keep_alive(&mut self, _addr: &u8) {}

        fn receive_all_messages(&mut self) -> Vec<(u8, WireMessage)> {
            std::mem::take(&mut *self.inbound.lock())
        }
    }

    const SERVER: u8 = 1;

    fn session() -> (ClientSession<u8>, Channel, Datagrams) {
        let channel = Channel::default();
        let datagrams = Datagrams::default();
        let session = ClientSession::new(
            PredictionConfig::default(),
            Vec::new(),
            Box::new(NoopSimulation),
            None,
            Box::new(channel.clone()),
            Box::new(datagrams.clone()),
            SERVER,
        );
        (session, channel, datagrams)
    }

    fn deliver(channel: &Channel, message: &WireMessage) {
        channel.inbound.lock().push(message.encode().unwrap());
    }

    fn game_start(buffer: u32) -> WireMessage {
        WireMessage::GameStart(GameStart {
            simulation_buffer: buffer,
            players: vec![
                PlayerState::at(PlayerId::new(2), Vec2::new(1.0, 1.0), 10.0),
                PlayerState::at(PlayerId::new(5), Vec2::new(3.0, 1.0), 10.0),
            ],
            grid_width: 0,
            cells: Vec::new(),
        })
    }

    #[test]
    fn play_only_calls_fail_in_init() {
        let (mut session, _, _) = session();
        assert_eq!(
            session.on_fixed_step().unwrap_err(),
            SyncError::WrongPhase {
                expected: "play",
                actual: "init"
            }
        );
        assert!(matches!(
            session.mark_world_built(),
            Err(SyncError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn handshake_then_play() {
        let (mut session, channel, datagrams) = session();
        deliver(&channel, &WireMessage::Identification { player_id: PlayerId::new(5) });
        deliver(&channel, &game_start(3));
        session.poll_network().unwrap();

        assert_eq!(session.player_id(), Some(PlayerId::new(5)));
        assert_eq!(*channel.identity.lock(), Some(PlayerId::new(5)));
        assert_eq!(session.config().simulation_buffer, 3);
        assert_eq!(
            datagrams.sent.lock()[0],
            (SERVER, WireMessage::Identification { player_id: PlayerId::new(5) })
        );

        session.mark_world_built().unwrap();
        assert_eq!(session.phase(), SessionPhase::Play);
        let ready = codec::decode(&channel.sent.lock()[0]).unwrap();
        assert_eq!(ready, WireMessage::ClientReady { player_id: PlayerId::new(5) });

        let events: Vec<_> = session.events().collect();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[2], SessionEvent::EnteredPlay { offline: false, .. }));

        session.on_frame(InputFrame::new(Vec2::new(1.0, 0.0), false));
        let outcome = session.on_fixed_step().unwrap();
        assert_eq!(outcome.tick, Tick::new(1));
        let sent = datagrams.sent.lock();
        assert!(matches!(sent.last(), Some((SERVER, WireMessage::InputMessage(_)))));
    }

    #[test]
    fn oversized_buffer_from_server_is_rejected() {
        let (mut session, channel, _) = session();
        deliver(&channel, &game_start(40));
        assert!(matches!(
            session.poll_network(),
            Err(SyncError::InvalidConfig { .. })
        ));
        assert!(session.game_start().is_none());
    }

    #[test]
    fn offline_play_has_one_local_player_and_no_traffic() {
        let (mut session, channel, datagrams) = session();
        deliver(&channel, &game_start(4));
        session.poll_network().unwrap();
        session.play_offline().unwrap();

        assert!(session.is_offline());
        let state = session.predictor().unwrap().latest_state().unwrap();
        assert_eq!(state.players.len(), 1);
        assert_eq!(state.players[0].id, PlayerId::new(0));

        session.on_fixed_step().unwrap();
        assert!(datagrams.sent.lock().is_empty());
        assert!(channel.sent.lock().is_empty());
        assert!(matches!(
            session.play_offline(),
            Err(SyncError::WrongPhase { .. })
        ));
    }

    #[test]
    fn snapshots_from_other_endpoints_are_ignored() {
        let (mut session, channel, datagrams) = session();
        deliver(&channel, &WireMessage::Identification { player_id: PlayerId::new(2) });
        deliver(&channel, &game_start(4));
        session.poll_network().unwrap();
        session.mark_world_built().unwrap();
        for _ in 0..5 {
            session.on_fixed_step().unwrap();
        }

        let snapshot = StateSnapshot::new(Tick::new(2), PlayerId::new(9), Vec::new());
        datagrams
            .inbound
            .lock()
            .push((7, WireMessage::StateSnapshot(snapshot.clone())));
        session.poll_network().unwrap();
        assert!(session.predictor().unwrap().inbox().pending_tick().is_none());

        datagrams
            .inbound
            .lock()
            .push((SERVER, WireMessage::StateSnapshot(snapshot)));
        let outcome = session.on_fixed_step().unwrap();
        assert_eq!(outcome.reconcile.unwrap().snapshot_tick, Tick::new(2));
    }
}
