//! Server side of the reliable stream channel.
//!
//! [`ConnectionManager`] listens on a TCP port and serves up to
//! [`max_acceptors`](TransportConfig::max_acceptors) connections at once. Every frame a
//! client sends carries its [`PlayerId`]; the first frame from an identity fires
//! [`ConnectionListener::on_connect`], and a frame from a known identity on a new endpoint
//! silently moves that identity there. Payloads addressed to an identity always go to its
//! current endpoint.
//!
//! Threads:
//!
//! - one acceptor per slot: accepts a connection, runs its receive and send threads, and
//!   accepts the next one once both have finished,
//! - per connection, a receive thread that reassembles frames and a send thread that waits
//!   on a shared condition variable for queued payloads,
//! - one maintenance thread that drops silent connections and queues keep-alives.
//!
//! Listener callbacks run on the receive threads, never while the shared state is locked,
//! so a listener may call [`ConnectionManager::send`] from inside a callback.

use std::collections::{BTreeMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace};
use web_time::{Duration, Instant};

use crate::network::endpoint_registry::{EndpointRegistry, Identified};
use crate::network::framing::{encode_frame_into, StreamFrame, StreamFramer, MAX_STREAM_PAYLOAD};
use crate::sessions::config::TransportConfig;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{debug_check_invariants, report_violation, PlayerId, SyncError};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Receives connection events from a [`ConnectionManager`].
///
/// Listeners are handed to [`ConnectionManager::start`] and fixed for its lifetime. All
/// methods are called from transport threads.
pub trait ConnectionListener: Send + Sync {
    /// An identity sent its first frame.
    fn on_connect(&self, _player: PlayerId) {}

    /// An identity's connection closed, failed, or went silent.
    fn on_disconnect(&self, _player: PlayerId) {}

    /// An identity delivered a non-empty payload.
    fn on_packet(&self, player: PlayerId, payload: &[u8]);
}

struct Connection {
    stream: TcpStream,
    outbound: VecDeque<Vec<u8>>,
    last_seen: Instant,
    active: bool,
}

#[derive(Default)]
struct ServerState {
    registry: EndpointRegistry<SocketAddr>,
    connections: BTreeMap<SocketAddr, Connection>,
}

impl ServerState {
    fn enqueue(&mut self, player: PlayerId, payload: Vec<u8>) -> Result<(), SyncError> {
        let endpoint = *self
            .registry
            .endpoint_of(player)
            .ok_or(SyncError::UnknownPlayer { player })?;
        match self.connections.get_mut(&endpoint) {
            Some(connection) if connection.active => {
                connection.outbound.push_back(payload);
                Ok(())
            },
            _ => Err(SyncError::SocketError {
                context: format!("connection of player {player} at {endpoint} is closed"),
            }),
        }
    }
}

enum Event {
    Connect(PlayerId),
    Disconnect(PlayerId),
    Packet(PlayerId, Vec<u8>),
}

struct Shared {
    config: TransportConfig,
    listeners: Vec<Arc<dyn ConnectionListener>>,
    state: Mutex<ServerState>,
    send_signal: Condvar,
    shutdown: AtomicBool,
}

impl Shared {
    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn dispatch(&self, events: Vec<Event>) {
        for event in events {
            for listener in &self.listeners {
                match &event {
                    Event::Connect(player) => listener.on_connect(*player),
                    Event::Disconnect(player) => listener.on_disconnect(*player),
                    Event::Packet(player, payload) => listener.on_packet(*player, payload),
                }
            }
        }
    }
}

/// Reliable, reconnect-tolerant server channel.
///
/// Dropping the manager shuts it down and joins its threads.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    threads: Vec<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Binds `0.0.0.0:config.port` and starts serving.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidConfig`] for an invalid `config`, [`SyncError::SocketError`] if
    /// the port cannot be bound or a thread cannot be spawned.
    pub fn start(
        config: TransportConfig,
        listeners: Vec<Arc<dyn ConnectionListener>>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            config,
            listeners,
            state: Mutex::new(ServerState::default()),
            send_signal: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let mut manager = Self {
            shared: Arc::clone(&shared),
            local_addr,
            threads: Vec::with_capacity(config.max_acceptors + 1),
        };

        for slot in 0..config.max_acceptors {
            let listener = listener.try_clone()?;
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("rewind-acceptor-{slot}"))
                .spawn(move || accept_loop(&shared, &listener))?;
            manager.threads.push(handle);
        }
        let maintenance_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("rewind-maintenance".to_owned())
            .spawn(move || maintenance_loop(&maintenance_shared))?;
        manager.threads.push(handle);

        info!(addr = %local_addr, acceptors = config.max_acceptors, "reliable channel listening");
        Ok(manager)
    }

    /// The address the server is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queues `payload` for `player`'s current endpoint.
    ///
    /// # Errors
    ///
    /// [`SyncError::UnknownPlayer`] if the identity never connected or has disconnected,
    /// [`SyncError::SocketError`] if its connection is closing, and
    /// [`SyncError::InvalidRequest`] for payloads larger than a stream frame can carry.
    pub fn send(&self, player: PlayerId, payload: &[u8]) -> Result<(), SyncError> {
        if payload.len() > MAX_STREAM_PAYLOAD {
            return Err(SyncError::InvalidRequest {
                info: format!(
                    "payload of {} bytes exceeds the {MAX_STREAM_PAYLOAD}-byte frame limit",
                    payload.len()
                ),
            });
        }
        self.shared.state.lock().enqueue(player, payload.to_vec())?;
        self.shared.send_signal.notify_all();
        Ok(())
    }

    /// Queues `payload` for every connected identity. Returns how many it was queued for.
    pub fn broadcast(&self, payload: &[u8]) -> usize {
        let players = self.connected_players();
        players
            .into_iter()
            .filter(|player| self.send(*player, payload).is_ok())
            .count()
    }

    /// Identities with a live connection, in ascending order.
    #[must_use]
    pub fn connected_players(&self) -> Vec<PlayerId> {
        let state = self.shared.state.lock();
        state
            .registry
            .entries()
            .filter(|(_, endpoint)| {
                state
                    .connections
                    .get(*endpoint)
                    .is_some_and(|connection| connection.active)
            })
            .map(|(player, _)| player)
            .collect()
    }

    /// Current endpoint of `player`, if connected.
    #[must_use]
    pub fn endpoint_of(&self, player: PlayerId) -> Option<SocketAddr> {
        self.shared.state.lock().registry.endpoint_of(player).copied()
    }

    /// Stops accepting, closes every connection and joins all threads.
    pub fn shutdown(&mut self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut state = self.shared.state.lock();
            for connection in state.connections.values_mut() {
                connection.active = false;
                let _ = connection.stream.shutdown(Shutdown::Both);
            }
        }
        self.shared.send_signal.notify_all();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::InternalError,
                    "reliable channel thread panicked"
                );
            }
        }
        info!(addr = %self.local_addr, "reliable channel stopped");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("local_addr", &self.local_addr)
            .field("config", &self.shared.config)
            .field("listeners", &self.shared.listeners.len())
            .finish_non_exhaustive()
    }
}

fn accept_loop(shared: &Arc<Shared>, listener: &TcpListener) {
    while !shared.is_shutting_down() {
        match listener.accept() {
            Ok((stream, endpoint)) => serve_connection(shared, stream, endpoint),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            },
            Err(e) => {
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::Transport,
                    "accept failed: {}",
                    e
                );
                thread::sleep(ACCEPT_POLL_INTERVAL);
            },
        }
    }
}

/// Runs one connection to completion on the calling acceptor thread.
fn serve_connection(shared: &Arc<Shared>, stream: TcpStream, endpoint: SocketAddr) {
    debug!(endpoint = %endpoint, "accepted connection");
    let streams = stream
        .set_nonblocking(false)
        .and_then(|()| stream.set_read_timeout(Some(shared.config.connection_timeout)))
        .and_then(|()| stream.set_nodelay(true))
        .and_then(|()| Ok((stream.try_clone()?, stream.try_clone()?)));
    let (recv_stream, send_stream) = match streams {
        Ok(pair) => pair,
        Err(e) => {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::Transport,
                "could not configure connection from {}: {}",
                endpoint,
                e
            );
            return;
        },
    };

    shared.state.lock().connections.insert(
        endpoint,
        Connection {
            stream,
            outbound: VecDeque::new(),
            last_seen: Instant::now(),
            active: true,
        },
    );

    let send_shared = Arc::clone(shared);
    let sender = thread::Builder::new()
        .name(format!("rewind-send-{endpoint}"))
        .spawn(move || send_loop(&send_shared, send_stream, endpoint));
    match sender {
        Ok(sender) => {
            receive_loop(shared, recv_stream, endpoint);
            if sender.join().is_err() {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::InternalError,
                    "send thread for {} panicked",
                    endpoint
                );
            }
        },
        Err(e) => {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Transport,
                "could not spawn send thread for {}: {}",
                endpoint,
                e
            );
        },
    }

    let released = {
        let mut state = shared.state.lock();
        if let Some(connection) = state.connections.remove(&endpoint) {
            let _ = connection.stream.shutdown(Shutdown::Both);
        }
        let released = state.registry.release_endpoint(&endpoint);
        debug_check_invariants!(state.registry, "after releasing endpoint");
        released
    };
    match released {
        Some(player) => {
            info!(player = %player, endpoint = %endpoint, "player disconnected");
            shared.dispatch(vec![Event::Disconnect(player)]);
        },
        None => debug!(endpoint = %endpoint, "closed connection without a live identity"),
    }
}

/// The receive half of [`serve_connection`].
fn receive_loop(shared: &Arc<Shared>, mut stream: TcpStream, endpoint: SocketAddr) {
    let mut framer = StreamFramer::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    loop {
        if shared.is_shutting_down() || !is_active(shared, endpoint) {
            break;
        }
        let read = match stream.read(&mut chunk) {
            Ok(0) => {
                debug!(endpoint = %endpoint, "peer closed the stream");
                break;
            },
            Ok(read) => read,
            // The liveness sweep decides when silence becomes a disconnect.
            Err(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                continue;
            },
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::Transport,
                    "read from {} failed: {}",
                    endpoint,
                    e
                );
                break;
            },
        };

        framer.push(chunk.get(..read).unwrap_or_default());
        let mut frames = Vec::new();
        let poisoned = loop {
            match framer.next_frame() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break false,
                Err(e) => {
                    report_violation!(
                        ViolationSeverity::Error,
                        ViolationKind::WireProtocol,
                        "dropping connection from {}: {}",
                        endpoint,
                        e
                    );
                    break true;
                },
            }
        };
        framer.compact();

        let events = record_frames(shared, endpoint, frames);
        shared.dispatch(events);
        if poisoned {
            break;
        }
    }

    if let Some(connection) = shared.state.lock().connections.get_mut(&endpoint) {
        connection.active = false;
    }
    shared.send_signal.notify_all();
}

/// Refreshes liveness, applies identity changes and turns frames into listener events.
fn record_frames(shared: &Shared, endpoint: SocketAddr, frames: Vec<StreamFrame>) -> Vec<Event> {
    let mut events = Vec::new();
    let mut state = shared.state.lock();
    if let Some(connection) = state.connections.get_mut(&endpoint) {
        connection.last_seen = Instant::now();
    }
    for frame in frames {
        let player = frame.sender;
        let identified = state.registry.identify(player, endpoint);
        if let Some(displaced) = identified.displaced() {
            info!(player = %displaced, endpoint = %endpoint, by = %player, "identity displaced");
            events.push(Event::Disconnect(displaced));
        }
        match identified {
            Identified::New { .. } => {
                info!(player = %player, endpoint = %endpoint, "player connected");
                events.push(Event::Connect(player));
            },
            Identified::Rehomed { previous, .. } => {
                info!(player = %player, from = %previous, to = %endpoint, "player re-homed");
            },
            Identified::Known => {},
        }
        if frame.is_keep_alive() {
            trace!(player = %player, "keep-alive");
        } else {
            events.push(Event::Packet(player, frame.payload));
        }
    }
    debug_check_invariants!(state.registry, "after identifying frames");
    events
}

fn is_active(shared: &Shared, endpoint: SocketAddr) -> bool {
    shared
        .state
        .lock()
        .connections
        .get(&endpoint)
        .is_some_and(|connection| connection.active)
}

fn send_loop(shared: &Arc<Shared>, mut stream: TcpStream, endpoint: SocketAddr) {
    let timeout = shared.config.connection_timeout;
    let mut wire = Vec::new();
    loop {
        let (batch, identity) = {
            let mut state = shared.state.lock();
            loop {
                if shared.is_shutting_down() {
                    return;
                }
                let identity = state.registry.player_at(&endpoint);
                let Some(connection) = state.connections.get_mut(&endpoint) else {
                    return;
                };
                if !connection.active {
                    return;
                }
                if !connection.outbound.is_empty() {
                    // Frames are stamped with the identity now living at this endpoint;
                    // payloads queued before identification are dropped with it.
                    let batch: Vec<Vec<u8>> = connection.outbound.drain(..).collect();
                    break (batch, identity);
                }
                shared.send_signal.wait_for(&mut state, timeout);
            }
        };
        let Some(identity) = identity else {
            continue;
        };

        wire.clear();
        for payload in &batch {
            if let Err(e) = encode_frame_into(identity, payload, &mut wire) {
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::WireProtocol,
                    "not sending to {}: {}",
                    identity,
                    e
                );
            }
        }
        if let Err(e) = stream.write_all(&wire).and_then(|()| stream.flush()) {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::Transport,
                "write to {} failed: {}",
                endpoint,
                e
            );
            if let Some(connection) = shared.state.lock().connections.get_mut(&endpoint) {
                connection.active = false;
                let _ = connection.stream.shutdown(Shutdown::Both);
            }
            return;
        }
    }
}

fn maintenance_loop(shared: &Arc<Shared>) {
    let config = shared.config;
    let tick = config
        .keepalive_interval
        .min(config.connection_timeout)
        .checked_div(2)
        .unwrap_or(config.keepalive_interval);
    let mut last_keepalive = Instant::now();
    let mut last_sweep = Instant::now();

    while !shared.is_shutting_down() {
        thread::sleep(tick);
        let now = Instant::now();

        if now.duration_since(last_keepalive) >= config.keepalive_interval {
            last_keepalive = now;
            let mut state = shared.state.lock();
            let players: Vec<PlayerId> = state.registry.players().collect();
            for player in players {
                let _ = state.enqueue(player, Vec::new());
            }
            drop(state);
            shared.send_signal.notify_all();
        }

        if now.duration_since(last_sweep) >= config.connection_timeout {
            last_sweep = now;
            let mut state = shared.state.lock();
            for (endpoint, connection) in &mut state.connections {
                if connection.active
                    && now.duration_since(connection.last_seen) > config.connection_timeout
                {
                    debug!(endpoint = %endpoint, "connection timed out");
                    connection.active = false;
                    // Unblocks the receive thread; teardown happens on the acceptor.
                    let _ = connection.stream.shutdown(Shutdown::Both);
                }
            }
            drop(state);
            shared.send_signal.notify_all();
        }
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
    use crate::network::framing::{encode_frame, first_frame_from_bytes};
    use std::net::Ipv4Addr;

    #[derive(Default)]
    struct Recorder {
        connects: Mutex<Vec<PlayerId>>,
        packets: Mutex<Vec<(PlayerId, Vec<u8>)>>,
    }

    impl ConnectionListener for Recorder {
        fn on_connect(&self, player: PlayerId) {
            self.connects.lock().push(player);
        }

        fn on_packet(&self, player: PlayerId, payload: &[u8]) {
            self.packets.lock().push((player, payload.to_vec()));
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    fn connect(manager: &ConnectionManager) -> TcpStream {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, manager.local_addr().port()));
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        stream
    }

    #[test]
    #[cfg(not(miri))]
    fn identifies_and_delivers_packets() {
        let recorder = Arc::new(Recorder::default());
        let manager =
            ConnectionManager::start(TransportConfig::local_test(), vec![recorder.clone()])
                .unwrap();

        let mut client = connect(&manager);
        client
            .write_all(&encode_frame(PlayerId::new(3), b"hi").unwrap())
            .unwrap();

        assert!(wait_until(|| recorder.packets.lock().len() == 1));
        assert_eq!(*recorder.connects.lock(), vec![PlayerId::new(3)]);
        assert_eq!(recorder.packets.lock()[0], (PlayerId::new(3), b"hi".to_vec()));
        assert_eq!(manager.connected_players(), vec![PlayerId::new(3)]);
    }

    #[test]
    #[cfg(not(miri))]
    fn send_reaches_client_stamped_with_its_identity() {
        let manager = ConnectionManager::start(TransportConfig::local_test(), vec![]).unwrap();
        let mut client = connect(&manager);
        client
            .write_all(&encode_frame(PlayerId::new(5), b"hello").unwrap())
            .unwrap();
        assert!(wait_until(|| manager.connected_players() == vec![PlayerId::new(5)]));

        manager.send(PlayerId::new(5), b"welcome").unwrap();

        let mut framer = StreamFramer::new();
        let mut chunk = [0u8; 256];
        let frame = loop {
            if let Some(frame) = framer.next_frame().unwrap() {
                if !frame.is_keep_alive() {
                    break frame;
                }
                continue;
            }
            let read = client.read(&mut chunk).unwrap();
            assert!(read > 0, "server closed the stream");
            framer.push(&chunk[..read]);
        };
        assert_eq!(frame.sender, PlayerId::new(5));
        assert_eq!(frame.payload, b"welcome");
    }

    #[test]
    #[cfg(not(miri))]
    fn unknown_player_is_an_error() {
        let manager = ConnectionManager::start(TransportConfig::local_test(), vec![]).unwrap();
        assert!(matches!(
            manager.send(PlayerId::new(99), b"x"),
            Err(SyncError::UnknownPlayer { .. })
        ));
    }

    #[test]
    #[cfg(not(miri))]
    fn keep_alives_flow_to_known_identities() {
        let manager = ConnectionManager::start(TransportConfig::local_test(), vec![]).unwrap();
        let mut client = connect(&manager);
        client
            .write_all(&encode_frame(PlayerId::new(1), &[]).unwrap())
            .unwrap();

        let mut received = Vec::new();
        let mut chunk = [0u8; 64];
        let got_keep_alive = wait_until(|| {
            if let Ok(read) = client.read(&mut chunk) {
                received.extend_from_slice(&chunk[..read]);
            }
            first_frame_from_bytes(&received).is_some_and(|(frame, _)| frame.is_keep_alive())
        });
        assert!(got_keep_alive);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = TransportConfig {
            max_acceptors: 0,
            ..TransportConfig::local_test()
        };
        assert!(matches!(
            ConnectionManager::start(config, vec![]),
            Err(SyncError::InvalidConfig { .. })
        ));
    }
}
