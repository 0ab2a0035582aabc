//! A small authoritative server for `rewind-sync` clients.
//!
//! Clients connect over TCP with an identity of their choosing; the server echoes it back
//! as their assigned id. Once `--players` clients have connected it announces the game,
//! waits for every client to report ready and then runs the simulation at `--tick-rate`,
//! merging the redundant input batches clients send over UDP and answering each tick with
//! an authoritative snapshot.
//!
//! ```text
//! cargo run --example relay_server -- --players 2
//! ```

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use parking_lot::Mutex;
use rewind_sync::{
    ConnectionListener, ConnectionManager, GameStart, NonBlockingSocket, PlayerId, PlayerState,
    RemoteInputBuffer, StateSnapshot, Tick, TransportConfig, UdpNonBlockingSocket, Vec2,
    WireMessage,
};
use tracing::{debug, info, warn};
use web_time::{Duration, Instant};

const SPEED: f32 = 5.0;
const SPRINT_FACTOR: f32 = 2.0;
const MAX_STAMINA: f32 = 10.0;

#[derive(Parser)]
struct Opt {
    /// Port of the reliable (TCP) channel.
    #[arg(long, default_value_t = 9051)]
    tcp_port: u16,
    /// Port of the gameplay (UDP) channel.
    #[arg(long, default_value_t = 9052)]
    udp_port: u16,
    /// Players to wait for before starting.
    #[arg(short, long, default_value_t = 2)]
    players: usize,
    /// Simulation ticks per second.
    #[arg(long, default_value_t = 50)]
    tick_rate: u32,
    /// Ticks clients stay ahead of the server.
    #[arg(long, default_value_t = 4)]
    buffer: u32,
}

/// What the transport threads observed, drained by the main loop.
#[derive(Default)]
struct Lobby {
    connected: Vec<PlayerId>,
    ready: BTreeSet<PlayerId>,
    left: Vec<PlayerId>,
}

struct LobbyListener {
    lobby: Arc<Mutex<Lobby>>,
}

impl ConnectionListener for LobbyListener {
    fn on_connect(&self, player: PlayerId) {
        self.lobby.lock().connected.push(player);
    }

    fn on_disconnect(&self, player: PlayerId) {
        self.lobby.lock().left.push(player);
    }

    fn on_packet(&self, player: PlayerId, payload: &[u8]) {
        match rewind_sync::network::codec::decode(payload) {
            Some(WireMessage::ClientReady { player_id }) => {
                self.lobby.lock().ready.insert(player_id);
            },
            Some(other) => debug!(player = %player, tag = ?other.tag(), "ignoring reliable message"),
            None => warn!(player = %player, len = payload.len(), "undecodable reliable payload"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Lobby,
    Starting,
    Running,
}

struct Server {
    opt: Opt,
    phase: Phase,
    reliable: ConnectionManager,
    lobby: Arc<Mutex<Lobby>>,
    socket: UdpNonBlockingSocket,
    endpoints: BTreeMap<PlayerId, SocketAddr>,
    roster: BTreeSet<PlayerId>,
    inputs: RemoteInputBuffer,
    state: StateSnapshot,
}

impl Server {
    fn start(opt: Opt) -> Result<Self, Box<dyn std::error::Error>> {
        let lobby = Arc::new(Mutex::new(Lobby::default()));
        let listener = Arc::new(LobbyListener {
            lobby: Arc::clone(&lobby),
        });
        let config = TransportConfig {
            port: opt.tcp_port,
            ..TransportConfig::default()
        };
        let reliable = ConnectionManager::start(config, vec![listener])?;
        let socket = UdpNonBlockingSocket::bind_to_port(opt.udp_port)?;
        info!(tcp = %reliable.local_addr(), udp = %socket.local_addr()?, "relay server up");
        Ok(Self {
            opt,
            phase: Phase::Lobby,
            reliable,
            lobby,
            socket,
            endpoints: BTreeMap::new(),
            roster: BTreeSet::new(),
            inputs: RemoteInputBuffer::new(256)?,
            state: StateSnapshot::default(),
        })
    }

    fn send_reliable(&self, player: PlayerId, message: &WireMessage) {
        match message.encode() {
            Ok(bytes) => {
                if let Err(e) = self.reliable.send(player, &bytes) {
                    warn!(player = %player, error = %e, "reliable send failed");
                }
            },
            Err(e) => warn!(error = %e, "could not encode {:?}", message.tag()),
        }
    }

    fn drain_lobby(&mut self) {
        let (connected, left, ready) = {
            let mut lobby = self.lobby.lock();
            (
                std::mem::take(&mut lobby.connected),
                std::mem::take(&mut lobby.left),
                lobby.ready.clone(),
            )
        };

        for player in connected {
            if self.phase != Phase::Lobby {
                info!(player = %player, "late joiner ignored");
                continue;
            }
            info!(player = %player, "player joined");
            self.roster.insert(player);
            self.send_reliable(player, &WireMessage::Identification { player_id: player });
        }
        for player in left {
            info!(player = %player, "player left");
            self.roster.remove(&player);
            self.endpoints.remove(&player);
            self.inputs.remove_player(player);
            self.state.players.retain(|p| p.id != player);
        }

        if self.phase == Phase::Lobby && self.roster.len() >= self.opt.players {
            self.announce_game();
        }
        if self.phase == Phase::Starting && self.roster.iter().all(|p| ready.contains(p)) {
            info!(players = self.roster.len(), "every client is ready; running");
            self.phase = Phase::Running;
        }
    }

    fn announce_game(&mut self) {
        let players: Vec<PlayerState> = self
            .roster
            .iter()
            .enumerate()
            .map(|(slot, id)| PlayerState::at(*id, Vec2::new(slot as f32 * 2.0, 0.0), MAX_STAMINA))
            .collect();
        self.state = StateSnapshot::new(Tick::ZERO, PlayerId::default(), players.clone());
        let start = WireMessage::GameStart(GameStart {
            simulation_buffer: self.opt.buffer,
            players,
            grid_width: 0,
            cells: Vec::new(),
        });
        for player in self.roster.clone() {
            self.send_reliable(player, &start);
        }
        info!(players = self.roster.len(), buffer = self.opt.buffer, "game announced");
        self.phase = Phase::Starting;
    }

    fn receive_datagrams(&mut self) {
        for (from, message) in self.socket.receive_all_messages() {
            match message {
                WireMessage::Identification { player_id } => {
                    if self.endpoints.insert(player_id, from) != Some(from) {
                        info!(player = %player_id, endpoint = %from, "gameplay endpoint learned");
                    }
                },
                WireMessage::InputMessage(batch) => {
                    let player = batch.player_id;
                    if !self.roster.contains(&player) {
                        continue;
                    }
                    self.endpoints.entry(player).or_insert(from);
                    self.inputs.merge(&batch);
                },
                other => debug!(endpoint = %from, tag = ?other.tag(), "ignoring datagram"),
            }
        }
    }

    fn step(&mut self, delta: f32) {
        let tick = self.state.tick.next();
        for player in &mut self.state.players {
            let input = self.inputs.input(player.id, tick);
            let sprinting = input.sprinting && player.stamina > 0.0;
            let speed = if sprinting { SPEED * SPRINT_FACTOR } else { SPEED };
            player.velocity = input.movement.scaled(speed);
            player.position = player.position + player.velocity.scaled(delta);
            let change = if input.sprinting { -4.0 } else { 1.0 };
            player.stamina = (player.stamina + change * delta).clamp(0.0, MAX_STAMINA);
        }
        self.state.tick = tick;

        let snapshot = WireMessage::StateSnapshot(self.state.clone());
        for addr in self.endpoints.values() {
            self.socket.send_to(&snapshot, addr);
        }
        if tick.as_u32() % 250 == 0 {
            debug!(tick = %tick, players = self.state.players.len(), "simulated");
        }
    }

    fn run(&mut self) {
        let tick_rate = self.opt.tick_rate.max(1);
        let period = Duration::from_secs_f64(1.0 / f64::from(tick_rate));
        let delta = 1.0 / tick_rate as f32;
        let mut next_tick = Instant::now();
        loop {
            self.drain_lobby();
            self.receive_datagrams();
            let now = Instant::now();
            if now < next_tick {
                std::thread::sleep((next_tick - now).min(Duration::from_millis(2)));
                continue;
            }
            next_tick += period;
            if self.phase == Phase::Running {
                self.step(delta);
            }
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::DEBUG)
            .finish(),
    )?;
    tracing_log::LogTracer::init()?;

    let opt = Opt::parse();
    let mut server = Server::start(opt)?;
    server.run();
    Ok(())
}
