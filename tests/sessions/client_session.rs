//! Client session lifecycle over in-memory transports.

use rewind_sync::telemetry::{CollectingObserver, ViolationKind};
use rewind_sync::{
    ClientSessionBuilder, GameStart, InputFrame, PlayerId, PlayerState, RemoteInputBuffer,
    SessionEvent, SessionPhase, StateSnapshot, SyncError, Tick, Vec2, WireMessage,
};
use std::sync::Arc;

use crate::common::stubs::{CountingSimulation, PositionUpdater, StaminaUpdater, MAX_STAMINA};
use crate::common::test_utils::{MemoryNetwork, MemoryServer};

const SERVER: u8 = 0;
const CLIENT: u8 = 1;
const ME: PlayerId = PlayerId::new(3);

struct Harness {
    server: MemoryServer,
    network: MemoryNetwork,
    simulation: CountingSimulation,
    observer: Arc<CollectingObserver>,
    session: rewind_sync::ClientSession<u8>,
}

fn harness() -> Harness {
    let server = MemoryServer::new();
    let network = MemoryNetwork::new();
    let simulation = CountingSimulation::default();
    let observer = Arc::new(CollectingObserver::new());
    let session = ClientSessionBuilder::new()
        .with_updater(PositionUpdater::new(ME))
        .with_updater(StaminaUpdater::new(ME))
        .with_simulation(simulation.clone())
        .with_violation_observer(observer.clone())
        .start_session(server.client(), network.socket(CLIENT), SERVER)
        .unwrap();
    Harness {
        server,
        network,
        simulation,
        observer,
        session,
    }
}

fn roster() -> Vec<PlayerState> {
    vec![
        PlayerState::at(PlayerId::new(1), Vec2::new(4.0, 4.0), MAX_STAMINA),
        PlayerState::at(ME, Vec2::new(1.0, 2.0), MAX_STAMINA),
    ]
}

fn start_playing(h: &mut Harness) {
    h.server.send(&WireMessage::Identification { player_id: ME });
    h.server.send(&WireMessage::GameStart(GameStart {
        simulation_buffer: 4,
        players: roster(),
        grid_width: 0,
        cells: Vec::new(),
    }));
    h.session.poll_network().unwrap();
    h.session.mark_world_built().unwrap();
}

#[test]
fn handshake_announces_identity_on_both_channels() {
    let mut h = harness();
    assert_eq!(h.session.phase(), SessionPhase::Init);
    start_playing(&mut h);

    assert_eq!(h.server.client_identity(), Some(ME));
    assert_eq!(
        h.server.received(),
        vec![WireMessage::ClientReady { player_id: ME }]
    );
    let datagrams = h.network.take_for(SERVER);
    assert_eq!(
        datagrams,
        vec![(CLIENT, WireMessage::Identification { player_id: ME })]
    );

    let events: Vec<_> = h.session.events().collect();
    assert_eq!(
        events,
        vec![
            SessionEvent::Identified { player_id: ME },
            SessionEvent::GameStarted {
                players: 2,
                simulation_buffer: 4
            },
            SessionEvent::EnteredPlay {
                player_id: ME,
                offline: false
            },
        ]
    );
    let initial = h.session.predictor().unwrap().latest_state().unwrap();
    assert_eq!(initial.players, roster());
    assert_eq!(initial.owner, ME);
}

#[test]
fn handshake_messages_during_play_are_ignored() {
    let mut h = harness();
    start_playing(&mut h);
    h.server.send(&WireMessage::Identification {
        player_id: PlayerId::new(9),
    });
    h.session.poll_network().unwrap();
    assert_eq!(h.session.player_id(), Some(ME));
}

#[test]
fn server_merges_the_redundant_input_windows() {
    let mut h = harness();
    start_playing(&mut h);
    h.network.take_for(SERVER);

    let mut merged = RemoteInputBuffer::new(64).unwrap();
    for t in 1..=20u32 {
        h.session
            .on_frame(InputFrame::new(Vec2::new(t as f32, 0.0), false));
        h.session.on_fixed_step().unwrap();
        // Every other datagram is lost.
        for (_, message) in h.network.take_for(SERVER) {
            if let WireMessage::InputMessage(batch) = message {
                assert_eq!(batch.player_id, ME);
                if t % 2 == 0 {
                    merged.merge(&batch);
                }
            }
        }
    }
    for t in 1..=20u32 {
        assert!(merged.has_input(ME, Tick::new(t)), "tick {t} lost");
        assert_eq!(merged.input(ME, Tick::new(t)).movement.x, t as f32);
    }
    assert_eq!(h.simulation.count(), 20);
}

#[test]
fn missing_frame_input_becomes_neutral() {
    let mut h = harness();
    start_playing(&mut h);
    h.session.on_frame(InputFrame::new(Vec2::new(1.0, 0.0), true));
    h.session.on_fixed_step().unwrap();
    let outcome = h.session.on_fixed_step().unwrap();
    let frames = outcome.input_message.frames;
    assert!(!frames[frames.len() - 2].is_neutral());
    assert!(frames[frames.len() - 1].is_neutral());
}

#[test]
fn authoritative_snapshot_corrects_and_reports() {
    let mut h = harness();
    start_playing(&mut h);
    for _ in 0..10 {
        h.session
            .on_frame(InputFrame::new(Vec2::new(0.0, 1.0), false));
        h.session.on_fixed_step().unwrap();
    }
    h.session.events().for_each(drop);

    let mut authoritative = h
        .session
        .predictor()
        .unwrap()
        .history()
        .state(Tick::new(8))
        .unwrap()
        .clone();
    authoritative.owner = PlayerId::new(1);
    authoritative.player_mut(ME).unwrap().position = Vec2::new(-5.0, -5.0);
    h.network
        .inject(SERVER, CLIENT, WireMessage::StateSnapshot(authoritative));

    let outcome = h.session.on_fixed_step().unwrap();
    let report = outcome.reconcile.unwrap();
    assert_eq!(report.corrected.as_slice(), &[0]);
    assert_eq!(report.replayed_ticks, 3);

    let events: Vec<_> = h.session.events().collect();
    assert!(matches!(events.as_slice(), [SessionEvent::Reconciled(r)] if r.snapshot_tick == Tick::new(8)));
    let latest = h.session.predictor().unwrap().latest_state().unwrap();
    assert!(latest.player(ME).unwrap().position.x < -4.0);
    assert!(h.observer.is_empty());
}

#[test]
fn stalled_client_fast_forwards_to_the_buffer() {
    let mut h = harness();
    start_playing(&mut h);
    h.session.on_fixed_step().unwrap();

    let far_ahead = StateSnapshot::new(Tick::new(50), ME, roster());
    h.network
        .inject(SERVER, CLIENT, WireMessage::StateSnapshot(far_ahead));
    let outcome = h.session.on_fixed_step().unwrap();
    assert!(outcome.reconcile.is_none());
    assert!(matches!(
        outcome.catch_up,
        Some(rewind_sync::CatchUp::FastForward { .. })
    ));
    assert_eq!(h.session.local_tick(), Some(Tick::new(54)));
    assert!(h.observer.has_violation(ViolationKind::Reconciliation));
}

#[test]
fn rejected_game_start_does_not_swallow_the_rest_of_the_batch() {
    let mut h = harness();
    h.server.send(&WireMessage::GameStart(GameStart {
        simulation_buffer: 40,
        players: roster(),
        grid_width: 0,
        cells: Vec::new(),
    }));
    h.server.send(&WireMessage::Identification { player_id: ME });

    assert!(matches!(
        h.session.poll_network(),
        Err(SyncError::InvalidConfig { .. })
    ));
    assert_eq!(h.session.player_id(), Some(ME));
    assert_eq!(h.server.client_identity(), Some(ME));
    assert_eq!(
        h.network.take_for(SERVER),
        vec![(CLIENT, WireMessage::Identification { player_id: ME })]
    );
    let events: Vec<_> = h.session.events().collect();
    assert_eq!(events, vec![SessionEvent::Identified { player_id: ME }]);

    // A second bad start in the same batch is reported instead of returned.
    for _ in 0..2 {
        h.server.send(&WireMessage::GameStart(GameStart {
            simulation_buffer: 40,
            players: roster(),
            grid_width: 0,
            cells: Vec::new(),
        }));
    }
    assert!(h.session.poll_network().is_err());
    assert!(h.observer.has_violation(ViolationKind::Configuration));
    assert_eq!(h.session.phase(), SessionPhase::Init);
}

#[test]
fn garbage_on_the_reliable_channel_is_reported_and_dropped() {
    let mut h = harness();
    h.server.send_raw(&[0xEE, 1, 2]);
    h.session.poll_network().unwrap();
    assert_eq!(h.session.phase(), SessionPhase::Init);
    assert!(h.observer.has_violation(ViolationKind::WireProtocol));
}

#[test]
fn offline_session_needs_no_server() {
    let mut session = ClientSessionBuilder::new()
        .with_updater(PositionUpdater::new(PlayerId::new(0)))
        .start_offline::<u8>()
        .unwrap();
    assert!(session.is_offline());
    assert!(matches!(
        session.mark_world_built(),
        Err(SyncError::WrongPhase { .. })
    ));
    session.on_frame(InputFrame::new(Vec2::new(1.0, 0.0), false));
    session.on_fixed_step().unwrap();
    let state = session.predictor().unwrap().latest_state().unwrap();
    assert!(state.player(PlayerId::new(0)).unwrap().position.x > 0.0);
}
