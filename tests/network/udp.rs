//! A client session driving real UDP sockets on loopback.

use std::net::SocketAddr;

use rewind_sync::{
    ClientSession, ClientSessionBuilder, GameStart, InputFrame, NonBlockingSocket, PlayerId,
    PlayerState, ReconcileReport, Tick, UdpNonBlockingSocket, Vec2, WireMessage,
};
use serial_test::serial;

use crate::common::stubs::{PositionUpdater, MAX_STAMINA};
use crate::common::test_utils::MemoryServer;
use crate::common::{init_tracing, loopback, wait_until};

const ME: PlayerId = PlayerId::new(3);

struct Rig {
    reliable: MemoryServer,
    server: UdpNonBlockingSocket,
    session: ClientSession<SocketAddr>,
}

fn rig() -> Rig {
    init_tracing();
    let server = UdpNonBlockingSocket::bind_to_port(0).unwrap();
    let client = UdpNonBlockingSocket::bind_to_port(0).unwrap();
    let server_addr = loopback(server.local_addr().unwrap().port());
    let reliable = MemoryServer::new();
    let mut session = ClientSessionBuilder::new()
        .with_updater(PositionUpdater::new(ME))
        .start_session(reliable.client(), client, server_addr)
        .unwrap();

    reliable.send(&WireMessage::Identification { player_id: ME });
    reliable.send(&WireMessage::GameStart(GameStart {
        simulation_buffer: 4,
        players: vec![PlayerState::at(ME, Vec2::ZERO, MAX_STAMINA)],
        grid_width: 0,
        cells: Vec::new(),
    }));
    session.poll_network().unwrap();
    session.mark_world_built().unwrap();
    Rig {
        reliable,
        server,
        session,
    }
}

/// Collects datagrams on `socket` until `done` is satisfied or the wait times out.
fn collect_until(
    socket: &mut UdpNonBlockingSocket,
    mut done: impl FnMut(&[(SocketAddr, WireMessage)]) -> bool,
) -> Vec<(SocketAddr, WireMessage)> {
    let mut received = Vec::new();
    wait_until(|| {
        received.extend(socket.receive_all_messages());
        done(&received)
    });
    received
}

/// Steps the session until a step reports a reconciliation or the wait times out.
fn step_until_reconciled(session: &mut ClientSession<SocketAddr>) -> Option<ReconcileReport> {
    let mut report = None;
    wait_until(|| {
        report = session.on_fixed_step().unwrap().reconcile;
        report.is_some()
    });
    report
}

#[test]
#[serial]
fn identification_and_inputs_reach_the_server() {
    let mut rig = rig();
    for _ in 0..5 {
        rig.session
            .on_frame(InputFrame::new(Vec2::new(1.0, 0.0), false));
        rig.session.on_fixed_step().unwrap();
    }

    let received = collect_until(&mut rig.server, |msgs| {
        msgs.iter().any(|(_, m)| {
            matches!(m, WireMessage::InputMessage(batch) if batch.frames.len() == 5)
        })
    });
    assert!(matches!(
        received.first(),
        Some((_, WireMessage::Identification { player_id: ME }))
    ));
    let newest = received
        .iter()
        .filter_map(|(_, m)| match m {
            WireMessage::InputMessage(batch) => Some(batch),
            _ => None,
        })
        .last()
        .unwrap();
    assert_eq!(newest.player_id, ME);
    assert_eq!(newest.start_tick, Tick::new(1));
    assert!(newest.frames.iter().all(|f| f.movement.x == 1.0));
    assert_eq!(
        rig.reliable.received(),
        vec![WireMessage::ClientReady { player_id: ME }]
    );
}

#[test]
#[serial]
fn snapshot_from_the_server_corrects_the_client() {
    let mut rig = rig();
    for _ in 0..10 {
        rig.session.on_fixed_step().unwrap();
    }
    let received = collect_until(&mut rig.server, |msgs| !msgs.is_empty());
    let client_addr = received[0].0;

    let mut snapshot = rig
        .session
        .predictor()
        .unwrap()
        .history()
        .state(Tick::new(8))
        .unwrap()
        .clone();
    snapshot.player_mut(ME).unwrap().position = Vec2::new(20.0, 0.0);
    rig.server
        .send_to(&WireMessage::StateSnapshot(snapshot), &client_addr);

    let report = step_until_reconciled(&mut rig.session).unwrap();
    assert_eq!(report.snapshot_tick, Tick::new(8));
    assert_eq!(report.corrected.as_slice(), &[0]);
    let latest = rig.session.predictor().unwrap().latest_state().unwrap();
    assert_eq!(latest.player(ME).unwrap().position, Vec2::new(20.0, 0.0));
}

#[test]
#[serial]
fn datagrams_from_strangers_are_ignored() {
    let mut rig = rig();
    for _ in 0..10 {
        rig.session.on_fixed_step().unwrap();
    }
    let received = collect_until(&mut rig.server, |msgs| !msgs.is_empty());
    let client_addr = received[0].0;

    let mut stranger = UdpNonBlockingSocket::bind_to_port(0).unwrap();
    let mut snapshot = rig
        .session
        .predictor()
        .unwrap()
        .history()
        .state(Tick::new(8))
        .unwrap()
        .clone();
    snapshot.player_mut(ME).unwrap().position = Vec2::new(-20.0, 0.0);
    stranger.send_to(&WireMessage::StateSnapshot(snapshot), &client_addr);
    stranger.send_keep_alive(&client_addr);

    // Give the datagram time to land, then make sure stepping never acts on it.
    std::thread::sleep(std::time::Duration::from_millis(100));
    for _ in 0..5 {
        assert!(rig.session.on_fixed_step().unwrap().reconcile.is_none());
    }
    let latest = rig.session.predictor().unwrap().latest_state().unwrap();
    assert_eq!(latest.player(ME).unwrap().position, Vec2::ZERO);
}
