//! Reliable stream channel: identity tracking on the server, reconnection on the client.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rewind_sync::__internal::{first_frame_from_bytes, FRAME_HEADER_SIZE};
use rewind_sync::network::framing::{encode_frame, keep_alive_frame};
use rewind_sync::{
    ConnectionListener, ConnectionManager, PlayerId, ReliableChannel, ReliableClient,
    StreamFramer, TransportConfig,
};
use serial_test::serial;

use crate::common::{init_tracing, loopback, wait_until};

#[derive(Default)]
struct Recorder {
    connects: Mutex<Vec<PlayerId>>,
    disconnects: Mutex<Vec<PlayerId>>,
    packets: Mutex<Vec<(PlayerId, Vec<u8>)>>,
}

impl ConnectionListener for Recorder {
    fn on_connect(&self, player: PlayerId) {
        self.connects.lock().push(player);
    }

    fn on_disconnect(&self, player: PlayerId) {
        self.disconnects.lock().push(player);
    }

    fn on_packet(&self, player: PlayerId, payload: &[u8]) {
        self.packets.lock().push((player, payload.to_vec()));
    }
}

fn start_server() -> (ConnectionManager, Arc<Recorder>) {
    init_tracing();
    let recorder = Arc::new(Recorder::default());
    let manager =
        ConnectionManager::start(TransportConfig::local_test(), vec![recorder.clone()]).unwrap();
    (manager, recorder)
}

fn raw_connect(manager: &ConnectionManager) -> TcpStream {
    let stream = TcpStream::connect(loopback(manager.local_addr().port())).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_millis(50)))
        .unwrap();
    stream
}

/// Reads from `stream` until a frame with a payload arrives.
fn next_payload(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut framer = StreamFramer::new();
    let mut chunk = [0u8; 512];
    let mut found = None;
    wait_until(|| {
        while let Ok(Some(frame)) = framer.next_frame() {
            if !frame.is_keep_alive() {
                found = Some(frame.payload);
                return true;
            }
        }
        if let Ok(read) = stream.read(&mut chunk) {
            framer.push(&chunk[..read]);
        }
        false
    });
    found
}

#[test]
#[serial]
fn reconnect_from_new_endpoint_rehomes_without_a_second_connect() {
    let (manager, recorder) = start_server();
    let seven = PlayerId::new(7);

    let mut endpoint_a = raw_connect(&manager);
    endpoint_a
        .write_all(&encode_frame(seven, b"from a").unwrap())
        .unwrap();
    assert!(wait_until(|| recorder.packets.lock().len() == 1));
    let addr_a = endpoint_a.local_addr().unwrap();
    assert_eq!(manager.endpoint_of(seven).map(|a| a.port()), Some(addr_a.port()));

    let mut endpoint_b = raw_connect(&manager);
    endpoint_b.write_all(&keep_alive_frame(seven)).unwrap();
    let addr_b = endpoint_b.local_addr().unwrap();
    assert!(wait_until(|| {
        manager.endpoint_of(seven).map(|a| a.port()) == Some(addr_b.port())
    }));
    assert_eq!(*recorder.connects.lock(), vec![seven]);

    manager.send(seven, b"to seven").unwrap();
    assert_eq!(next_payload(&mut endpoint_b), Some(b"to seven".to_vec()));

    // The abandoned endpoint no longer owns the identity, so closing it is not a disconnect.
    drop(endpoint_a);
    std::thread::sleep(Duration::from_millis(100));
    assert!(recorder.disconnects.lock().is_empty());
    assert_eq!(manager.connected_players(), vec![seven]);

    drop(endpoint_b);
    assert!(wait_until(|| *recorder.disconnects.lock() == vec![seven]));
    assert!(manager.connected_players().is_empty());
}

#[test]
#[serial]
fn client_and_server_exchange_payloads() {
    let (manager, recorder) = start_server();
    let player = PlayerId::new(2);
    let mut client = ReliableClient::connect(
        loopback(manager.local_addr().port()),
        player,
        TransportConfig::local_test(),
    )
    .unwrap();

    client.send(b"ready").unwrap();
    assert!(wait_until(|| {
        recorder.packets.lock().as_slice() == [(player, b"ready".to_vec())]
    }));
    assert!(client.is_connected());

    manager.send(player, b"start").unwrap();
    let mut received = Vec::new();
    assert!(wait_until(|| {
        received.extend(client.poll());
        !received.is_empty()
    }));
    assert_eq!(received, vec![b"start".to_vec()]);
    assert_eq!(*recorder.connects.lock(), vec![player]);
}

#[test]
#[serial]
fn server_learns_a_changed_identity() {
    let (manager, recorder) = start_server();
    let mut client = ReliableClient::connect(
        loopback(manager.local_addr().port()),
        PlayerId::new(0),
        TransportConfig::local_test(),
    )
    .unwrap();
    assert!(wait_until(|| manager.connected_players() == vec![PlayerId::new(0)]));

    client.set_identity(PlayerId::new(4));
    client.send(b"renamed").unwrap();
    assert!(wait_until(|| {
        recorder
            .packets
            .lock()
            .contains(&(PlayerId::new(4), b"renamed".to_vec()))
    }));
    assert!(manager.endpoint_of(PlayerId::new(4)).is_some());
    assert_eq!(client.player_id(), PlayerId::new(4));
}

/// Accepts one connection on `listener` and returns the identity its opening keep-alive
/// carries.
fn accept_identity(listener: &TcpListener) -> (TcpStream, PlayerId) {
    let (mut stream, _) = listener.accept().unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut header = [0u8; FRAME_HEADER_SIZE];
    stream.read_exact(&mut header).unwrap();
    let (frame, _) = first_frame_from_bytes(&header).unwrap();
    assert!(frame.is_keep_alive());
    stream
        .set_read_timeout(Some(Duration::from_millis(50)))
        .unwrap();
    (stream, frame.sender)
}

#[test]
#[serial]
fn client_reconnects_after_the_server_drops_it() {
    init_tracing();
    let listener = TcpListener::bind(loopback(0)).unwrap();
    let server: SocketAddr = listener.local_addr().unwrap();
    let config = TransportConfig {
        connection_timeout: Duration::from_secs(5),
        ..TransportConfig::local_test()
    };
    let mut client = ReliableClient::connect(server, PlayerId::new(6), config).unwrap();

    let (first, identity) = accept_identity(&listener);
    assert_eq!(identity, PlayerId::new(6));
    drop(first);
    wait_until(|| !client.is_connected());

    // Queued while the connection is down; must still arrive on the next one.
    client.send(b"after drop").unwrap();

    let (mut second, identity) = accept_identity(&listener);
    assert_eq!(identity, PlayerId::new(6));
    assert_eq!(next_payload(&mut second), Some(b"after drop".to_vec()));
    client.shutdown();
}

#[test]
#[serial]
fn new_identity_on_an_endpoint_disconnects_the_old_one() {
    let (manager, recorder) = start_server();
    let mut stream = raw_connect(&manager);
    stream.write_all(&keep_alive_frame(PlayerId::new(1))).unwrap();
    assert!(wait_until(|| *recorder.connects.lock() == vec![PlayerId::new(1)]));

    stream.write_all(&keep_alive_frame(PlayerId::new(2))).unwrap();
    assert!(wait_until(|| recorder.connects.lock().len() == 2));
    assert_eq!(
        *recorder.connects.lock(),
        vec![PlayerId::new(1), PlayerId::new(2)]
    );
    assert_eq!(*recorder.disconnects.lock(), vec![PlayerId::new(1)]);
    assert_eq!(manager.connected_players(), vec![PlayerId::new(2)]);
}

#[test]
#[serial]
fn silent_connection_is_swept() {
    let (manager, recorder) = start_server();
    let timeout = TransportConfig::local_test().connection_timeout;
    let mut stream = raw_connect(&manager);
    stream.write_all(&keep_alive_frame(PlayerId::new(5))).unwrap();
    assert!(wait_until(|| *recorder.connects.lock() == vec![PlayerId::new(5)]));

    // The socket stays open but nothing more is written to it.
    let silent_since = std::time::Instant::now();
    assert!(wait_until(|| *recorder.disconnects.lock() == vec![PlayerId::new(5)]));
    let elapsed = silent_since.elapsed();
    assert!(elapsed >= timeout / 2, "swept after only {elapsed:?}");
    assert!(elapsed < timeout * 3, "sweep took {elapsed:?}");
    assert!(manager.connected_players().is_empty());
    drop(stream);
}

#[test]
#[serial]
fn connections_beyond_the_acceptors_wait_for_a_free_slot() {
    init_tracing();
    let recorder = Arc::new(Recorder::default());
    let config = TransportConfig {
        max_acceptors: 2,
        connection_timeout: Duration::from_secs(5),
        keepalive_interval: Duration::from_secs(1),
        ..TransportConfig::local_test()
    };
    let manager = ConnectionManager::start(config, vec![recorder.clone()]).unwrap();

    let mut first = raw_connect(&manager);
    first.write_all(&keep_alive_frame(PlayerId::new(1))).unwrap();
    let mut second = raw_connect(&manager);
    second.write_all(&keep_alive_frame(PlayerId::new(2))).unwrap();
    assert!(wait_until(|| recorder.connects.lock().len() == 2));

    // Completes in the kernel backlog but no acceptor picks it up yet.
    let mut third = raw_connect(&manager);
    third.write_all(&keep_alive_frame(PlayerId::new(3))).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(recorder.connects.lock().len(), 2);
    assert_eq!(manager.endpoint_of(PlayerId::new(3)), None);

    drop(first);
    assert!(wait_until(|| recorder.connects.lock().contains(&PlayerId::new(3))));
    assert_eq!(*recorder.disconnects.lock(), vec![PlayerId::new(1)]);
    let mut players = manager.connected_players();
    players.sort();
    assert_eq!(players, vec![PlayerId::new(2), PlayerId::new(3)]);
    drop((second, third));
}
