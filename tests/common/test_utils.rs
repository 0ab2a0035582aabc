//! Shared test utilities for integration tests.
//!
//! In-memory transports let session tests run without sockets; the loopback helpers are
//! for the tests that bind real ones (those run `#[serial]`).

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rewind_sync::{NonBlockingSocket, PlayerId, ReliableChannel, SyncError, WireMessage};

/// Interval between polls when waiting on another thread.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on how long a test waits for network activity.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Routes library logs to the test harness output. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// `127.0.0.1:port`.
pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Polls `condition` every [`POLL_INTERVAL`] until it holds or [`WAIT_TIMEOUT`] passes.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(POLL_INTERVAL);
    }
    condition()
}

/// Server side of an in-memory reliable channel.
#[derive(Debug, Clone, Default)]
pub struct MemoryServer {
    to_client: Arc<Mutex<VecDeque<Vec<u8>>>>,
    from_client: Arc<Mutex<VecDeque<Vec<u8>>>>,
    client_identity: Arc<Mutex<Option<PlayerId>>>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The client end of this channel.
    pub fn client(&self) -> MemoryChannel {
        MemoryChannel {
            server: self.clone(),
        }
    }

    pub fn send(&self, message: &WireMessage) {
        self.to_client
            .lock()
            .push_back(message.encode().expect("encodable message"));
    }

    /// Queues bytes for the client without encoding them.
    pub fn send_raw(&self, bytes: &[u8]) {
        self.to_client.lock().push_back(bytes.to_vec());
    }

    pub fn received(&self) -> Vec<WireMessage> {
        self.from_client
            .lock()
            .drain(..)
            .filter_map(|bytes| rewind_sync::network::codec::decode(&bytes))
            .collect()
    }

    pub fn client_identity(&self) -> Option<PlayerId> {
        *self.client_identity.lock()
    }
}

/// Client side of an in-memory reliable channel.
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    server: MemoryServer,
}

impl ReliableChannel for MemoryChannel {
    fn send(&mut self, payload: &[u8]) -> Result<(), SyncError> {
        self.server.from_client.lock().push_back(payload.to_vec());
        Ok(())
    }

    fn poll(&mut self) -> Vec<Vec<u8>> {
        self.server.to_client.lock().drain(..).collect()
    }

    fn set_identity(&mut self, player: PlayerId) {
        *self.server.client_identity.lock() = Some(player);
    }
}

/// In-memory datagram network keyed by small integer addresses.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inbox: Arc<Mutex<Vec<(u8, u8, WireMessage)>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A socket bound to `addr` on this network.
    pub fn socket(&self, addr: u8) -> MemorySocket {
        MemorySocket {
            addr,
            network: self.clone(),
        }
    }

    /// Delivers `message` to `to` as if `from` had sent it.
    pub fn inject(&self, from: u8, to: u8, message: WireMessage) {
        self.inbox.lock().push((from, to, message));
    }

    /// Removes and returns everything addressed to `addr`.
    pub fn take_for(&self, addr: u8) -> Vec<(u8, WireMessage)> {
        let mut inbox = self.inbox.lock();
        let mut taken = Vec::new();
        inbox.retain(|(from, to, message)| {
            if *to == addr {
                taken.push((*from, message.clone()));
                false
            } else {
                true
            }
        });
        taken
    }
}

#[derive(Debug, Clone)]
pub struct MemorySocket {
    addr: u8,
    network: MemoryNetwork,
}

impl NonBlockingSocket<u8> for MemorySocket {
    fn send_to(&mut self, msg: &WireMessage, addr: &u8) {
        self.network.inject(self.addr, *addr, msg.clone());
    }

    fn send_keep_alive(&mut self, _addr: &u8) {}

    fn receive_all_messages(&mut self) -> Vec<(u8, WireMessage)> {
        self.network.take_for(self.addr)
    }
}
