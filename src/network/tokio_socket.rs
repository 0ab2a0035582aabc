//! Tokio adapter for the unreliable gameplay channel.
//!
//! [`TokioUdpSocket`] wraps a [`tokio::net::UdpSocket`] and implements [`NonBlockingSocket`](crate::NonBlockingSocket)
//! so a [`ClientSession`](crate::ClientSession) can live inside an async application. The
//! trait methods use `try_send_to`/`try_recv_from` and never block; the async helpers
//! ([`recv_all`](TokioUdpSocket::recv_all), [`send_to_async`](TokioUdpSocket::send_to_async))
//! wait on readiness first.
//!
//! ```no_run
//! use rewind_sync::TokioUdpSocket;
//!
//! # async fn example() -> std::io::Result<()> {
//! let mut socket = TokioUdpSocket::bind_to_port(0).await?;
//! for (from, msg) in socket.recv_all().await {
//!     println!("{from}: {:?}", msg.tag());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Requires the `tokio` feature.

use std::io::ErrorKind;
use std::net::SocketAddr;

use tokio::net::UdpSocket;

use crate::network::codec::{self, WireMessage};
use crate::network::framing::is_keep_alive_datagram;
use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::NonBlockingSocket;

const RECV_BUFFER_SIZE: usize = 4096;

/// Largest datagram that avoids IPv4 fragmentation on any path.
const IDEAL_MAX_UDP_PACKET_SIZE: usize = 508;

/// A Tokio-backed UDP socket for the unreliable channel.
///
/// Filters keep-alives and undecodable datagrams exactly like
/// [`UdpNonBlockingSocket`](crate::UdpNonBlockingSocket).
#[derive(Debug)]
pub struct TokioUdpSocket {
    socket: UdpSocket,
    recv_buffer: [u8; RECV_BUFFER_SIZE],
    send_buffer: Vec<u8>,
}

impl TokioUdpSocket {
    /// Wraps an already bound Tokio socket.
    #[must_use]
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            recv_buffer: [0; RECV_BUFFER_SIZE],
            send_buffer: Vec::with_capacity(IDEAL_MAX_UDP_PACKET_SIZE),
        }
    }

    /// Binds a new socket to `0.0.0.0:port`. Use port 0 to let the OS pick.
    pub async fn bind_to_port(port: u16) -> Result<Self, std::io::Error> {
        UdpSocket::bind((std::net::Ipv4Addr::UNSPECIFIED, port))
            .await
            .map(Self::new)
    }

    /// The address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }

    /// The wrapped Tokio socket.
    #[must_use]
    pub fn inner(&self) -> &UdpSocket {
        &self.socket
    }

    /// Waits until the socket is readable, then drains every pending message.
    pub async fn recv_all(&mut self) -> Vec<(SocketAddr, WireMessage)> {
        match self.socket.readable().await {
            Ok(()) => self.receive_all_messages(),
            Err(_) => Vec::new(),
        }
    }

    /// Resolves once a send would not block.
    pub async fn wait_writable(&self) -> Result<(), std::io::Error> {
        self.socket.writable().await
    }

    /// Encodes `msg` and sends it once the socket is writable.
    pub async fn send_to_async(&mut self, msg: &WireMessage, addr: &SocketAddr) {
        if !self.encode(msg) {
            return;
        }
        warn_if_oversized(self.send_buffer.len());
        if let Err(e) = self.socket.send_to(&self.send_buffer, *addr).await {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::Transport,
                "datagram to {} not sent: {}",
                addr,
                e
            );
        }
    }

    fn encode(&mut self, msg: &WireMessage) -> bool {
        self.send_buffer.clear();
        match msg.encode_append(&mut self.send_buffer) {
            Ok(_) => true,
            Err(e) => {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::WireProtocol,
                    "could not encode {:?}: {}",
                    msg.tag(),
                    e
                );
                false
            },
        }
    }

    /// Non-blocking send; a socket that is not ready drops the datagram with a warning.
    fn try_send(&self, buf: &[u8], addr: &SocketAddr) {
        warn_if_oversized(buf.len());
        match self.socket.try_send_to(buf, *addr) {
            Ok(_) => {},
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::Transport,
                    "socket busy, datagram to {} dropped",
                    addr
                );
            },
            Err(e) => {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::Transport,
                    "datagram to {} not sent: {}",
                    addr,
                    e
                );
            },
        }
    }
}

fn warn_if_oversized(len: usize) {
    if len > IDEAL_MAX_UDP_PACKET_SIZE {
        report_violation!(
            ViolationSeverity::Warning,
            ViolationKind::WireProtocol,
            "{}-byte datagram exceeds the {}-byte fragmentation limit",
            len,
            IDEAL_MAX_UDP_PACKET_SIZE
        );
    }
}

impl NonBlockingSocket<SocketAddr> for TokioUdpSocket {
    fn send_to(&mut self, msg: &WireMessage, addr: &SocketAddr) {
        if self.encode(msg) {
            self.try_send(&self.send_buffer, addr);
        }
    }

    fn send_keep_alive(&mut self, addr: &SocketAddr) {
        self.try_send(&[], addr);
    }

    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, WireMessage)> {
        let mut received = Vec::new();
        loop {
            match self.socket.try_recv_from(&mut self.recv_buffer) {
                Ok((len, src_addr)) => {
                    let Some(datagram) = self.recv_buffer.get(..len) else {
                        continue;
                    };
                    if is_keep_alive_datagram(datagram) {
                        continue;
                    }
                    if let Some(msg) = codec::decode(datagram) {
                        received.push((src_addr, msg));
                    } else {
                        tracing::trace!(endpoint = %src_addr, "dropping undecodable datagram");
                    }
                },
                Err(err) => match err.kind() {
                    ErrorKind::WouldBlock => return received,
                    ErrorKind::ConnectionReset => {},
                    kind => {
                        report_violation!(
                            ViolationSeverity::Error,
                            ViolationKind::Transport,
                            "gameplay socket receive failed ({:?}): {}",
                            kind,
                            err
                        );
                        return received;
                    },
                },
            }
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
    use crate::PlayerId;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn loopback(socket: &TokioUdpSocket) -> SocketAddr {
        SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            socket.local_addr().unwrap().port(),
        )
    }

    #[tokio::test]
    async fn async_send_and_recv_all() {
        let mut a = TokioUdpSocket::bind_to_port(0).await.unwrap();
        let mut b = TokioUdpSocket::bind_to_port(0).await.unwrap();
        let target = loopback(&b);

        a.send_keep_alive(&target);
        let msg = WireMessage::Identification {
            player_id: PlayerId::new(4),
        };
        a.send_to_async(&msg, &target).await;

        let mut received = Vec::new();
        for _ in 0..20 {
            let batch = tokio::time::timeout(Duration::from_millis(100), b.recv_all())
                .await
                .unwrap_or_default();
            received.extend(batch.into_iter().map(|(_, m)| m));
            if !received.is_empty() {
                break;
            }
        }
        assert_eq!(received, vec![msg]);
    }

    #[tokio::test]
    async fn sync_receive_on_idle_socket_is_empty() {
        let mut socket = TokioUdpSocket::bind_to_port(0).await.unwrap();
        assert!(socket.receive_all_messages().is_empty());
    }
}
