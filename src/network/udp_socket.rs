use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
};

use crate::network::codec::{self, WireMessage};
use crate::network::framing::is_keep_alive_datagram;
use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::NonBlockingSocket;

const RECV_BUFFER_SIZE: usize = 4096;
/// Largest payload guaranteed to pass any IPv4 path without fragmentation
/// (576-byte minimum reassembly size minus IP and UDP headers).
const IDEAL_MAX_UDP_PACKET_SIZE: usize = 508;

/// A non-blocking UDP socket for the unreliable gameplay channel. Listens on 0.0.0.0 at a
/// given port.
///
/// One [`WireMessage`] travels per datagram. Empty datagrams are keep-alives and are
/// never returned from [`receive_all_messages`](NonBlockingSocket::receive_all_messages);
/// neither is anything that fails to decode.
///
/// The encode buffer is reused across sends so the hot path does not allocate once it has
/// grown to the largest message sent.
#[derive(Debug)]
pub struct UdpNonBlockingSocket {
    socket: UdpSocket,
    recv_buffer: [u8; RECV_BUFFER_SIZE],
    send_buffer: Vec<u8>,
}

impl UdpNonBlockingSocket {
    /// Binds to `0.0.0.0:port` in non-blocking mode. Port 0 picks a free port.
    pub fn bind_to_port(port: u16) -> Result<Self, std::io::Error> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            recv_buffer: [0; RECV_BUFFER_SIZE],
            send_buffer: Vec::with_capacity(IDEAL_MAX_UDP_PACKET_SIZE),
        })
    }

    /// The address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }

    fn send_datagram(&self, buf: &[u8], addr: &SocketAddr) {
        // Fragmented datagrams are lost whenever any fragment is; large snapshots usually
        // mean too many players in one message.
        if buf.len() > IDEAL_MAX_UDP_PACKET_SIZE {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::WireProtocol,
                "{}-byte datagram to {} exceeds the {}-byte fragmentation limit",
                buf.len(),
                addr,
                IDEAL_MAX_UDP_PACKET_SIZE
            );
        }

        if let Err(e) = self.socket.send_to(buf, addr) {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::Transport,
                "datagram to {} not sent: {}",
                addr,
                e
            );
        }
    }
}

impl NonBlockingSocket<SocketAddr> for UdpNonBlockingSocket {
    fn send_to(&mut self, msg: &WireMessage, addr: &SocketAddr) {
        self.send_buffer.clear();
        if let Err(e) = msg.encode_append(&mut self.send_buffer) {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::WireProtocol,
                "could not encode {:?}: {}",
                msg.tag(),
                e
            );
            return;
        }
        self.send_datagram(&self.send_buffer, addr);
    }

    fn send_keep_alive(&mut self, addr: &SocketAddr) {
        self.send_datagram(&[], addr);
    }

    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, WireMessage)> {
        let mut received = Vec::with_capacity(4);
        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((len, src_addr)) => {
                    let Some(datagram) = self.recv_buffer.get(..len) else {
                        report_violation!(
                            ViolationSeverity::Error,
                            ViolationKind::Transport,
                            "recv_from reported {} bytes for a {}-byte buffer",
                            len,
                            RECV_BUFFER_SIZE
                        );
                        continue;
                    };
                    if is_keep_alive_datagram(datagram) {
                        tracing::trace!(endpoint = %src_addr, "keep-alive datagram");
                        continue;
                    }
                    match codec::decode(datagram) {
                        Some(msg) => received.push((src_addr, msg)),
                        None => {
                            tracing::trace!(
                                endpoint = %src_addr,
                                len,
                                "dropping undecodable datagram"
                            );
                        },
                    }
                },
                // drained
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return received,
                // ICMP port unreachable from an earlier send, surfaced on Windows
                Err(ref err) if err.kind() == ErrorKind::ConnectionReset => continue,
                Err(err) => {
                    report_violation!(
                        ViolationSeverity::Error,
                        ViolationKind::Transport,
                        "gameplay socket receive failed ({:?}): {}",
                        err.kind(),
                        err
                    );
                    return received;
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
    #[cfg(not(miri))]
    use crate::{input::InputFrame, PlayerId, Tick, Vec2};

    // UDP delivery timing varies across platforms, so poll a few times.
    #[cfg(not(miri))]
    #[track_caller]
    fn poll_until(
        socket: &mut UdpNonBlockingSocket,
        want: usize,
        attempts: u32,
    ) -> Vec<(SocketAddr, WireMessage)> {
        let mut got = Vec::new();
        for _ in 0..attempts {
            got.extend(socket.receive_all_messages());
            if got.len() >= want {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        got
    }

    // Sockets bind to 0.0.0.0; some platforms cannot send to that, so target loopback.
    #[cfg(not(miri))]
    #[track_caller]
    fn loopback(socket: &UdpNonBlockingSocket) -> SocketAddr {
        let local = socket.local_addr().unwrap();
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port())
    }

    #[test]
    #[cfg(not(miri))]
    fn receive_is_non_blocking() {
        let mut socket = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        assert!(socket.receive_all_messages().is_empty());
    }

    #[test]
    #[cfg(not(miri))]
    fn message_reaches_peer_with_sender_address() {
        let mut alice = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        let mut bob = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        let alice_addr = loopback(&alice);
        let bob_addr = loopback(&bob);

        let msg = WireMessage::InputFrame(
            InputFrame::new(Vec2::new(1.0, 0.0), true).at_tick(Tick::new(12)),
        );
        alice.send_to(&msg, &bob_addr);

        let received = poll_until(&mut bob, 1, 20);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0.port(), alice_addr.port());
        assert_eq!(received[0].1, msg);
    }

    #[test]
    #[cfg(not(miri))]
    fn keep_alives_and_garbage_are_filtered() {
        let mut alice = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        let mut bob = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        let bob_addr = loopback(&bob);

        alice.send_keep_alive(&bob_addr);
        alice.socket.send_to(&[0xEE, 0x01, 0x02], bob_addr).unwrap();
        let marker = WireMessage::ClientReady {
            player_id: PlayerId::new(3),
        };
        alice.send_to(&marker, &bob_addr);

        let received = poll_until(&mut bob, 1, 20);
        // Give any stragglers a chance to show up before asserting nothing else came through.
        std::thread::sleep(std::time::Duration::from_millis(50));
        let mut all: Vec<_> = received.into_iter().map(|(_, m)| m).collect();
        all.extend(bob.receive_all_messages().into_iter().map(|(_, m)| m));
        assert_eq!(all, vec![marker]);
    }
}
