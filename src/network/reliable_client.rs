//! Client side of the reliable stream channel.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, info};
use web_time::{Duration, Instant};

use crate::network::framing::{encode_frame_into, keep_alive_frame, StreamFramer, MAX_STREAM_PAYLOAD};
use crate::sessions::config::TransportConfig;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{report_violation, PlayerId, ReliableChannel, SyncError};

const IO_POLL_INTERVAL: Duration = Duration::from_millis(10);

struct ClientShared {
    config: TransportConfig,
    server_addr: SocketAddr,
    identity: AtomicU32,
    outbound: Mutex<VecDeque<Vec<u8>>>,
    connected: AtomicBool,
    shutdown: AtomicBool,
}

impl ClientShared {
    fn identity(&self) -> PlayerId {
        PlayerId::new(self.identity.load(Ordering::Acquire))
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// A reliable channel to a [`ConnectionManager`](crate::ConnectionManager) that survives
/// dropped connections.
///
/// A background thread keeps (re)connecting with
/// [`reconnect_delay`](TransportConfig::reconnect_delay) between attempts. Payloads queued
/// with [`ReliableChannel::send`] while disconnected are held and written once the stream
/// is back. Every frame, keep-alives included, carries the client's identity, so the
/// server re-homes it to whatever endpoint the new connection uses.
///
/// Payloads leave the queue one frame at a time, once the stream has taken every byte of
/// the frame. A connection that breaks mid-frame resends only that frame and the ones
/// after it, so a payload is never delivered twice; one handed to a stream that then
/// dies can still be lost.
///
/// ```no_run
/// use rewind_sync::{PlayerId, ReliableChannel, ReliableClient, TransportConfig};
///
/// # fn main() -> Result<(), rewind_sync::SyncError> {
/// let server = "127.0.0.1:9051".parse().expect("valid address");
/// let mut client = ReliableClient::connect(server, PlayerId::new(0), TransportConfig::default())?;
/// client.send(b"hello")?;
/// for payload in client.poll() {
///     println!("{} bytes from the server", payload.len());
/// }
/// # Ok(())
/// # }
/// ```
pub struct ReliableClient {
    shared: Arc<ClientShared>,
    inbound: Receiver<Vec<u8>>,
    thread: Option<JoinHandle<()>>,
}

impl ReliableClient {
    /// Starts connecting to `server_addr` as `player_id`.
    ///
    /// Returns immediately; the connection is established in the background.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidConfig`] for an invalid `config`, [`SyncError::SocketError`] if
    /// the background thread cannot be spawned.
    pub fn connect(
        server_addr: SocketAddr,
        player_id: PlayerId,
        config: TransportConfig,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let shared = Arc::new(ClientShared {
            config,
            server_addr,
            identity: AtomicU32::new(player_id.as_u32()),
            outbound: Mutex::new(VecDeque::new()),
            connected: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });
        let (tx, inbound) = mpsc::channel();
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("rewind-reliable-client".to_owned())
            .spawn(move || connection_loop(&thread_shared, &tx))?;
        Ok(Self {
            shared,
            inbound,
            thread: Some(thread),
        })
    }

    /// Returns `true` while a stream to the server is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Identity stamped on outgoing frames.
    #[must_use]
    pub fn player_id(&self) -> PlayerId {
        self.shared.identity()
    }

    /// Changes the identity stamped on outgoing frames, e.g. once the server assigned one.
    pub fn set_player_id(&self, player_id: PlayerId) {
        self.shared
            .identity
            .store(player_id.as_u32(), Ordering::Release);
    }

    /// Payloads waiting to be written.
    #[must_use]
    pub fn pending_sends(&self) -> usize {
        self.shared.outbound.lock().len()
    }

    /// Closes the stream and joins the background thread.
    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::InternalError,
                    "reliable client thread panicked"
                );
            }
        }
    }
}

impl ReliableChannel for ReliableClient {
    fn send(&mut self, payload: &[u8]) -> Result<(), SyncError> {
        if payload.is_empty() {
            return Err(SyncError::InvalidRequest {
                info: "empty payloads are reserved for keep-alives".to_owned(),
            });
        }
        if payload.len() > MAX_STREAM_PAYLOAD {
            return Err(SyncError::InvalidRequest {
                info: format!(
                    "payload of {} bytes exceeds the {MAX_STREAM_PAYLOAD}-byte frame limit",
                    payload.len()
                ),
            });
        }
        self.shared.outbound.lock().push_back(payload.to_vec());
        Ok(())
    }

    fn poll(&mut self) -> Vec<Vec<u8>> {
        self.inbound.try_iter().collect()
    }

    fn set_identity(&mut self, player: PlayerId) {
        self.set_player_id(player);
    }
}

impl Drop for ReliableClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ReliableClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableClient")
            .field("server_addr", &self.shared.server_addr)
            .field("player_id", &self.player_id())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

fn connection_loop(shared: &Arc<ClientShared>, inbound: &Sender<Vec<u8>>) {
    while !shared.is_shutting_down() {
        match TcpStream::connect_timeout(&shared.server_addr, shared.config.connection_timeout) {
            Ok(stream) => {
                info!(server = %shared.server_addr, player = %shared.identity(), "reliable channel connected");
                shared.connected.store(true, Ordering::Release);
                let reason = run_stream(shared, stream, inbound);
                shared.connected.store(false, Ordering::Release);
                info!(server = %shared.server_addr, reason, "reliable channel disconnected");
            },
            Err(e) => {
                debug!(server = %shared.server_addr, error = %e, "connect failed");
            },
        }
        sleep_unless_shutdown(shared, shared.config.reconnect_delay);
    }
}

fn sleep_unless_shutdown(shared: &ClientShared, total: Duration) {
    let deadline = Instant::now() + total;
    while !shared.is_shutting_down() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(IO_POLL_INTERVAL));
    }
}

/// Serves one connection until it fails; returns why it ended.
fn run_stream(
    shared: &ClientShared,
    mut stream: TcpStream,
    inbound: &Sender<Vec<u8>>,
) -> &'static str {
    if stream.set_read_timeout(Some(IO_POLL_INTERVAL)).is_err() || stream.set_nodelay(true).is_err()
    {
        return "could not configure stream";
    }
    // Identify right away so the server re-homes us before any payload arrives.
    if stream.write_all(&keep_alive_frame(shared.identity())).is_err() {
        return "write failed";
    }

    let mut framer = StreamFramer::new();
    let mut chunk = vec![0u8; 64 * 1024];
    let mut wire = Vec::new();
    let mut last_heard = Instant::now();
    let mut last_sent = Instant::now();

    while !shared.is_shutting_down() {
        match stream.read(&mut chunk) {
            Ok(0) => return "server closed the stream",
            Ok(read) => {
                last_heard = Instant::now();
                framer.push(chunk.get(..read).unwrap_or_default());
                loop {
                    match framer.next_frame() {
                        Ok(Some(frame)) if frame.is_keep_alive() => {},
                        Ok(Some(frame)) => {
                            if inbound.send(frame.payload).is_err() {
                                return "client dropped";
                            }
                        },
                        Ok(None) => break,
                        Err(e) => {
                            report_violation!(
                                ViolationSeverity::Error,
                                ViolationKind::WireProtocol,
                                "dropping reliable stream: {}",
                                e
                            );
                            return "malformed frame";
                        },
                    }
                }
                framer.compact();
            },
            Err(ref e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) => {},
            Err(e) => {
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::Transport,
                    "read from {} failed: {}",
                    shared.server_addr,
                    e
                );
                return "read failed";
            },
        }

        if last_heard.elapsed() > shared.config.connection_timeout {
            return "server went silent";
        }

        let identity = shared.identity();
        let mut outbound = shared.outbound.lock();
        if !outbound.is_empty() {
            let flushed = flush_outbound(&mut stream, identity, &mut outbound, &mut wire);
            if flushed.is_err() {
                // Whatever is still queued goes out on the next connection.
                return "write failed";
            }
            last_sent = Instant::now();
        }
        drop(outbound);

        if last_sent.elapsed() >= shared.config.keepalive_interval {
            if stream.write_all(&keep_alive_frame(identity)).is_err() {
                return "write failed";
            }
            last_sent = Instant::now();
        }
    }
    "shutting down"
}

/// Writes queued payloads one frame at a time, popping each once the stream has accepted
/// all of its bytes.
///
/// A frame interrupted mid-write stays queued and is resent whole on the next stream; the
/// server discards the truncated copy with the dead connection. Frames already accepted
/// are not resent, so none of them is delivered twice.
fn flush_outbound<W: Write>(
    stream: &mut W,
    identity: PlayerId,
    outbound: &mut VecDeque<Vec<u8>>,
    wire: &mut Vec<u8>,
) -> std::io::Result<()> {
    while let Some(payload) = outbound.front() {
        wire.clear();
        if encode_frame_into(identity, payload, wire).is_err() {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::WireProtocol,
                "skipping oversized payload of {} bytes",
                payload.len()
            );
        } else {
            stream.write_all(wire)?;
        }
        outbound.pop_front();
    }
    Ok(())
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
    use std::net::{Ipv4Addr, TcpListener};

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    /// Accepts `budget` bytes, then fails like a reset connection.
    struct BreakingWriter {
        accepted: Vec<u8>,
        budget: usize,
    }

    impl Write for BreakingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.budget == 0 {
                return Err(std::io::Error::from(ErrorKind::ConnectionReset));
            }
            let take = buf.len().min(self.budget);
            self.accepted.extend_from_slice(&buf[..take]);
            self.budget -= take;
            Ok(take)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn broken_write_keeps_only_the_unfinished_frames() {
        let me = PlayerId::new(3);
        let first = encode_frame(me, b"one").unwrap();
        let mut writer = BreakingWriter {
            accepted: Vec::new(),
            budget: first.len() + 2,
        };
        let mut queue: VecDeque<Vec<u8>> =
            [b"one".to_vec(), b"two".to_vec(), b"three".to_vec()].into();
        let mut wire = Vec::new();

        assert!(flush_outbound(&mut writer, me, &mut queue, &mut wire).is_err());
        assert_eq!(queue, VecDeque::from([b"two".to_vec(), b"three".to_vec()]));
        assert_eq!(&writer.accepted[..first.len()], first.as_slice());

        let mut healthy = Vec::new();
        flush_outbound(&mut healthy, me, &mut queue, &mut wire).unwrap();
        assert!(queue.is_empty());
        let (resent, used) = first_frame_from_bytes(&healthy).unwrap();
        assert_eq!(resent.payload, b"two");
        assert_eq!(first_frame_from_bytes(&healthy[used..]).unwrap().0.payload, b"three");
    }

    #[test]
    #[cfg(not(miri))]
    fn identifies_immediately_and_frames_payloads() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client =
            ReliableClient::connect(addr, PlayerId::new(7), TransportConfig::local_test()).unwrap();
        client.send(b"ready").unwrap();

        let (mut server_side, _) = listener.accept().unwrap();
        server_side
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let mut received = Vec::new();
        let mut chunk = [0u8; 128];
        let mut frames = Vec::new();
        assert!(wait_until(|| {
            if let Ok(read) = server_side.read(&mut chunk) {
                received.extend_from_slice(&chunk[..read]);
            }
            while let Some((frame, used)) = first_frame_from_bytes(&received) {
                received.drain(..used);
                frames.push(frame);
            }
            frames.iter().any(|frame| frame.payload == b"ready")
        }));
        assert!(frames[0].is_keep_alive());
        assert!(frames.iter().all(|frame| frame.sender == PlayerId::new(7)));

        server_side
            .write_all(&encode_frame(PlayerId::new(7), b"welcome").unwrap())
            .unwrap();
        let mut polled = Vec::new();
        assert!(wait_until(|| {
            polled.extend(client.poll());
            !polled.is_empty()
        }));
        assert_eq!(polled, vec![b"welcome".to_vec()]);
    }

    #[test]
    fn empty_payload_is_refused() {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 9));
        let mut client =
            ReliableClient::connect(addr, PlayerId::new(1), TransportConfig::local_test()).unwrap();
        assert!(matches!(
            client.send(&[]),
            Err(SyncError::InvalidRequest { .. })
        ));
        client.set_identity(PlayerId::new(4));
        assert_eq!(client.player_id(), PlayerId::new(4));
    }
}
