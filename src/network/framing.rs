//! Packet framing for both channels.
//!
//! The datagram channel needs no framing beyond the datagram itself: one wire message per
//! datagram, with an empty datagram acting as a keep-alive. The stream channel has no
//! message boundaries, so every packet is wrapped as
//!
//! ```text
//! [sender: u32 LE][payload_len: u32 LE][payload: payload_len bytes]
//! ```
//!
//! A zero-length payload is a keep-alive. A single read may deliver any number of frames
//! plus a partial one; [`StreamFramer`] keeps the partial tail until the rest arrives.

use std::fmt;

use crate::PlayerId;

/// Size of the `[sender][payload_len]` header.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Largest payload a stream frame may carry (also the reliable channel's working buffer).
pub const MAX_STREAM_PAYLOAD: usize = 4 * 1024 * 1024;

/// One complete frame read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    /// Identity the peer stamped on the frame.
    pub sender: PlayerId,
    /// Application payload; empty for keep-alives.
    pub payload: Vec<u8>,
}

impl StreamFrame {
    /// Returns `true` if this frame is a keep-alive.
    #[must_use]
    pub fn is_keep_alive(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Stream framing failures. Any of them leaves the stream unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramerError {
    /// A header announced (or a caller tried to send) more than [`MAX_STREAM_PAYLOAD`].
    PayloadTooLarge {
        /// The offending length.
        len: usize,
    },
}

impl fmt::Display for FramerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PayloadTooLarge { len } => write!(
                f,
                "frame payload of {len} bytes exceeds the {MAX_STREAM_PAYLOAD}-byte limit"
            ),
        }
    }
}

impl std::error::Error for FramerError {}

/// Returns `true` for datagrams that only keep the path alive and carry no message.
#[inline]
#[must_use]
pub fn is_keep_alive_datagram(datagram: &[u8]) -> bool {
    datagram.is_empty()
}

fn read_header(bytes: &[u8]) -> Option<(PlayerId, usize)> {
    let sender: [u8; 4] = bytes.get(0..4)?.try_into().ok()?;
    let len: [u8; 4] = bytes.get(4..FRAME_HEADER_SIZE)?.try_into().ok()?;
    Some((
        PlayerId::new(u32::from_le_bytes(sender)),
        u32::from_le_bytes(len) as usize,
    ))
}

/// Extracts the first complete frame from `bytes`.
///
/// Returns the frame and the number of bytes it occupied, or `None` if `bytes` does not
/// yet hold a whole frame.
#[must_use]
pub fn first_frame_from_bytes(bytes: &[u8]) -> Option<(StreamFrame, usize)> {
    let (sender, len) = read_header(bytes)?;
    let end = FRAME_HEADER_SIZE.checked_add(len)?;
    let payload = bytes.get(FRAME_HEADER_SIZE..end)?.to_vec();
    Some((StreamFrame { sender, payload }, end))
}

/// Appends one frame to `out`.
pub fn encode_frame_into(
    sender: PlayerId,
    payload: &[u8],
    out: &mut Vec<u8>,
) -> Result<(), FramerError> {
    if payload.len() > MAX_STREAM_PAYLOAD {
        return Err(FramerError::PayloadTooLarge { len: payload.len() });
    }
    out.reserve(FRAME_HEADER_SIZE + payload.len());
    out.extend_from_slice(&sender.as_u32().to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// Encodes one frame into a new buffer.
pub fn encode_frame(sender: PlayerId, payload: &[u8]) -> Result<Vec<u8>, FramerError> {
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    encode_frame_into(sender, payload, &mut out)?;
    Ok(out)
}

/// A keep-alive frame for `sender`.
#[must_use]
pub fn keep_alive_frame(sender: PlayerId) -> [u8; FRAME_HEADER_SIZE] {
    let mut out = [0u8; FRAME_HEADER_SIZE];
    out[..4].copy_from_slice(&sender.as_u32().to_le_bytes());
    out
}

/// Reassembles frames from arbitrarily split stream reads.
///
/// Push every read with [`push`](Self::push), drain frames with
/// [`next_frame`](Self::next_frame) until it returns `Ok(None)`, then call
/// [`compact`](Self::compact) to move the partial tail to the front of the buffer.
#[derive(Debug, Default)]
pub struct StreamFramer {
    buffer: Vec<u8>,
    consumed: usize,
}

impl StreamFramer {
    /// Creates an empty framer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly read bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes received but not yet returned as part of a frame.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len() - self.consumed
    }

    /// Returns the next complete frame, if one is buffered.
    ///
    /// # Errors
    ///
    /// [`FramerError::PayloadTooLarge`] if the next header announces a payload larger than
    /// [`MAX_STREAM_PAYLOAD`]. The stream cannot be resynchronized after that.
    pub fn next_frame(&mut self) -> Result<Option<StreamFrame>, FramerError> {
        let unread = self.buffer.get(self.consumed..).unwrap_or_default();
        if let Some((_, len)) = read_header(unread) {
            if len > MAX_STREAM_PAYLOAD {
                return Err(FramerError::PayloadTooLarge { len });
            }
        }
        match first_frame_from_bytes(unread) {
            Some((frame, used)) => {
                self.consumed += used;
                Ok(Some(frame))
            },
            None => Ok(None),
        }
    }

    /// Drops consumed bytes, moving the unconsumed tail to the front.
    pub fn compact(&mut self) {
        if self.consumed > 0 {
            self.buffer.drain(..self.consumed);
            self.consumed = 0;
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

    fn two_frames() -> Vec<u8> {
        let mut bytes = encode_frame(PlayerId::new(7), b"hello").unwrap();
        bytes.extend_from_slice(&keep_alive_frame(PlayerId::new(7)));
        encode_frame_into(PlayerId::new(9), &[1, 2, 3], &mut bytes).unwrap();
        bytes
    }

    #[test]
    fn header_layout_is_little_endian() {
        let bytes = encode_frame(PlayerId::new(0x0102_0304), b"ab").unwrap();
        assert_eq!(bytes, [4, 3, 2, 1, 2, 0, 0, 0, b'a', b'b']);
    }

    #[test]
    fn first_frame_needs_whole_frame() {
        let bytes = encode_frame(PlayerId::new(1), b"xyz").unwrap();
        for cut in 0..bytes.len() {
            assert!(first_frame_from_bytes(&bytes[..cut]).is_none());
        }
        let (frame, used) = first_frame_from_bytes(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(frame.payload, b"xyz");
        assert_eq!(frame.sender, PlayerId::new(1));
    }

    #[test]
    fn framer_extracts_many_frames_from_one_read() {
        let mut framer = StreamFramer::new();
        framer.push(&two_frames());
        let a = framer.next_frame().unwrap().unwrap();
        let b = framer.next_frame().unwrap().unwrap();
        let c = framer.next_frame().unwrap().unwrap();
        assert_eq!(a.payload, b"hello");
        assert!(b.is_keep_alive());
        assert_eq!(c.sender, PlayerId::new(9));
        assert!(framer.next_frame().unwrap().is_none());
        framer.compact();
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn framer_keeps_partial_tail_across_reads() {
        let bytes = two_frames();
        let mut framer = StreamFramer::new();
        let mut frames = Vec::new();
        for chunk in bytes.chunks(3) {
            framer.push(chunk);
            while let Some(frame) = framer.next_frame().unwrap() {
                frames.push(frame);
            }
            framer.compact();
        }
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].payload, vec![1, 2, 3]);
    }

    #[test]
    fn oversized_header_poisons_stream() {
        let mut framer = StreamFramer::new();
        let mut header = PlayerId::new(1).as_u32().to_le_bytes().to_vec();
        header.extend_from_slice(&((MAX_STREAM_PAYLOAD + 1) as u32).to_le_bytes());
        framer.push(&header);
        assert_eq!(
            framer.next_frame(),
            Err(FramerError::PayloadTooLarge {
                len: MAX_STREAM_PAYLOAD + 1
            })
        );
    }

    #[test]
    fn oversized_payload_is_refused_on_send() {
        let payload = vec![0u8; MAX_STREAM_PAYLOAD + 1];
        assert!(encode_frame(PlayerId::new(1), &payload).is_err());
    }

    #[test]
    fn keep_alive_datagram_is_empty() {
        assert!(is_keep_alive_datagram(&[]));
        assert!(!is_keep_alive_datagram(&[4, 0, 0, 0, 0]));
    }
}
