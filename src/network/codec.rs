//! Binary codec for the tagged wire messages.
//!
//! Every message starts with a one-byte [`MessageTag`] from a closed set, followed by the
//! message's fields in declaration order:
//!
//! - fixed-width fields are little-endian (`u32`/`i32` as 4 bytes, `f32` as IEEE-754,
//!   `bool` as one byte),
//! - fixed records ([`InputFrame`], [`PlayerState`]) are serialized with bincode using a
//!   single, centralized fixed-int configuration,
//! - lists are `[u32 count][count x record]`, and the count is validated against the
//!   bytes that remain before anything is allocated.
//!
//! Decoding never fails loudly: unknown tags, short buffers, bad counts and trailing
//! garbage all yield `None`. On an unreliable channel that is a normal event and the
//! caller simply drops the packet.
//!
//! # Examples
//!
//! ```
//! use rewind_sync::network::codec::{decode, WireMessage};
//! use rewind_sync::PlayerId;
//!
//! let msg = WireMessage::Identification { player_id: PlayerId::new(7) };
//! let bytes = msg.encode().expect("encoding should succeed");
//! assert_eq!(bytes, [4, 7, 0, 0, 0]);
//! assert_eq!(decode(&bytes), Some(msg));
//!
//! // Unknown tag: no message, no panic.
//! assert_eq!(decode(&[0xFF, 1, 2, 3]), None);
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

use crate::input::{InputFrame, InputMessage};
use crate::state::{GameStart, PlayerState, StateSnapshot};
use crate::world::{CellInfo, DoorType, LogicCell};
use crate::{PlayerId, Tick};

// Fixed-width integers keep record sizes constant, which the list validation relies on.
// bincode's default byte order is little-endian.
fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Encoded size of an [`InputFrame`] record.
pub const INPUT_FRAME_RECORD_SIZE: usize = 13;
/// Encoded size of a [`PlayerState`] record.
pub const PLAYER_STATE_RECORD_SIZE: usize = 24;
/// Smallest encoded [`CellInfo`] record (type, id, empty byte list).
const CELL_INFO_MIN_SIZE: usize = 9;
/// Encoded size of a door cell's fields.
const DOOR_RECORD_SIZE: usize = 7;

/// The leading byte of every wire message.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageTag {
    /// A single [`InputFrame`].
    InputFrame = 0,
    /// An [`InputMessage`] batch.
    InputMessage = 1,
    /// A [`StateSnapshot`].
    StateSnapshot = 2,
    /// A single [`PlayerState`].
    PlayerState = 3,
    /// Identity assignment / announcement.
    Identification = 4,
    /// [`GameStart`] handshake payload.
    GameStart = 5,
    /// Client finished building the world.
    ClientReady = 6,
    /// [`LogicCell::Wall`].
    LogicCellWall = 7,
    /// [`LogicCell::Door`].
    LogicCellDoor = 8,
    /// [`LogicCell::Button`].
    LogicCellButton = 9,
    /// [`CellInfo`].
    LogicCellInfo = 10,
    /// A list of [`PlayerState`].
    PlayerStateList = 11,
    /// [`LogicCell::Floor`].
    LogicCellFloor = 12,
}

impl MessageTag {
    /// Parses a tag byte. Unknown values yield `None`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::InputFrame,
            1 => Self::InputMessage,
            2 => Self::StateSnapshot,
            3 => Self::PlayerState,
            4 => Self::Identification,
            5 => Self::GameStart,
            6 => Self::ClientReady,
            7 => Self::LogicCellWall,
            8 => Self::LogicCellDoor,
            9 => Self::LogicCellButton,
            10 => Self::LogicCellInfo,
            11 => Self::PlayerStateList,
            12 => Self::LogicCellFloor,
            _ => return None,
        })
    }

    /// The shortest buffer (tag included) that can hold a message with this tag.
    #[must_use]
    pub const fn min_encoded_len(self) -> usize {
        1 + match self {
            Self::InputFrame => INPUT_FRAME_RECORD_SIZE,
            Self::InputMessage | Self::StateSnapshot => 12,
            Self::PlayerState => PLAYER_STATE_RECORD_SIZE,
            Self::Identification | Self::ClientReady | Self::PlayerStateList => 4,
            Self::GameStart => 16,
            Self::LogicCellWall | Self::LogicCellButton | Self::LogicCellFloor => 1,
            Self::LogicCellDoor => DOOR_RECORD_SIZE,
            Self::LogicCellInfo => CELL_INFO_MIN_SIZE,
        }
    }
}

/// Every message that can travel on either channel.
///
/// Callers match exhaustively on the decoded variant instead of probing types.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// A single input frame.
    InputFrame(InputFrame),
    /// A redundant batch of input frames.
    InputMessage(InputMessage),
    /// Authoritative or predicted state for a tick.
    StateSnapshot(StateSnapshot),
    /// A single player's state.
    PlayerState(PlayerState),
    /// Server assigns (or client announces) a player identity.
    Identification {
        /// The identity.
        player_id: PlayerId,
    },
    /// Server announces the game is starting.
    GameStart(GameStart),
    /// Client has built the world and is ready to play.
    ClientReady {
        /// The ready player.
        player_id: PlayerId,
    },
    /// A concrete logic cell.
    LogicCell(LogicCell),
    /// A cell with its grid identity.
    CellInfo(CellInfo),
    /// A roster of player states.
    PlayerStateList(Vec<PlayerState>),
}

impl WireMessage {
    /// The tag byte this message is encoded with.
    #[must_use]
    pub const fn tag(&self) -> MessageTag {
        match self {
            Self::InputFrame(_) => MessageTag::InputFrame,
            Self::InputMessage(_) => MessageTag::InputMessage,
            Self::StateSnapshot(_) => MessageTag::StateSnapshot,
            Self::PlayerState(_) => MessageTag::PlayerState,
            Self::Identification { .. } => MessageTag::Identification,
            Self::GameStart(_) => MessageTag::GameStart,
            Self::ClientReady { .. } => MessageTag::ClientReady,
            Self::LogicCell(LogicCell::Wall { .. }) => MessageTag::LogicCellWall,
            Self::LogicCell(LogicCell::Door { .. }) => MessageTag::LogicCellDoor,
            Self::LogicCell(LogicCell::Button { .. }) => MessageTag::LogicCellButton,
            Self::LogicCell(LogicCell::Floor { .. }) => MessageTag::LogicCellFloor,
            Self::CellInfo(_) => MessageTag::LogicCellInfo,
            Self::PlayerStateList(_) => MessageTag::PlayerStateList,
        }
    }

    /// Encodes this message into a new buffer.
    ///
    /// Only fails if a list is longer than a `u32` count can describe.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        let mut buffer = Vec::with_capacity(64);
        self.encode_append(&mut buffer)?;
        Ok(buffer)
    }

    /// Appends the encoding of this message to `buffer`, returning the bytes written.
    pub fn encode_append(&self, buffer: &mut Vec<u8>) -> CodecResult<usize> {
        let start_len = buffer.len();
        buffer.push(self.tag() as u8);
        match self {
            Self::InputFrame(frame) => {
                encode_record(frame, buffer)?;
            },
            Self::InputMessage(msg) => {
                put_u32(buffer, msg.player_id.as_u32());
                put_u32(buffer, msg.start_tick.as_u32());
                put_records(buffer, &msg.frames)?;
            },
            Self::StateSnapshot(snapshot) => {
                put_u32(buffer, snapshot.tick.as_u32());
                put_u32(buffer, snapshot.owner.as_u32());
                put_records(buffer, &snapshot.players)?;
            },
            Self::PlayerState(player) => {
                encode_record(player, buffer)?;
            },
            Self::Identification { player_id } | Self::ClientReady { player_id } => {
                put_u32(buffer, player_id.as_u32());
            },
            Self::GameStart(start) => {
                put_u32(buffer, start.simulation_buffer);
                put_records(buffer, &start.players)?;
                put_u32(buffer, start.grid_width);
                put_count(buffer, start.cells.len())?;
                for cell in &start.cells {
                    put_cell_info(buffer, cell)?;
                }
            },
            Self::LogicCell(cell) => match *cell {
                LogicCell::Wall { walkable }
                | LogicCell::Button { walkable }
                | LogicCell::Floor { walkable } => {
                    encode_record(&walkable, buffer)?;
                },
                LogicCell::Door {
                    walkable,
                    door_type,
                    is_closed,
                    cell_id,
                } => {
                    encode_record(&(walkable, door_type as u8, is_closed, cell_id), buffer)?;
                },
            },
            Self::CellInfo(info) => put_cell_info(buffer, info)?,
            Self::PlayerStateList(players) => put_records(buffer, players)?,
        }
        Ok(buffer.len() - start_len)
    }
}

/// Decodes one complete message.
///
/// Returns `None` for an unknown tag, a buffer shorter than the tag requires, a list
/// count that does not fit in the remaining bytes, an invalid field value, or bytes left
/// over after the message.
#[must_use]
pub fn decode(bytes: &[u8]) -> Option<WireMessage> {
    let tag = MessageTag::from_u8(*bytes.first()?)?;
    if bytes.len() < tag.min_encoded_len() {
        return None;
    }
    let mut reader = WireReader::new(bytes.get(1..)?);
    let message = match tag {
        MessageTag::InputFrame => WireMessage::InputFrame(reader.record(INPUT_FRAME_RECORD_SIZE)?),
        MessageTag::InputMessage => {
            let player_id = PlayerId::new(reader.u32()?);
            let start_tick = Tick::new(reader.u32()?);
            let frames = reader.records(INPUT_FRAME_RECORD_SIZE)?;
            WireMessage::InputMessage(InputMessage::new(player_id, start_tick, frames))
        },
        MessageTag::StateSnapshot => {
            let tick = Tick::new(reader.u32()?);
            let owner = PlayerId::new(reader.u32()?);
            let players = reader.records(PLAYER_STATE_RECORD_SIZE)?;
            WireMessage::StateSnapshot(StateSnapshot::new(tick, owner, players))
        },
        MessageTag::PlayerState => WireMessage::PlayerState(reader.record(PLAYER_STATE_RECORD_SIZE)?),
        MessageTag::Identification => WireMessage::Identification {
            player_id: PlayerId::new(reader.u32()?),
        },
        MessageTag::ClientReady => WireMessage::ClientReady {
            player_id: PlayerId::new(reader.u32()?),
        },
        MessageTag::GameStart => {
            let simulation_buffer = reader.u32()?;
            let players = reader.records(PLAYER_STATE_RECORD_SIZE)?;
            let grid_width = reader.u32()?;
            let count = reader.count(CELL_INFO_MIN_SIZE)?;
            let mut cells = Vec::with_capacity(count);
            for _ in 0..count {
                cells.push(reader.cell_info()?);
            }
            WireMessage::GameStart(GameStart {
                simulation_buffer,
                players,
                grid_width,
                cells,
            })
        },
        MessageTag::LogicCellWall => WireMessage::LogicCell(LogicCell::Wall {
            walkable: reader.record(1)?,
        }),
        MessageTag::LogicCellButton => WireMessage::LogicCell(LogicCell::Button {
            walkable: reader.record(1)?,
        }),
        MessageTag::LogicCellFloor => WireMessage::LogicCell(LogicCell::Floor {
            walkable: reader.record(1)?,
        }),
        MessageTag::LogicCellDoor => {
            let (walkable, door_type, is_closed, cell_id): (bool, u8, bool, i32) =
                reader.record(DOOR_RECORD_SIZE)?;
            WireMessage::LogicCell(LogicCell::Door {
                walkable,
                door_type: DoorType::from_u8(door_type)?,
                is_closed,
                cell_id,
            })
        },
        MessageTag::LogicCellInfo => WireMessage::CellInfo(reader.cell_info()?),
        MessageTag::PlayerStateList => {
            WireMessage::PlayerStateList(reader.records(PLAYER_STATE_RECORD_SIZE)?)
        },
    };
    reader.is_exhausted().then_some(message)
}

fn put_u32(buffer: &mut Vec<u8>, value: u32) {
    buffer.extend_from_slice(&value.to_le_bytes());
}

fn put_count(buffer: &mut Vec<u8>, len: usize) -> CodecResult<()> {
    let count = u32::try_from(len).map_err(|_| CodecError::CollectionTooLarge { len })?;
    put_u32(buffer, count);
    Ok(())
}

fn put_records<T: Serialize>(buffer: &mut Vec<u8>, records: &[T]) -> CodecResult<()> {
    put_count(buffer, records.len())?;
    for record in records {
        encode_record(record, buffer)?;
    }
    Ok(())
}

fn put_cell_info(buffer: &mut Vec<u8>, info: &CellInfo) -> CodecResult<()> {
    buffer.push(info.cell_type);
    buffer.extend_from_slice(&info.cell_id.to_le_bytes());
    put_count(buffer, info.bytes.len())?;
    buffer.extend_from_slice(&info.bytes);
    Ok(())
}

/// Cursor over the body of a message. Every read is bounds-checked and yields `None`
/// when the buffer runs out.
struct WireReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    const fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    const fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.bytes.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1)?.first().copied()
    }

    fn u32(&mut self) -> Option<u32> {
        let raw: [u8; 4] = self.take(4)?.try_into().ok()?;
        Some(u32::from_le_bytes(raw))
    }

    fn i32(&mut self) -> Option<i32> {
        let raw: [u8; 4] = self.take(4)?.try_into().ok()?;
        Some(i32::from_le_bytes(raw))
    }

    /// Reads a list count and checks that `count` records of at least `min_record_size`
    /// bytes can still fit.
    fn count(&mut self, min_record_size: usize) -> Option<usize> {
        let count = self.u32()? as usize;
        let needed = count.checked_mul(min_record_size)?;
        (needed <= self.remaining()).then_some(count)
    }

    fn record<T: DeserializeOwned>(&mut self, size: usize) -> Option<T> {
        let slice = self.take(size)?;
        match decode_record::<T>(slice) {
            Ok((value, read)) if read == size => Some(value),
            _ => None,
        }
    }

    fn records<T: DeserializeOwned>(&mut self, size: usize) -> Option<Vec<T>> {
        let count = self.count(size)?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.record(size)?);
        }
        Some(out)
    }

    fn cell_info(&mut self) -> Option<CellInfo> {
        let cell_type = self.u8()?;
        let cell_id = self.i32()?;
        let len = self.count(1)?;
        let bytes = self.take(len)?.to_vec();
        Some(CellInfo {
            cell_type,
            cell_id,
            bytes,
        })
    }
}

/// What the codec was doing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecOperation {
    /// Encoding a fixed record.
    EncodeRecord,
    /// Decoding a fixed record.
    DecodeRecord,
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeRecord => write!(f, "encoding record"),
            Self::DecodeRecord => write!(f, "decoding record"),
        }
    }
}

/// Errors from the fallible (encode) direction of the codec.
///
/// bincode errors are opaque, so their message is kept as a `String`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The encoding operation failed.
    EncodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The decoding operation failed.
    DecodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// A list has more elements than a `u32` count can describe.
    CollectionTooLarge {
        /// The list length.
        len: usize,
    },
}

impl CodecError {
    /// Creates a new encode error with the given message and operation.
    pub fn encode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::EncodeError {
            message: message.into(),
            operation,
        }
    }

    /// Creates a new decode error with the given message and operation.
    pub fn decode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::DecodeError {
            message: message.into(),
            operation,
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError { message, operation } => {
                write!(f, "encoding failed while {operation}: {message}")
            },
            Self::DecodeError { message, operation } => {
                write!(f, "decoding failed while {operation}: {message}")
            },
            Self::CollectionTooLarge { len } => {
                write!(f, "list of {len} elements does not fit a 32-bit count")
            },
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Appends the fixed-width encoding of `value` to `buffer`, returning the bytes written.
pub fn encode_record<T: Serialize>(value: &T, buffer: &mut Vec<u8>) -> CodecResult<usize> {
    let start_len = buffer.len();
    bincode::serde::encode_into_std_write(value, buffer, config())
        .map(|_| buffer.len() - start_len)
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::EncodeRecord))
}

/// Decodes a fixed-width record, returning it with the number of bytes consumed.
pub fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config())
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::DecodeRecord))
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
    use crate::input::Vec2;
    use crate::world::CellKind;

    fn player(id: u32) -> PlayerState {
        PlayerState {
            id: PlayerId::new(id),
            position: Vec2::new(1.5, -2.0),
            velocity: Vec2::new(0.25, 0.0),
            stamina: 7.0,
        }
    }

    fn frame(tick: u32) -> InputFrame {
        InputFrame::new(Vec2::new(0.0, 1.0), tick % 2 == 0).at_tick(Tick::new(tick))
    }

    fn sample_messages() -> Vec<WireMessage> {
        vec![
            WireMessage::InputFrame(frame(u32::MAX)),
            WireMessage::InputMessage(InputMessage::new(
                PlayerId::new(3),
                Tick::new(10),
                (10..14).map(frame).collect(),
            )),
            WireMessage::InputMessage(InputMessage::new(PlayerId::new(3), Tick::new(0), vec![])),
            WireMessage::StateSnapshot(StateSnapshot::new(
                Tick::new(95),
                PlayerId::new(1),
                vec![player(1), player(2)],
            )),
            WireMessage::StateSnapshot(StateSnapshot::new(Tick::new(0), PlayerId::new(0), vec![])),
            WireMessage::PlayerState(player(9)),
            WireMessage::Identification {
                player_id: PlayerId::new(7),
            },
            WireMessage::ClientReady {
                player_id: PlayerId::new(7),
            },
            WireMessage::GameStart(GameStart {
                simulation_buffer: 4,
                players: vec![player(1)],
                grid_width: 2,
                cells: vec![
                    CellInfo::from_cell(0, LogicCell::Wall { walkable: false }).unwrap(),
                    CellInfo::from_cell(1, LogicCell::closed_door(DoorType::Standard, -5)).unwrap(),
                ],
            }),
            WireMessage::LogicCell(LogicCell::Button { walkable: true }),
            WireMessage::LogicCell(LogicCell::Floor { walkable: true }),
            WireMessage::CellInfo(CellInfo {
                cell_type: CellKind::Wall as u8,
                cell_id: 12,
                bytes: vec![],
            }),
            WireMessage::PlayerStateList(vec![player(4), player(5), player(6)]),
        ]
    }

    #[test]
    fn record_sizes_match_constants() {
        let mut buf = Vec::new();
        assert_eq!(
            encode_record(&InputFrame::default(), &mut buf).unwrap(),
            INPUT_FRAME_RECORD_SIZE
        );
        buf.clear();
        assert_eq!(
            encode_record(&PlayerState::default(), &mut buf).unwrap(),
            PLAYER_STATE_RECORD_SIZE
        );
    }

    #[test]
    fn every_sample_message_decodes_to_itself() {
        for msg in sample_messages() {
            let bytes = msg.encode().unwrap();
            assert_eq!(bytes[0], msg.tag() as u8);
            assert!(bytes.len() >= msg.tag().min_encoded_len());
            assert_eq!(decode(&bytes), Some(msg.clone()), "message {msg:?}");
        }
    }

    #[test]
    fn fields_are_little_endian() {
        let msg = WireMessage::StateSnapshot(StateSnapshot::new(
            Tick::new(0x0102_0304),
            PlayerId::new(5),
            vec![],
        ));
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes, [2, 4, 3, 2, 1, 5, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn input_frame_layout() {
        let bytes = WireMessage::InputFrame(InputFrame {
            tick: Tick::new(1),
            movement: Vec2::new(1.0, 0.0),
            sprinting: true,
        })
        .encode()
        .unwrap();
        assert_eq!(bytes.len(), 1 + INPUT_FRAME_RECORD_SIZE);
        assert_eq!(&bytes[1..5], &1u32.to_le_bytes());
        assert_eq!(&bytes[5..9], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[9..13], &0.0f32.to_le_bytes());
        assert_eq!(bytes[13], 1);
    }

    #[test]
    fn unknown_tag_is_none() {
        assert_eq!(decode(&[13]), None);
        assert_eq!(decode(&[0xFF; 32]), None);
    }

    #[test]
    fn empty_buffer_is_none() {
        assert_eq!(decode(&[]), None);
    }

    #[test]
    fn every_truncation_is_none() {
        for msg in sample_messages() {
            let bytes = msg.encode().unwrap();
            for cut in 0..bytes.len() {
                assert_eq!(decode(&bytes[..cut]), None, "{msg:?} cut at {cut}");
            }
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = WireMessage::Identification {
            player_id: PlayerId::new(1),
        }
        .encode()
        .unwrap();
        bytes.push(0);
        assert_eq!(decode(&bytes), None);
    }

    #[test]
    fn oversized_count_is_rejected_before_allocation() {
        // PlayerStateList claiming u32::MAX records with only 24 bytes behind it.
        let mut bytes = vec![MessageTag::PlayerStateList as u8];
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(&[0u8; PLAYER_STATE_RECORD_SIZE]);
        assert_eq!(decode(&bytes), None);
    }

    #[test]
    fn count_one_short_is_rejected() {
        let msg = WireMessage::PlayerStateList(vec![player(1), player(2)]);
        let mut bytes = msg.encode().unwrap();
        bytes[1] = 3;
        assert_eq!(decode(&bytes), None);
    }

    #[test]
    fn invalid_bool_is_rejected() {
        let mut bytes = WireMessage::LogicCell(LogicCell::Wall { walkable: true })
            .encode()
            .unwrap();
        bytes[1] = 2;
        assert_eq!(decode(&bytes), None);
    }

    #[test]
    fn invalid_door_type_is_rejected() {
        let mut bytes = WireMessage::LogicCell(LogicCell::closed_door(DoorType::Section, 1))
            .encode()
            .unwrap();
        bytes[2] = 9;
        assert_eq!(decode(&bytes), None);
    }

    #[test]
    fn tag_parsing_is_closed() {
        for value in 0u8..=12 {
            let tag = MessageTag::from_u8(value).unwrap();
            assert_eq!(tag as u8, value);
        }
        assert!(MessageTag::from_u8(13).is_none());
    }

    #[test]
    fn encoding_is_deterministic() {
        let msg = &sample_messages()[3];
        assert_eq!(msg.encode().unwrap(), msg.encode().unwrap());
    }

    #[test]
    fn encode_append_reports_written_len() {
        let mut buffer = vec![0xAA];
        let msg = WireMessage::ClientReady {
            player_id: PlayerId::new(2),
        };
        let written = msg.encode_append(&mut buffer).unwrap();
        assert_eq!(written, 5);
        assert_eq!(buffer.len(), 6);
        assert_eq!(decode(&buffer[1..]), Some(msg));
    }

    #[test]
    fn codec_error_display() {
        let err = CodecError::encode("boom", CodecOperation::EncodeRecord);
        assert!(err.to_string().contains("encoding failed while encoding record"));
        let err = CodecError::decode("bad", CodecOperation::DecodeRecord);
        assert!(err.to_string().contains("decoding failed"));
        let err = CodecError::CollectionTooLarge { len: 5 };
        assert!(err.to_string().contains("32-bit"));
    }

    #[test]
    fn decode_record_reports_consumed_bytes() {
        let mut buf = Vec::new();
        encode_record(&42u32, &mut buf).unwrap();
        let (value, read): (u32, usize) = decode_record(&buf).unwrap();
        assert_eq!(value, 42);
        assert_eq!(read, 4);
        assert!(decode_record::<u64>(&buf).is_err());
    }
}
