//! Logic cells describing the world layout sent during the handshake.
//!
//! The world itself is built by the host; this crate only carries it. Each grid cell
//! travels as a [`CellInfo`]: the cell kind, its id, and the nested wire encoding of the
//! concrete [`LogicCell`], which [`CellInfo::cell`] decodes back.

use crate::network::codec::{self, CodecResult, WireMessage};

/// The kind of a logic cell, as carried in [`CellInfo::cell_type`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CellKind {
    /// Impassable wall.
    Wall = 0,
    /// A door that can be opened and closed.
    Door = 1,
    /// A button that toggles doors.
    Button = 2,
    /// Walkable floor.
    Floor = 3,
}

impl CellKind {
    /// Parses a wire value, returning `None` for unknown kinds.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Wall),
            1 => Some(Self::Door),
            2 => Some(Self::Button),
            3 => Some(Self::Floor),
            _ => None,
        }
    }
}

/// Door flavours.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum DoorType {
    /// A regular door.
    #[default]
    Standard = 0,
    /// A door separating two sections of the level.
    Section = 1,
}

impl DoorType {
    /// Parses a wire value, returning `None` for unknown door types.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Standard),
            1 => Some(Self::Section),
            _ => None,
        }
    }
}

/// One logic cell of the world grid.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LogicCell {
    /// Wall cell.
    Wall {
        /// Whether players can walk through it.
        walkable: bool,
    },
    /// Door cell.
    Door {
        /// Whether players can walk through it (open doors are walkable).
        walkable: bool,
        /// What kind of door this is.
        door_type: DoorType,
        /// Whether the door is currently closed.
        is_closed: bool,
        /// Identifier buttons use to address this door.
        cell_id: i32,
    },
    /// Button cell.
    Button {
        /// Whether players can walk through it.
        walkable: bool,
    },
    /// Floor cell.
    Floor {
        /// Whether players can walk through it.
        walkable: bool,
    },
}

impl LogicCell {
    /// The kind tag of this cell.
    #[must_use]
    pub const fn kind(&self) -> CellKind {
        match self {
            LogicCell::Wall { .. } => CellKind::Wall,
            LogicCell::Door { .. } => CellKind::Door,
            LogicCell::Button { .. } => CellKind::Button,
            LogicCell::Floor { .. } => CellKind::Floor,
        }
    }

    /// Whether players can walk through this cell.
    #[must_use]
    pub const fn is_walkable(&self) -> bool {
        match self {
            LogicCell::Wall { walkable }
            | LogicCell::Door { walkable, .. }
            | LogicCell::Button { walkable }
            | LogicCell::Floor { walkable } => *walkable,
        }
    }

    /// A closed door, not walkable.
    #[must_use]
    pub const fn closed_door(door_type: DoorType, cell_id: i32) -> Self {
        LogicCell::Door {
            walkable: false,
            door_type,
            is_closed: true,
            cell_id,
        }
    }
}

/// A cell together with its grid identity, as carried by
/// [`GameStart`](crate::state::GameStart).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CellInfo {
    /// Raw [`CellKind`] value.
    pub cell_type: u8,
    /// Identifier of the cell in the grid.
    pub cell_id: i32,
    /// Nested wire encoding of the concrete [`LogicCell`].
    pub bytes: Vec<u8>,
}

impl CellInfo {
    /// Wraps `cell` with its identity, encoding it into `bytes`.
    pub fn from_cell(cell_id: i32, cell: LogicCell) -> CodecResult<Self> {
        Ok(Self {
            cell_type: cell.kind() as u8,
            cell_id,
            bytes: WireMessage::LogicCell(cell).encode()?,
        })
    }

    /// Decodes the nested cell.
    ///
    /// Returns `None` if the bytes are malformed, are not a logic cell, or disagree with
    /// `cell_type`.
    #[must_use]
    pub fn cell(&self) -> Option<LogicCell> {
        let kind = CellKind::from_u8(self.cell_type)?;
        match codec::decode(&self.bytes)? {
            WireMessage::LogicCell(cell) if cell.kind() == kind => Some(cell),
            _ => None,
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

    #[test]
    fn cell_info_wraps_and_unwraps_door() {
        let door = LogicCell::closed_door(DoorType::Section, 77);
        let info = CellInfo::from_cell(4, door).unwrap();
        assert_eq!(info.cell_type, CellKind::Door as u8);
        assert_eq!(info.cell_id, 4);
        assert_eq!(info.cell(), Some(door));
        assert!(!door.is_walkable());
    }

    #[test]
    fn cell_info_rejects_kind_mismatch() {
        let mut info = CellInfo::from_cell(1, LogicCell::Wall { walkable: false }).unwrap();
        info.cell_type = CellKind::Floor as u8;
        assert_eq!(info.cell(), None);
    }

    #[test]
    fn cell_info_rejects_garbage() {
        let info = CellInfo {
            cell_type: CellKind::Wall as u8,
            cell_id: 0,
            bytes: vec![0xEE, 0x01],
        };
        assert_eq!(info.cell(), None);
        let unknown_kind = CellInfo {
            cell_type: 42,
            ..CellInfo::default()
        };
        assert_eq!(unknown_kind.cell(), None);
    }

    #[test]
    fn kind_and_door_type_parsing() {
        assert_eq!(CellKind::from_u8(3), Some(CellKind::Floor));
        assert_eq!(CellKind::from_u8(4), None);
        assert_eq!(DoorType::from_u8(1), Some(DoorType::Section));
        assert_eq!(DoorType::from_u8(2), None);
    }
}
