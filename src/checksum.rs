//! Deterministic hashing of snapshots.
//!
//! `std::collections::hash_map::DefaultHasher` is randomly seeded per process, so two
//! peers hashing the same state would disagree. The checksums here are FNV-1a over the
//! snapshot's wire encoding, which is byte-for-byte identical on every platform.
//!
//! # Examples
//!
//! ```
//! use rewind_sync::checksum::{fnv1a, snapshot_checksum};
//! use rewind_sync::{PlayerId, StateSnapshot, Tick};
//!
//! let snapshot = StateSnapshot::new(Tick::new(10), PlayerId::new(1), vec![]);
//! let a = snapshot_checksum(&snapshot).expect("snapshot encodes");
//! let b = snapshot_checksum(&snapshot.clone()).expect("snapshot encodes");
//! assert_eq!(a, b);
//! assert_ne!(fnv1a(b"hello"), fnv1a(b"hellp"));
//! ```
//!
//! FNV-1a is not cryptographically secure. It only needs to catch accidental divergence.

use std::hash::Hasher;

use crate::network::codec::{CodecResult, WireMessage};
use crate::state::StateSnapshot;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// A [`Hasher`] implementing 64-bit FNV-1a with the standard offset basis.
#[derive(Debug, Clone)]
pub struct DeterministicHasher {
    state: u64,
}

impl DeterministicHasher {
    /// Creates a hasher at the FNV-1a offset basis.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: FNV_OFFSET_BASIS,
        }
    }
}

impl Default for DeterministicHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for DeterministicHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.state
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= u64::from(byte);
            self.state = self.state.wrapping_mul(FNV_PRIME);
        }
    }
}

/// FNV-1a of a byte slice.
#[inline]
#[must_use]
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hasher = DeterministicHasher::new();
    hasher.write(bytes);
    hasher.finish()
}

/// Checksum of a snapshot's wire encoding.
///
/// Two snapshots have the same checksum exactly when they encode to the same bytes, so
/// `-0.0` and `0.0` positions are told apart.
pub fn snapshot_checksum(snapshot: &StateSnapshot) -> CodecResult<u64> {
    let mut hasher = DeterministicHasher::new();
    let bytes = WireMessage::StateSnapshot(snapshot.clone()).encode()?;
    hasher.write(&bytes);
    Ok(hasher.finish())
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
    use crate::state::PlayerState;
    use crate::{PlayerId, Tick, Vec2};

    #[test]
    fn known_fnv1a_vectors() {
        assert_eq!(fnv1a(b""), FNV_OFFSET_BASIS);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a(b"foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn hasher_is_incremental() {
        let mut hasher = DeterministicHasher::default();
        hasher.write(b"foo");
        hasher.write(b"bar");
        assert_eq!(hasher.finish(), fnv1a(b"foobar"));
    }

    #[test]
    fn snapshot_checksum_tracks_content() {
        let player = PlayerState::at(PlayerId::new(1), Vec2::new(1.0, 2.0), 5.0);
        let a = StateSnapshot::new(Tick::new(3), PlayerId::new(1), vec![player]);
        let mut b = a.clone();
        assert_eq!(snapshot_checksum(&a).unwrap(), snapshot_checksum(&b).unwrap());

        b.players[0].position.x += 0.001;
        assert_ne!(snapshot_checksum(&a).unwrap(), snapshot_checksum(&b).unwrap());

        let mut c = a.clone();
        c.tick = Tick::new(4);
        assert_ne!(snapshot_checksum(&a).unwrap(), snapshot_checksum(&c).unwrap());
    }
}
