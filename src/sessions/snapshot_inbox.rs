//! Hand-off of authoritative snapshots from the transport into the tick loop.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::state::StateSnapshot;
use crate::Tick;

/// A single-slot mailbox for the latest authoritative [`StateSnapshot`].
///
/// The receive side calls [`offer`](Self::offer) from whatever thread reads the socket;
/// the tick loop calls [`take`](Self::take) once per fixed step. Only the newest
/// snapshot matters, so an older one arriving late never replaces a newer pending one.
/// Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct SnapshotInbox {
    slot: Arc<Mutex<Option<StateSnapshot>>>,
}

impl SnapshotInbox {
    /// Creates an empty inbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `snapshot` unless a newer one is already pending.
    ///
    /// Returns `true` if the snapshot was kept.
    pub fn offer(&self, snapshot: StateSnapshot) -> bool {
        let mut slot = self.slot.lock();
        match slot.as_ref() {
            Some(pending) if !snapshot.tick.is_after(pending.tick) => false,
            _ => {
                *slot = Some(snapshot);
                true
            },
        }
    }

    /// Removes and returns the pending snapshot.
    #[must_use]
    pub fn take(&self) -> Option<StateSnapshot> {
        self.slot.lock().take()
    }

    /// Tick of the pending snapshot, if any.
    #[must_use]
    pub fn pending_tick(&self) -> Option<Tick> {
        self.slot.lock().as_ref().map(|snapshot| snapshot.tick)
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

    fn snapshot(tick: u32) -> StateSnapshot {
        StateSnapshot::new(Tick::new(tick), PlayerId::new(0), Vec::new())
    }

    #[test]
    fn keeps_only_the_newest() {
        let inbox = SnapshotInbox::new();
        assert!(inbox.offer(snapshot(10)));
        assert!(!inbox.offer(snapshot(9)));
        assert!(!inbox.offer(snapshot(10)));
        assert!(inbox.offer(snapshot(12)));
        assert_eq!(inbox.pending_tick(), Some(Tick::new(12)));
        assert_eq!(inbox.take().unwrap().tick, Tick::new(12));
        assert!(inbox.take().is_none());
    }

    #[test]
    fn newest_is_judged_across_the_wrap() {
        let inbox = SnapshotInbox::new();
        inbox.offer(snapshot(u32::MAX));
        assert!(inbox.offer(snapshot(1)));
        assert_eq!(inbox.pending_tick(), Some(Tick::new(1)));
    }

    #[test]
    fn clones_share_the_slot() {
        let inbox = SnapshotInbox::new();
        let receiver_side = inbox.clone();
        let handle = std::thread::spawn(move || {
            receiver_side.offer(snapshot(3));
        });
        handle.join().unwrap();
        assert_eq!(inbox.take().unwrap().tick, Tick::new(3));
    }
}
