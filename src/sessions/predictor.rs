//! The fixed-tick prediction loop and its reconciliation against server snapshots.

use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::checksum::snapshot_checksum;
use crate::error::SyncError;
use crate::input::{InputFrame, InputMessage};
use crate::sessions::config::PredictionConfig;
use crate::sessions::snapshot_inbox::SnapshotInbox;
use crate::state::StateSnapshot;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::tick_history::TickHistory;
use crate::{debug_check_invariants, report_violation_to, PlayerId, Simulation, StateUpdater, Tick};

/// Indices of the updaters a reconciliation pass corrected.
pub type CorrectedUpdaters = SmallVec<[usize; 4]>;

/// What one reconciliation pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Tick of the authoritative snapshot that was compared.
    pub snapshot_tick: Tick,
    /// Registration indices of the updaters that diverged and were corrected.
    pub corrected: CorrectedUpdaters,
    /// Ticks re-simulated after the snapshot tick. Zero when nothing diverged.
    pub replayed_ticks: u32,
}

impl ReconcileReport {
    /// Returns `true` if at least one updater was corrected.
    #[must_use]
    pub fn corrected_any(&self) -> bool {
        !self.corrected.is_empty()
    }
}

/// How [`Predictor::catch_up`] moved the local tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUp {
    /// The client had stalled and jumped forward.
    FastForward {
        /// Next tick to simulate before the jump.
        from: Tick,
        /// Next tick to simulate after the jump.
        to: Tick,
    },
    /// The client had run too far ahead and was pulled back.
    Clamp {
        /// Next tick to simulate before the clamp.
        from: Tick,
        /// Next tick to simulate after the clamp.
        to: Tick,
    },
}

/// Result of one [`Predictor::on_fixed_step`].
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// The tick that was simulated.
    pub tick: Tick,
    /// Redundant input window to send to the server.
    pub input_message: InputMessage,
    /// Present if a pending snapshot was processed this step.
    pub reconcile: Option<ReconcileReport>,
    /// Present if the local tick was moved to stay within the simulation buffer.
    pub catch_up: Option<CatchUp>,
}

/// Client-side predictor: steps the local simulation every tick and rewinds the
/// subsystems that diverged from the server.
///
/// The predictor owns the [`TickHistory`], the registered [`StateUpdater`]s and the
/// shared [`Simulation`]. It never blocks and never touches the network: snapshots arrive
/// through its [`SnapshotInbox`] and outgoing input comes back in the [`StepOutcome`].
///
/// # Ticks
///
/// [`local_tick`](Self::local_tick) is the next tick to simulate; the history's newest
/// tick is always the one before it. A snapshot for tick `T` is compared against the
/// stored prediction for `T`, and ticks `T + 1 ..= newest` are replayed for the updaters
/// that diverged.
pub struct Predictor {
    player_id: PlayerId,
    config: PredictionConfig,
    updaters: Vec<Box<dyn StateUpdater>>,
    simulation: Box<dyn Simulation>,
    history: TickHistory,
    remote_tick: Option<Tick>,
    inbox: SnapshotInbox,
    observer: Option<Arc<dyn ViolationObserver>>,
}

impl Predictor {
    /// Creates a predictor whose history is seeded with `initial`.
    ///
    /// The first simulated tick is `initial.tick + 1`.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidConfig`] if `config` does not validate.
    pub fn new(
        player_id: PlayerId,
        config: PredictionConfig,
        initial: StateSnapshot,
        simulation: Box<dyn Simulation>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let history = TickHistory::new(config.history_capacity, initial)?;
        Ok(Self {
            player_id,
            config,
            updaters: Vec::new(),
            simulation,
            history,
            remote_tick: None,
            inbox: SnapshotInbox::new(),
            observer: None,
        })
    }

    /// Registers an updater and returns its index, as used in [`ReconcileReport::corrected`].
    pub fn add_updater(&mut self, updater: Box<dyn StateUpdater>) -> usize {
        self.updaters.push(updater);
        self.updaters.len() - 1
    }

    /// Routes violations to `observer` instead of the tracing default.
    pub fn set_violation_observer(&mut self, observer: Option<Arc<dyn ViolationObserver>>) {
        self.observer = observer;
    }

    /// Shares this predictor's snapshot hand-off with the receive side.
    #[must_use]
    pub fn inbox(&self) -> SnapshotInbox {
        self.inbox.clone()
    }

    /// Next tick to simulate.
    #[must_use]
    pub fn local_tick(&self) -> Tick {
        self.history.newest().next()
    }

    /// Latest tick the server is known to have simulated.
    #[must_use]
    pub fn remote_tick(&self) -> Option<Tick> {
        self.remote_tick
    }

    /// Identity stamped on outgoing input messages.
    #[must_use]
    pub fn player_id(&self) -> PlayerId {
        self.player_id
    }

    /// Changes the identity stamped on outgoing input messages.
    pub fn set_player_id(&mut self, player_id: PlayerId) {
        self.player_id = player_id;
    }

    /// The active configuration.
    pub fn config(&self) -> &PredictionConfig {
        &self.config
    }

    /// Read access to the input and state history.
    #[must_use]
    pub fn history(&self) -> &TickHistory {
        &self.history
    }

    /// Number of registered updaters.
    #[must_use]
    pub fn updater_count(&self) -> usize {
        self.updaters.len()
    }

    /// State predicted for the most recently simulated tick.
    #[must_use]
    pub fn latest_state(&self) -> Option<&StateSnapshot> {
        self.history.state(self.history.newest())
    }

    /// Checksum of the stored state for `tick`, if it is still retained.
    #[must_use]
    pub fn checksum_at(&self, tick: Tick) -> Option<u64> {
        self.history
            .state(tick)
            .and_then(|state| snapshot_checksum(state).ok())
    }

    /// Runs one fixed step: simulates the next tick from `input` (neutral if `None`),
    /// builds the outgoing input window, reconciles against a pending snapshot and keeps
    /// the local tick within the simulation buffer of the server.
    pub fn on_fixed_step(&mut self, input: Option<InputFrame>) -> StepOutcome {
        let input = input.unwrap_or_else(|| InputFrame::neutral(self.local_tick()));
        let tick = self.step_tick(input);
        let input_message = self.build_input_message();

        let mut reconcile = None;
        let mut catch_up = None;
        if let Some(snapshot) = self.inbox.take() {
            reconcile = self.reconcile(&snapshot);
            // Only a fresh remote tick can move the local clock; a stale one would
            // keep clamping a client whose server has gone quiet.
            if let Some(remote) = self.remote_tick {
                catch_up = self.catch_up(remote);
            }
        }

        debug_check_invariants!(self.history, "Predictor::on_fixed_step");
        StepOutcome {
            tick,
            input_message,
            reconcile,
            catch_up,
        }
    }

    /// Stores `input` for the next tick, steps every updater once and advances the shared
    /// simulation once. Returns the simulated tick.
    pub fn step_tick(&mut self, input: InputFrame) -> Tick {
        let tick = self.history.push(input);
        self.step_updaters(tick, None);
        self.simulation.advance(self.config.fixed_delta);
        trace!(tick = %tick, player = %self.player_id, "simulated tick");
        tick
    }

    /// Builds the redundant input window ending at the newest stored tick.
    ///
    /// Where the window starts is governed by [`PredictionConfig::input_window`].
    #[must_use]
    pub fn build_input_message(&self) -> InputMessage {
        let newest = self.history.newest();
        let start = self
            .config
            .input_window
            .start_tick(self.remote_tick, newest, self.history.oldest());
        let count = newest.ticks_since(start).max(0) as u32 + 1;
        let frames = (0..count)
            .filter_map(|offset| self.history.input(start.wrapping_add(offset)).copied())
            .collect::<Vec<_>>();
        let start_tick = frames.first().map_or(start, |frame| frame.tick);
        InputMessage::new(self.player_id, start_tick, frames)
    }

    /// Compares `snapshot` against the stored prediction for its tick and corrects the
    /// updaters that diverged.
    ///
    /// Each diverging updater overwrites its slice of the stored state at the snapshot
    /// tick, then only those updaters are re-stepped for every later stored tick, with the
    /// shared simulation advanced once per replayed tick. A snapshot for the newest stored
    /// tick is corrected in place with nothing to replay. Returns `None` if the snapshot
    /// cannot be compared: it is ahead of the newest stored tick, or its tick has already
    /// left the history. The remote tick is updated either way.
    pub fn reconcile(&mut self, snapshot: &StateSnapshot) -> Option<ReconcileReport> {
        self.note_remote_tick(snapshot.tick);

        let newest = self.history.newest();
        if snapshot.tick.is_after(newest) {
            report_violation_to!(
                &self.observer,
                tick = snapshot.tick;
                ViolationSeverity::Warning,
                ViolationKind::Reconciliation,
                "snapshot for tick {} is ahead of the newest predicted tick {}",
                snapshot.tick,
                newest
            );
            return None;
        }
        let Some(local) = self.history.state(snapshot.tick) else {
            report_violation_to!(
                &self.observer,
                tick = snapshot.tick;
                ViolationSeverity::Warning,
                ViolationKind::Reconciliation,
                "snapshot for tick {} is older than the retained history (oldest {})",
                snapshot.tick,
                self.history.oldest()
            );
            return None;
        };

        let corrected: CorrectedUpdaters = self
            .updaters
            .iter()
            .enumerate()
            .filter(|(_, updater)| updater.needs_correction(local, snapshot))
            .map(|(index, _)| index)
            .collect();
        if corrected.is_empty() {
            trace!(tick = %snapshot.tick, "prediction matches snapshot");
            return Some(ReconcileReport {
                snapshot_tick: snapshot.tick,
                corrected,
                replayed_ticks: 0,
            });
        }

        if let Some(state) = self.history.state_mut(snapshot.tick) {
            for &index in &corrected {
                if let Some(updater) = self.updaters.get_mut(index) {
                    updater.update_from_authoritative(state, snapshot);
                }
            }
        }

        let mut replayed_ticks = 0;
        let mut tick = snapshot.tick.next();
        while !tick.is_after(newest) {
            self.step_updaters(tick, Some(&corrected));
            self.simulation.advance(self.config.fixed_delta);
            replayed_ticks += 1;
            tick = tick.next();
        }

        debug!(
            tick = %snapshot.tick,
            replayed = replayed_ticks,
            corrected = ?self.updater_names(&corrected),
            "reconciled with authoritative snapshot"
        );
        Some(ReconcileReport {
            snapshot_tick: snapshot.tick,
            corrected,
            replayed_ticks,
        })
    }

    /// Keeps the local tick within `simulation_buffer` ticks of `remote`.
    ///
    /// A client more than the buffer behind jumps to `remote + buffer`, filling the skipped
    /// ticks with the last stored state. A client more than the buffer ahead is pulled
    /// back to `remote`, discarding the predictions past it.
    pub fn catch_up(&mut self, remote: Tick) -> Option<CatchUp> {
        let from = self.local_tick();
        let buffer = self.config.simulation_buffer;

        if remote.ticks_since(from) > buffer as i32 {
            let to = remote.wrapping_add(buffer);
            let filled = self.history.fast_forward(to.wrapping_sub(1));
            debug!(from = %from, to = %to, filled, "fast-forwarded behind server");
            return Some(CatchUp::FastForward { from, to });
        }
        if from.ticks_since(remote) > buffer as i32 {
            self.history.rewind_to(remote.wrapping_sub(1));
            debug!(from = %from, to = %remote, "clamped to server tick");
            return Some(CatchUp::Clamp { from, to: remote });
        }
        None
    }

    fn note_remote_tick(&mut self, tick: Tick) {
        self.remote_tick = Some(self.remote_tick.map_or(tick, |known| known.latest(tick)));
    }

    /// Steps the updaters selected by `only` (all if `None`) for `tick`.
    fn step_updaters(&mut self, tick: Tick, only: Option<&[usize]>) {
        let delta = self.config.fixed_delta;
        let Some((input, previous, next)) = self.history.step_slots(tick) else {
            report_violation_to!(
                &self.observer,
                tick = tick;
                ViolationSeverity::Error,
                ViolationKind::TickHistory,
                "tick {} or its predecessor is missing from the history",
                tick
            );
            return;
        };
        for (index, updater) in self.updaters.iter_mut().enumerate() {
            if only.is_some_and(|selected| !selected.contains(&index)) {
                continue;
            }
            updater.step(previous, next, input, delta);
        }
    }

    fn updater_names(&self, indices: &[usize]) -> Vec<&'static str> {
        indices
            .iter()
            .filter_map(|&index| self.updaters.get(index))
            .map(|updater| updater.name())
            .collect()
    }
}

impl std::fmt::Debug for Predictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Predictor")
            .field("player_id", &self.player_id)
            .field("local_tick", &self.local_tick())
            .field("remote_tick", &self.remote_tick)
            .field("updaters", &self.updater_names(&(0..self.updaters.len()).collect::<Vec<_>>()))
            .field("config", &self.config)
            .finish_non_exhaustive()
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
    use crate::state::PlayerState;
    use crate::telemetry::CollectingObserver;
    use crate::Vec2;
    use std::sync::atomic::{AtomicU32, Ordering};

    const ME: PlayerId = PlayerId::new(1);

    struct Mover;

    impl StateUpdater for Mover {
        fn name(&self) -> &'static str {
            "mover"
        }

        fn step(
            &mut self,
            previous: &StateSnapshot,
            next: &mut StateSnapshot,
            input: &InputFrame,
            delta: f32,
        ) {
            if let (Some(before), Some(after)) = (previous.player(ME), next.player_mut(ME)) {
                after.position = before.position + input.movement.scaled(delta * 10.0);
            }
        }

        fn needs_correction(&self, local: &StateSnapshot, remote: &StateSnapshot) -> bool {
            match (local.player(ME), remote.player(ME)) {
                (Some(l), Some(r)) => l.position.distance(r.position) > 0.01,
                _ => false,
            }
        }

        fn update_from_authoritative(&mut self, state: &mut StateSnapshot, authoritative: &StateSnapshot) {
            if let (Some(target), Some(source)) = (state.player_mut(ME), authoritative.player(ME)) {
                target.position = source.position;
            }
        }
    }

    #[derive(Clone, Default)]
    struct Counter(Arc<AtomicU32>);

    impl Simulation for Counter {
        fn advance(&mut self, _delta: f32) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn predictor(simulation: Counter) -> Predictor {
        let initial = StateSnapshot::new(
            Tick::ZERO,
            ME,
            vec![PlayerState::at(ME, Vec2::ZERO, 10.0)],
        );
        let mut predictor =
            Predictor::new(ME, PredictionConfig::default(), initial, Box::new(simulation)).unwrap();
        predictor.add_updater(Box::new(Mover));
        predictor
    }

    fn right() -> InputFrame {
        InputFrame::new(Vec2::new(1.0, 0.0), false)
    }

    #[test]
    fn steps_advance_local_tick_and_simulation_once() {
        let sim = Counter::default();
        let mut p = predictor(sim.clone());
        let outcome = p.on_fixed_step(Some(right()));
        assert_eq!(outcome.tick, Tick::new(1));
        assert_eq!(p.local_tick(), Tick::new(2));
        assert_eq!(sim.0.load(Ordering::SeqCst), 1);
        assert!(p.latest_state().unwrap().player(ME).unwrap().position.x > 0.0);
    }

    #[test]
    fn missing_input_is_neutral() {
        let mut p = predictor(Counter::default());
        p.on_fixed_step(None);
        let stored = p.history().input(Tick::new(1)).unwrap();
        assert!(stored.is_neutral());
        assert_eq!(stored.tick, Tick::new(1));
    }

    #[test]
    fn input_message_window_is_bounded() {
        let mut p = predictor(Counter::default());
        for _ in 0..20 {
            p.on_fixed_step(Some(right()));
        }
        let msg = p.build_input_message();
        // Bounded { lookback: 8 } with no snapshot yet
        assert_eq!(msg.start_tick, Tick::new(12));
        assert_eq!(msg.end_tick(), Some(Tick::new(20)));
        assert_eq!(msg.frames.len(), 9);
        assert_eq!(msg.player_id, ME);
    }

    #[test]
    fn matching_snapshot_corrects_nothing() {
        let mut p = predictor(Counter::default());
        for _ in 0..5 {
            p.on_fixed_step(Some(right()));
        }
        let snapshot = p.history().state(Tick::new(3)).unwrap().clone();
        let report = p.reconcile(&snapshot).unwrap();
        assert!(!report.corrected_any());
        assert_eq!(report.replayed_ticks, 0);
        assert_eq!(p.remote_tick(), Some(Tick::new(3)));
    }

    #[test]
    fn divergent_snapshot_replays_to_newest() {
        let sim = Counter::default();
        let mut p = predictor(sim.clone());
        for _ in 0..10 {
            p.on_fixed_step(Some(right()));
        }
        let before = p.latest_state().unwrap().player(ME).unwrap().position;
        let mut snapshot = p.history().state(Tick::new(6)).unwrap().clone();
        snapshot.player_mut(ME).unwrap().position.y = 3.0;

        let report = p.reconcile(&snapshot).unwrap();
        assert_eq!(report.corrected.as_slice(), &[0]);
        assert_eq!(report.replayed_ticks, 4);
        assert_eq!(sim.0.load(Ordering::SeqCst), 14);
        assert_eq!(p.local_tick(), Tick::new(11));
        let after = p.latest_state().unwrap().player(ME).unwrap().position;
        assert!((after.x - before.x).abs() < 1e-5);
        assert!((after.y - 3.0).abs() < 1e-5);
    }

    #[test]
    fn snapshot_for_newest_tick_is_corrected_in_place() {
        let sim = Counter::default();
        let mut p = predictor(sim.clone());
        for _ in 0..10 {
            p.on_fixed_step(Some(right()));
        }
        let newest = p.history().newest();
        let mut snapshot = p.history().state(newest).unwrap().clone();
        snapshot.player_mut(ME).unwrap().position.x += 5.0;
        let expected = snapshot.player(ME).unwrap().position;

        let report = p.reconcile(&snapshot).unwrap();
        assert_eq!(report.snapshot_tick, Tick::new(10));
        assert_eq!(report.corrected.as_slice(), &[0]);
        assert_eq!(report.replayed_ticks, 0);
        assert_eq!(sim.0.load(Ordering::SeqCst), 10);
        assert_eq!(p.local_tick(), Tick::new(11));
        let corrected = p.latest_state().unwrap().player(ME).unwrap().position;
        assert!((corrected.x - expected.x).abs() < 1e-5);

        // The next predicted tick builds on the corrected state.
        p.on_fixed_step(Some(right()));
        let next = p.latest_state().unwrap().player(ME).unwrap().position;
        assert!(next.x > expected.x);
    }

    #[test]
    fn future_and_stale_snapshots_are_reported() {
        let observer = Arc::new(CollectingObserver::new());
        let mut p = predictor(Counter::default());
        p.set_violation_observer(Some(observer.clone()));
        for _ in 0..3 {
            p.on_fixed_step(None);
        }
        let future = StateSnapshot::new(Tick::new(9), ME, Vec::new());
        assert!(p.reconcile(&future).is_none());
        assert_eq!(p.remote_tick(), Some(Tick::new(9)));

        for _ in 0..100 {
            p.step_tick(InputFrame::default());
        }
        let stale = StateSnapshot::new(Tick::new(2), ME, Vec::new());
        assert!(p.reconcile(&stale).is_none());
        assert_eq!(p.remote_tick(), Some(Tick::new(9)));
        assert_eq!(observer.violations_of_kind(ViolationKind::Reconciliation).len(), 2);
    }

    #[test]
    fn catch_up_fast_forwards_a_stalled_client() {
        let mut p = predictor(Counter::default());
        p.on_fixed_step(None);
        let outcome = p.catch_up(Tick::new(40));
        assert_eq!(
            outcome,
            Some(CatchUp::FastForward {
                from: Tick::new(2),
                to: Tick::new(44)
            })
        );
        assert_eq!(p.local_tick(), Tick::new(44));
        assert!(p.history().input(Tick::new(43)).unwrap().is_neutral());
    }

    #[test]
    fn catch_up_clamps_a_runaway_client() {
        let mut p = predictor(Counter::default());
        for _ in 0..20 {
            p.on_fixed_step(None);
        }
        let outcome = p.catch_up(Tick::new(10));
        assert_eq!(
            outcome,
            Some(CatchUp::Clamp {
                from: Tick::new(21),
                to: Tick::new(10)
            })
        );
        assert_eq!(p.local_tick(), Tick::new(10));
        assert!(p.catch_up(Tick::new(12)).is_none());
    }

    #[test]
    fn pending_snapshot_is_consumed_by_the_next_step() {
        let mut p = predictor(Counter::default());
        for _ in 0..6 {
            p.on_fixed_step(Some(right()));
        }
        let inbox = p.inbox();
        let mut snapshot = p.history().state(Tick::new(4)).unwrap().clone();
        snapshot.player_mut(ME).unwrap().position.x = -5.0;
        inbox.offer(snapshot);

        let outcome = p.on_fixed_step(Some(right()));
        let report = outcome.reconcile.unwrap();
        assert_eq!(report.snapshot_tick, Tick::new(4));
        assert_eq!(report.replayed_ticks, 3);
        assert!(outcome.catch_up.is_none());
        assert!(inbox.take().is_none());
    }

    #[test]
    fn checksum_follows_state() {
        let mut p = predictor(Counter::default());
        p.on_fixed_step(None);
        p.on_fixed_step(Some(right()));
        let zero = p.checksum_at(Tick::new(1)).unwrap();
        let moved = p.checksum_at(Tick::new(2)).unwrap();
        assert_ne!(zero, moved);
        assert!(p.checksum_at(Tick::new(90)).is_none());
    }
}
