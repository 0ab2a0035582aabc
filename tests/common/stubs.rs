//! Deterministic collaborators for driving a predictor in tests.
//!
//! `PositionUpdater` owns every player's position and velocity, `StaminaUpdater` owns
//! their stamina. The two never touch each other's fields, which is what makes partial
//! corrections observable.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use rewind_sync::{
    InputFrame, PlayerId, PlayerState, Predictor, PredictionConfig, Simulation, StateSnapshot,
    StateUpdater, Tick, Vec2,
};

pub const LOCAL: PlayerId = PlayerId::new(1);
pub const SPEED: f32 = 5.0;
pub const SPRINT_FACTOR: f32 = 2.0;
pub const STAMINA_DRAIN: f32 = 4.0;
pub const STAMINA_REGEN: f32 = 1.0;
pub const MAX_STAMINA: f32 = 10.0;

/// Moves the local player from its input; position off by more than `tolerance` diverges.
#[derive(Debug, Clone)]
pub struct PositionUpdater {
    pub player: PlayerId,
    pub tolerance: f32,
    pub steps: Arc<AtomicU32>,
}

impl PositionUpdater {
    pub fn new(player: PlayerId) -> Self {
        Self {
            player,
            tolerance: 0.01,
            steps: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl StateUpdater for PositionUpdater {
    fn name(&self) -> &'static str {
        "position"
    }

    fn step(
        &mut self,
        previous: &StateSnapshot,
        next: &mut StateSnapshot,
        input: &InputFrame,
        delta: f32,
    ) {
        self.steps.fetch_add(1, Ordering::SeqCst);
        let Some(before) = previous.player(self.player).copied() else {
            return;
        };
        let Some(after) = next.player_mut(self.player) else {
            return;
        };
        let speed = if input.sprinting && before.stamina > 0.0 {
            SPEED * SPRINT_FACTOR
        } else {
            SPEED
        };
        after.velocity = input.movement.scaled(speed);
        after.position = before.position + after.velocity.scaled(delta);
    }

    fn needs_correction(&self, local: &StateSnapshot, remote: &StateSnapshot) -> bool {
        match (local.player(self.player), remote.player(self.player)) {
            (Some(l), Some(r)) => l.position.distance(r.position) > self.tolerance,
            (None, Some(_)) => true,
            _ => false,
        }
    }

    fn update_from_authoritative(&mut self, state: &mut StateSnapshot, authoritative: &StateSnapshot) {
        if let (Some(target), Some(source)) =
            (state.player_mut(self.player), authoritative.player(self.player))
        {
            target.position = source.position;
            target.velocity = source.velocity;
        }
    }
}

/// Drains stamina while sprinting and regenerates it otherwise.
#[derive(Debug, Clone)]
pub struct StaminaUpdater {
    pub player: PlayerId,
    pub steps: Arc<AtomicU32>,
}

impl StaminaUpdater {
    pub fn new(player: PlayerId) -> Self {
        Self {
            player,
            steps: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl StateUpdater for StaminaUpdater {
    fn name(&self) -> &'static str {
        "stamina"
    }

    fn step(
        &mut self,
        previous: &StateSnapshot,
        next: &mut StateSnapshot,
        input: &InputFrame,
        delta: f32,
    ) {
        self.steps.fetch_add(1, Ordering::SeqCst);
        let Some(before) = previous.player(self.player).copied() else {
            return;
        };
        let Some(after) = next.player_mut(self.player) else {
            return;
        };
        let change = if input.sprinting {
            -STAMINA_DRAIN
        } else {
            STAMINA_REGEN
        };
        after.stamina = (before.stamina + change * delta).clamp(0.0, MAX_STAMINA);
    }

    fn needs_correction(&self, local: &StateSnapshot, remote: &StateSnapshot) -> bool {
        match (local.player(self.player), remote.player(self.player)) {
            (Some(l), Some(r)) => (l.stamina - r.stamina).abs() > 0.5,
            _ => false,
        }
    }

    fn update_from_authoritative(&mut self, state: &mut StateSnapshot, authoritative: &StateSnapshot) {
        if let (Some(target), Some(source)) =
            (state.player_mut(self.player), authoritative.player(self.player))
        {
            target.stamina = source.stamina;
        }
    }
}

/// Counts how often the shared world was advanced.
#[derive(Debug, Clone, Default)]
pub struct CountingSimulation {
    pub advances: Arc<AtomicU32>,
}

impl CountingSimulation {
    pub fn count(&self) -> u32 {
        self.advances.load(Ordering::SeqCst)
    }
}

impl Simulation for CountingSimulation {
    fn advance(&mut self, _delta: f32) {
        self.advances.fetch_add(1, Ordering::SeqCst);
    }
}

/// Handles for inspecting a predictor built by [`predictor_with_stubs`].
#[derive(Debug, Clone)]
pub struct StubHandles {
    pub position_steps: Arc<AtomicU32>,
    pub stamina_steps: Arc<AtomicU32>,
    pub simulation: CountingSimulation,
}

pub fn initial_state() -> StateSnapshot {
    StateSnapshot::new(
        Tick::ZERO,
        LOCAL,
        vec![
            PlayerState::at(LOCAL, Vec2::ZERO, MAX_STAMINA),
            PlayerState::at(PlayerId::new(2), Vec2::new(10.0, 10.0), MAX_STAMINA),
        ],
    )
}

/// A predictor with a position updater (index 0) and a stamina updater (index 1).
pub fn predictor_with_stubs(config: PredictionConfig) -> (Predictor, StubHandles) {
    let position = PositionUpdater::new(LOCAL);
    let stamina = StaminaUpdater::new(LOCAL);
    let simulation = CountingSimulation::default();
    let handles = StubHandles {
        position_steps: Arc::clone(&position.steps),
        stamina_steps: Arc::clone(&stamina.steps),
        simulation: simulation.clone(),
    };
    let mut predictor = Predictor::new(LOCAL, config, initial_state(), Box::new(simulation))
        .expect("valid prediction config");
    predictor.add_updater(Box::new(position));
    predictor.add_updater(Box::new(stamina));
    (predictor, handles)
}

/// Deterministic input pattern: walks right, sprints every third tick.
pub fn scripted_input(tick: u32) -> InputFrame {
    let angle = tick as f32 * 0.1;
    InputFrame::new(Vec2::new(angle.cos(), angle.sin()), tick % 3 == 0)
}
