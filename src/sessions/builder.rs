use std::sync::Arc;

use crate::error::SyncError;
use crate::sessions::client_session::ClientSession;
use crate::sessions::config::PredictionConfig;
use crate::telemetry::ViolationObserver;
use crate::{Address, NonBlockingSocket, NoopSimulation, ReliableChannel, Simulation, StateUpdater};

/// The [`ClientSessionBuilder`] builds every [`ClientSession`].
///
/// Register the state updaters and the shared simulation, adjust the prediction settings,
/// then consume the builder with [`start_session`](Self::start_session) (connected to a
/// server) or [`start_offline`](Self::start_offline).
///
/// ```
/// use rewind_sync::prelude::*;
///
/// # fn main() -> Result<(), SyncError> {
/// let mut session = ClientSessionBuilder::new()
///     .with_prediction_config(PredictionConfig::responsive())
///     .start_offline::<std::net::SocketAddr>()?;
/// session.on_frame(InputFrame::new(Vec2::new(1.0, 0.0), false));
/// let outcome = session.on_fixed_step()?;
/// assert_eq!(outcome.tick, Tick::new(1));
/// # Ok(())
/// # }
/// ```
#[must_use = "ClientSessionBuilder must be consumed by calling start_session() or start_offline()"]
pub struct ClientSessionBuilder {
    /// Sizing and pacing of the prediction loop.
    prediction_config: PredictionConfig,
    /// Updaters in registration order; their index is what reconcile reports refer to.
    updaters: Vec<Box<dyn StateUpdater>>,
    /// Shared world step, advanced once per tick.
    simulation: Option<Box<dyn Simulation>>,
    /// Optional observer for violations.
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for ClientSessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure so a new field cannot be forgotten here.
        let Self {
            prediction_config,
            updaters,
            simulation,
            violation_observer,
        } = self;

        f.debug_struct("ClientSessionBuilder")
            .field("prediction_config", prediction_config)
            .field(
                "updaters",
                &updaters.iter().map(|u| u.name()).collect::<Vec<_>>(),
            )
            .field("has_simulation", &simulation.is_some())
            .field("has_violation_observer", &violation_observer.is_some())
            .finish()
    }
}

impl Default for ClientSessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientSessionBuilder {
    /// Construct a new builder with all values set to their defaults.
    pub fn new() -> Self {
        Self {
            prediction_config: PredictionConfig::default(),
            updaters: Vec::new(),
            simulation: None,
            violation_observer: None,
        }
    }

    /// Replaces the prediction settings. The simulation buffer is overwritten later by
    /// the server's `GameStart`.
    pub fn with_prediction_config(mut self, config: PredictionConfig) -> Self {
        self.prediction_config = config;
        self
    }

    /// Registers a state updater. Updaters are stepped in registration order.
    pub fn with_updater(mut self, updater: impl StateUpdater + 'static) -> Self {
        self.updaters.push(Box::new(updater));
        self
    }

    /// Sets the shared simulation. Defaults to [`NoopSimulation`].
    pub fn with_simulation(mut self, simulation: impl Simulation + 'static) -> Self {
        self.simulation = Some(Box::new(simulation));
        self
    }

    /// Sets a custom observer for violations.
    ///
    /// By default violations are logged through `tracing`. Tests typically pass a
    /// [`CollectingObserver`](crate::telemetry::CollectingObserver) to assert on them.
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// Starts a session that handshakes with the server at `server` over `reliable` and
    /// exchanges gameplay traffic through `socket`.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidConfig`] if the prediction settings do not validate.
    pub fn start_session<A: Address>(
        self,
        reliable: impl ReliableChannel + 'static,
        socket: impl NonBlockingSocket<A> + 'static,
        server: A,
    ) -> Result<ClientSession<A>, SyncError> {
        self.prediction_config.validate()?;
        Ok(ClientSession::new(
            self.prediction_config,
            self.updaters,
            self.simulation.unwrap_or_else(|| Box::new(NoopSimulation)),
            self.violation_observer,
            Box::new(reliable),
            Box::new(socket),
            server,
        ))
    }

    /// Starts a session already in the play phase, without a server.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidConfig`] if the prediction settings do not validate.
    pub fn start_offline<A: Address>(self) -> Result<ClientSession<A>, SyncError> {
        self.prediction_config.validate()?;
        let mut session = ClientSession::new_offline(
            self.prediction_config,
            self.updaters,
            self.simulation.unwrap_or_else(|| Box::new(NoopSimulation)),
            self.violation_observer,
        );
        session.play_offline()?;
        Ok(session)
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
    use crate::sessions::client_session::SessionPhase;
    use crate::telemetry::CollectingObserver;
    use crate::{InputFrame, StateSnapshot};

    struct Named;

    impl StateUpdater for Named {
        fn name(&self) -> &'static str {
            "named"
        }

        fn step(&mut self, _: &StateSnapshot, _: &mut StateSnapshot, _: &InputFrame, _: f32) {}

        fn needs_correction(&self, _: &StateSnapshot, _: &StateSnapshot) -> bool {
            false
        }

        fn update_from_authoritative(&mut self, _: &mut StateSnapshot, _: &StateSnapshot) {}
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = PredictionConfig {
            history_capacity: 48,
            ..PredictionConfig::default()
        };
        let result = ClientSessionBuilder::new()
            .with_prediction_config(config)
            .start_offline::<u8>();
        assert!(matches!(result, Err(SyncError::InvalidConfig { .. })));
    }

    #[test]
    fn offline_start_is_in_play_with_registered_updaters() {
        let session = ClientSessionBuilder::new()
            .with_updater(Named)
            .with_updater(Named)
            .with_violation_observer(Arc::new(CollectingObserver::new()))
            .start_offline::<u8>()
            .unwrap();
        assert_eq!(session.phase(), SessionPhase::Play);
        assert_eq!(session.predictor().unwrap().updater_count(), 2);
    }

    #[test]
    fn debug_lists_updater_names() {
        let builder = ClientSessionBuilder::new().with_updater(Named);
        let text = format!("{builder:?}");
        assert!(text.contains("named"));
        assert!(text.contains("has_simulation: false"));
    }
}
