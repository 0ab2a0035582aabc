//! Configuration for transports and prediction.
//!
//! | Config Type | Purpose | Key Presets |
//! |-------------|---------|-------------|
//! | `TransportConfig` | Reliable channel timing and limits | `lan()`, `lossy()`, `local_test()` |
//! | `PredictionConfig` | History sizing and tick loop | `init_phase()`, `responsive()` |
//! | `InputWindow` | How far back each input message reaches | `Bounded`, `SinceRemoteTick`, `FixedLookback` |
//!
//! # Example
//!
//! ```
//! use rewind_sync::{InputWindow, PredictionConfig, TransportConfig};
//! use web_time::Duration;
//!
//! let transport = TransportConfig {
//!     connection_timeout: Duration::from_secs(1),
//!     ..TransportConfig::lan()
//! };
//! assert!(transport.validate().is_ok());
//!
//! let prediction = PredictionConfig {
//!     input_window: InputWindow::FixedLookback(12),
//!     ..PredictionConfig::default()
//! };
//! assert!(prediction.validate().is_ok());
//! ```

use web_time::Duration;

use crate::tick_history::{INIT_HISTORY_CAPACITY, PLAY_HISTORY_CAPACITY};
use crate::{SyncError, Tick};

/// Default port of the reliable channel.
pub const DEFAULT_PORT: u16 = 9051;

/// Timing and limits of the reliable stream channel.
///
/// New fields may be added; construct with `..TransportConfig::default()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "TransportConfig has no effect unless passed to ConnectionManager::start() or ReliableClient::connect()"]
pub struct TransportConfig {
    /// Port the server listens on. Use 0 to let the OS pick.
    ///
    /// Default: 9051
    pub port: u16,

    /// Number of acceptor threads, and therefore the maximum number of connections served
    /// at once.
    ///
    /// Default: 12
    pub max_acceptors: usize,

    /// A connection that has not delivered a frame within this window is dropped. Also the
    /// stream read timeout.
    ///
    /// Default: 500ms
    pub connection_timeout: Duration,

    /// Interval between keep-alive frames to every known identity.
    ///
    /// Default: 250ms
    pub keepalive_interval: Duration,

    /// How long the client waits before reconnecting after its stream drops.
    ///
    /// Default: 250ms
    pub reconnect_delay: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_acceptors: 12,
            connection_timeout: Duration::from_millis(500),
            keepalive_interval: Duration::from_millis(250),
            reconnect_delay: Duration::from_millis(250),
        }
    }
}

impl TransportConfig {
    /// Creates a new `TransportConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Local network play: short timeouts so dead peers are noticed quickly.
    pub fn lan() -> Self {
        Self {
            connection_timeout: Duration::from_millis(300),
            keepalive_interval: Duration::from_millis(100),
            reconnect_delay: Duration::from_millis(100),
            ..Self::default()
        }
    }

    /// Lossy or high-latency links: tolerate long silences before dropping a peer.
    pub fn lossy() -> Self {
        Self {
            connection_timeout: Duration::from_secs(2),
            keepalive_interval: Duration::from_millis(500),
            reconnect_delay: Duration::from_millis(500),
            ..Self::default()
        }
    }

    /// Loopback tests: OS-assigned port, few acceptors, fast reconnects.
    pub fn local_test() -> Self {
        Self {
            port: 0,
            max_acceptors: 4,
            connection_timeout: Duration::from_millis(500),
            keepalive_interval: Duration::from_millis(100),
            reconnect_delay: Duration::from_millis(50),
        }
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidConfig`] if there are no acceptors, any duration is zero, or
    /// the keep-alive interval is not shorter than the connection timeout.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.max_acceptors == 0 {
            return Err(SyncError::InvalidConfig {
                info: "max_acceptors must be at least 1".to_owned(),
            });
        }
        for (field, value) in [
            ("connection_timeout", self.connection_timeout),
            ("keepalive_interval", self.keepalive_interval),
            ("reconnect_delay", self.reconnect_delay),
        ] {
            if value.is_zero() {
                return Err(SyncError::InvalidConfig {
                    info: format!("{field} must be non-zero"),
                });
            }
        }
        if self.keepalive_interval >= self.connection_timeout {
            return Err(SyncError::InvalidConfig {
                info: format!(
                    "keepalive_interval ({:?}) must be shorter than connection_timeout ({:?})",
                    self.keepalive_interval, self.connection_timeout
                ),
            });
        }
        Ok(())
    }
}

/// Which ticks each outgoing [`InputMessage`](crate::InputMessage) covers.
///
/// Every message ends at the newest tick; the policies differ in where it starts. The
/// start is always clamped to the retained history, so a message never reaches for an
/// input that was already overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputWindow {
    /// From the last tick the server acknowledged with a snapshot.
    ///
    /// Unbounded while no snapshot arrives; the history capacity is the only cap.
    SinceRemoteTick,
    /// A fixed number of ticks before the newest one.
    FixedLookback(u32),
    /// From the acknowledged tick, but never more than `lookback` ticks back.
    Bounded {
        /// Upper bound on how far back a message reaches.
        lookback: u32,
    },
}

impl InputWindow {
    /// First tick to send, given the last acknowledged tick, the newest stored tick and the
    /// oldest retained tick.
    #[must_use]
    pub fn start_tick(&self, remote: Option<Tick>, newest: Tick, oldest: Tick) -> Tick {
        let start = match *self {
            Self::SinceRemoteTick => remote.unwrap_or(oldest),
            Self::FixedLookback(lookback) => newest.wrapping_sub(lookback),
            Self::Bounded { lookback } => {
                let floor = newest.wrapping_sub(lookback);
                remote.map_or(floor, |remote| remote.latest(floor))
            },
        };
        if start.is_before(oldest) {
            oldest
        } else if start.is_after(newest) {
            newest
        } else {
            start
        }
    }
}

impl Default for InputWindow {
    fn default() -> Self {
        Self::Bounded {
            lookback: 2 * PredictionConfig::DEFAULT_SIMULATION_BUFFER,
        }
    }
}

/// Sizing and pacing of the prediction loop.
///
/// New fields may be added; construct with `..PredictionConfig::default()`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[must_use = "PredictionConfig has no effect unless passed to ClientSessionBuilder::with_prediction_config()"]
pub struct PredictionConfig {
    /// Slots in each history ring. Must be a power of two.
    ///
    /// Default: 64
    pub history_capacity: usize,

    /// How far the client may run ahead of (or fall behind) the server before it is
    /// snapped back. Usually overwritten by the server's `GameStart`.
    ///
    /// Default: 4
    pub simulation_buffer: u32,

    /// Seconds simulated per tick.
    ///
    /// Default: 1/50
    pub fixed_delta: f32,

    /// Which ticks each outgoing input message covers.
    ///
    /// Default: `Bounded { lookback: 8 }` (twice the simulation buffer)
    pub input_window: InputWindow,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            history_capacity: PLAY_HISTORY_CAPACITY,
            simulation_buffer: Self::DEFAULT_SIMULATION_BUFFER,
            fixed_delta: 1.0 / 50.0,
            input_window: InputWindow::default(),
        }
    }
}

impl PredictionConfig {
    /// Default simulation buffer, in ticks.
    pub const DEFAULT_SIMULATION_BUFFER: u32 = 4;

    /// Creates a new `PredictionConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Large history for the connecting phase, when the server's pace is still unknown.
    pub fn init_phase() -> Self {
        Self {
            history_capacity: INIT_HISTORY_CAPACITY,
            ..Self::default()
        }
    }

    /// Small buffer and a 60 Hz tick for fast-paced play on good links.
    pub fn responsive() -> Self {
        Self {
            simulation_buffer: 2,
            fixed_delta: 1.0 / 60.0,
            input_window: InputWindow::Bounded { lookback: 4 },
            ..Self::default()
        }
    }

    /// Replaces the simulation buffer. A `Bounded` window still at twice the old buffer
    /// is rescaled to twice the new one.
    pub fn with_simulation_buffer(mut self, simulation_buffer: u32) -> Self {
        if self.input_window
            == (InputWindow::Bounded {
                lookback: self.simulation_buffer.saturating_mul(2),
            })
        {
            self.input_window = InputWindow::Bounded {
                lookback: simulation_buffer.saturating_mul(2),
            };
        }
        self.simulation_buffer = simulation_buffer;
        self
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidConfig`] if the capacity is not a power of two, the history
    /// cannot hold the buffer on both sides of the remote tick, or the delta is not a
    /// positive finite number.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.history_capacity < 2 || !self.history_capacity.is_power_of_two() {
            return Err(SyncError::InvalidConfig {
                info: format!(
                    "history_capacity must be a power of two >= 2, got {}",
                    self.history_capacity
                ),
            });
        }
        if (self.simulation_buffer as usize).saturating_mul(2) >= self.history_capacity {
            return Err(SyncError::InvalidConfig {
                info: format!(
                    "simulation_buffer {} needs a history larger than {} ticks (capacity is {})",
                    self.simulation_buffer,
                    2 * self.simulation_buffer as usize,
                    self.history_capacity
                ),
            });
        }
        if !self.fixed_delta.is_finite() || self.fixed_delta <= 0.0 {
            return Err(SyncError::InvalidConfig {
                info: format!("fixed_delta must be positive, got {}", self.fixed_delta),
            });
        }
        Ok(())
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
    fn defaults_and_presets_validate() {
        TransportConfig::default().validate().unwrap();
        TransportConfig::lan().validate().unwrap();
        TransportConfig::lossy().validate().unwrap();
        TransportConfig::local_test().validate().unwrap();
        PredictionConfig::default().validate().unwrap();
        PredictionConfig::init_phase().validate().unwrap();
        PredictionConfig::responsive().validate().unwrap();
    }

    #[test]
    fn transport_defaults() {
        let config = TransportConfig::new();
        assert_eq!(config.port, 9051);
        assert_eq!(config.max_acceptors, 12);
        assert_eq!(config.connection_timeout, Duration::from_millis(500));
    }

    #[test]
    fn transport_rejects_bad_values() {
        let no_acceptors = TransportConfig {
            max_acceptors: 0,
            ..TransportConfig::default()
        };
        assert!(matches!(
            no_acceptors.validate(),
            Err(SyncError::InvalidConfig { .. })
        ));

        let slow_keepalive = TransportConfig {
            keepalive_interval: Duration::from_secs(1),
            ..TransportConfig::default()
        };
        assert!(slow_keepalive.validate().is_err());

        let zero_delay = TransportConfig {
            reconnect_delay: Duration::ZERO,
            ..TransportConfig::default()
        };
        assert!(zero_delay.validate().is_err());
    }

    #[test]
    fn prediction_rejects_bad_values() {
        for config in [
            PredictionConfig {
                history_capacity: 48,
                ..PredictionConfig::default()
            },
            PredictionConfig {
                simulation_buffer: 32,
                ..PredictionConfig::default()
            },
            PredictionConfig {
                fixed_delta: 0.0,
                ..PredictionConfig::default()
            },
            PredictionConfig {
                fixed_delta: f32::NAN,
                ..PredictionConfig::default()
            },
        ] {
            assert!(config.validate().is_err(), "{config:?}");
        }
    }

    #[test]
    fn window_policies() {
        let newest = Tick::new(100);
        let oldest = Tick::new(37);
        let remote = Some(Tick::new(95));

        assert_eq!(
            InputWindow::SinceRemoteTick.start_tick(remote, newest, oldest),
            Tick::new(95)
        );
        assert_eq!(
            InputWindow::SinceRemoteTick.start_tick(None, newest, oldest),
            oldest
        );
        assert_eq!(
            InputWindow::FixedLookback(10).start_tick(remote, newest, oldest),
            Tick::new(90)
        );
        assert_eq!(
            InputWindow::Bounded { lookback: 8 }.start_tick(remote, newest, oldest),
            Tick::new(95)
        );
        assert_eq!(
            InputWindow::Bounded { lookback: 8 }.start_tick(Some(Tick::new(50)), newest, oldest),
            Tick::new(92)
        );
    }

    #[test]
    fn window_is_clamped_to_history() {
        let newest = Tick::new(100);
        let oldest = Tick::new(90);
        assert_eq!(
            InputWindow::FixedLookback(50).start_tick(None, newest, oldest),
            oldest
        );
        // A remote tick ahead of the local history never produces an empty window.
        assert_eq!(
            InputWindow::SinceRemoteTick.start_tick(Some(Tick::new(140)), newest, oldest),
            newest
        );
    }

    #[test]
    fn window_across_wrap() {
        let newest = Tick::new(3);
        let oldest = Tick::new(u32::MAX - 60);
        assert_eq!(
            InputWindow::FixedLookback(5).start_tick(None, newest, oldest),
            Tick::new(u32::MAX - 1)
        );
    }

    #[test]
    fn buffer_change_rescales_default_window() {
        let config = PredictionConfig::default().with_simulation_buffer(6);
        assert_eq!(config.simulation_buffer, 6);
        assert_eq!(config.input_window, InputWindow::Bounded { lookback: 12 });

        let custom = PredictionConfig {
            input_window: InputWindow::FixedLookback(3),
            ..PredictionConfig::default()
        }
        .with_simulation_buffer(6);
        assert_eq!(custom.input_window, InputWindow::FixedLookback(3));
    }
}
