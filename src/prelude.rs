//! Convenient re-exports for common usage.
//!
//! ```rust
//! use rewind_sync::prelude::*;
//!
//! let config = PredictionConfig::default();
//! assert!(config.validate().is_ok());
//! ```
//!
//! The prelude covers what a host needs to drive a client session: the session and its
//! builder, the collaborator traits it implements, the data model, configuration, and the
//! error type.

// Sessions
pub use crate::sessions::builder::ClientSessionBuilder;
pub use crate::sessions::client_session::{ClientSession, SessionEvent, SessionPhase};
pub use crate::sessions::predictor::{CatchUp, Predictor, ReconcileReport, StepOutcome};

// Collaborator traits
pub use crate::{Address, NonBlockingSocket, ReliableChannel, Simulation, StateUpdater};

// Transports
pub use crate::{ReliableClient, UdpNonBlockingSocket};

// Data model
pub use crate::{InputFrame, InputMessage, PlayerId, PlayerState, StateSnapshot, Tick, Vec2};

// Configuration
pub use crate::sessions::config::{InputWindow, PredictionConfig, TransportConfig};

// Errors
pub use crate::SyncError;
