use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::network::codec::CodecError;
use crate::{PlayerId, Tick};

/// All errors this library can return. Most fallible API functions return a [`Result<T, SyncError>`].
///
/// Conditions that are expected on a lossy network (malformed datagrams, stale snapshots,
/// a single connection dropping) are not errors; they are reported through
/// [`telemetry`](crate::telemetry) and the offending data is dropped.
///
/// [`Result<T, SyncError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SyncError {
    /// A configuration value is out of range or inconsistent with another value.
    InvalidConfig {
        /// What was wrong with the configuration.
        info: String,
    },
    /// You made an invalid request, usually by using wrong parameters for function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// The session is not in the phase the requested operation needs.
    WrongPhase {
        /// The phase the operation requires.
        expected: &'static str,
        /// The phase the session is actually in.
        actual: &'static str,
    },
    /// A tick outside the retained history window was referenced.
    TickOutOfRange {
        /// The tick that was requested.
        tick: Tick,
        /// Oldest tick still retained.
        oldest: Tick,
        /// Newest tick stored.
        newest: Tick,
    },
    /// No connection is associated with this player identity.
    UnknownPlayer {
        /// The identity that was addressed.
        player: PlayerId,
    },
    /// Serialization or deserialization of data failed.
    SerializationError {
        /// A description of what failed to serialize/deserialize.
        context: String,
    },
    /// A network socket operation failed.
    SocketError {
        /// A description of the socket error.
        context: String,
    },
    /// An internal error occurred that should not happen under normal operation.
    /// If you encounter this error, please report it as a bug.
    InternalError {
        /// A description of the internal error.
        context: String,
    },
}

impl Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::InvalidConfig { info } => {
                write!(f, "Invalid configuration: {}", info)
            },
            SyncError::InvalidRequest { info } => {
                write!(f, "Invalid Request: {}", info)
            },
            SyncError::WrongPhase { expected, actual } => {
                write!(
                    f,
                    "Operation requires the {} phase, but the session is in the {} phase",
                    expected, actual
                )
            },
            SyncError::TickOutOfRange {
                tick,
                oldest,
                newest,
            } => {
                write!(
                    f,
                    "Tick {} is outside the retained history [{}, {}]",
                    tick, oldest, newest
                )
            },
            SyncError::UnknownPlayer { player } => {
                write!(f, "No connection is associated with player {}", player)
            },
            SyncError::SerializationError { context } => {
                write!(f, "Serialization error: {}", context)
            },
            SyncError::SocketError { context } => {
                write!(f, "Socket error: {}", context)
            },
            SyncError::InternalError { context } => {
                write!(f, "Internal error (please report as bug): {}", context)
            },
        }
    }
}

impl Error for SyncError {}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::SocketError {
            context: format!("{:?}: {}", err.kind(), err),
        }
    }
}

impl From<CodecError> for SyncError {
    fn from(err: CodecError) -> Self {
        SyncError::SerializationError {
            context: err.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::network::codec::CodecOperation;

    #[test]
    fn display_mentions_tick_window() {
        let err = SyncError::TickOutOfRange {
            tick: Tick::new(3),
            oldest: Tick::new(10),
            newest: Tick::new(73),
        };
        let msg = err.to_string();
        assert!(msg.contains('3'));
        assert!(msg.contains("[10, 73]"));
    }

    #[test]
    fn display_wrong_phase() {
        let err = SyncError::WrongPhase {
            expected: "play",
            actual: "init",
        };
        assert_eq!(
            err.to_string(),
            "Operation requires the play phase, but the session is in the init phase"
        );
    }

    #[test]
    fn io_error_converts_to_socket_error() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer gone");
        let err: SyncError = io.into();
        match err {
            SyncError::SocketError { context } => {
                assert!(context.contains("ConnectionReset"));
                assert!(context.contains("peer gone"));
            },
            other => panic!("unexpected variant {other:?}"),
        }
    }

    #[test]
    fn codec_error_converts_to_serialization_error() {
        let err: SyncError = CodecError::encode("boom", CodecOperation::EncodeRecord).into();
        assert!(matches!(err, SyncError::SerializationError { .. }));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn unknown_player_display() {
        let err = SyncError::UnknownPlayer {
            player: PlayerId::new(7),
        };
        assert!(err.to_string().contains('7'));
    }
}
