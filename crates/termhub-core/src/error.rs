//! Error taxonomy shared by the daemon, the router and the client.
//!
//! Daemon-side failures travel back over the socket as `{error, kind}` so the
//! client can tell "unknown session" apart from "no daemon" without parsing
//! message text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for session and protocol operations
#[derive(Debug, Error)]
pub enum Error {
    /// Bad client configuration or command-line input; rejected before any
    /// connection attempt
    #[error("{0}")]
    Config(String),

    /// The requested session does not exist
    #[error("session not found: {id}")]
    NotFound { id: String },

    /// A live session already owns this id
    #[error("session already exists: {id}")]
    DuplicateSession { id: String },

    /// The session's child has exited; it no longer accepts input
    #[error("session is not running: {id}")]
    NotRunning { id: String },

    /// The child process could not be created
    #[error("failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    /// The daemon socket is absent or unreachable
    #[error("no server running on {path}")]
    NoServer { path: String },

    /// A request or response could not be decoded
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The request's action tag is not one the daemon knows
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// A field failed validation (e.g. a non-positive terminal size)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O failure talking to a pty or socket
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A failure reported by the daemon, as received by a client
    #[error("{message}")]
    Remote { kind: ErrorKind, message: String },
}

/// Machine-readable error category carried in failure responses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    NotFound,
    DuplicateSession,
    NotRunning,
    Spawn,
    NoServer,
    Protocol,
    UnknownAction,
    InvalidArgument,
    Io,
    #[default]
    Other,
}

impl Error {
    /// Category of this error, as sent on the wire
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::DuplicateSession { .. } => ErrorKind::DuplicateSession,
            Error::NotRunning { .. } => ErrorKind::NotRunning,
            Error::Spawn { .. } => ErrorKind::Spawn,
            Error::NoServer { .. } => ErrorKind::NoServer,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::UnknownAction(_) => ErrorKind::UnknownAction,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Io(_) => ErrorKind::Io,
            Error::Remote { kind, .. } => *kind,
        }
    }

    pub(crate) fn not_found(id: &str) -> Self {
        Error::NotFound { id: id.to_string() }
    }

    pub(crate) fn not_running(id: &str) -> Self {
        Error::NotRunning { id: id.to_string() }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::NotFound {
            id: "build".to_string(),
        };
        assert_eq!(err.to_string(), "session not found: build");

        let err = Error::Spawn {
            command: "nope".to_string(),
            reason: "No such file or directory".to_string(),
        };
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_error_kind_serialization() {
        let json = serde_json::to_string(&Error::not_running("x").kind()).unwrap();
        assert_eq!(json, "\"not_running\"");
        let kind: ErrorKind = serde_json::from_str("\"duplicate_session\"").unwrap();
        assert_eq!(kind, ErrorKind::DuplicateSession);
    }

    #[test]
    fn test_remote_error_keeps_kind() {
        let err = Error::Remote {
            kind: ErrorKind::NotFound,
            message: "session not found: x".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "session not found: x");
    }

    #[test]
    fn test_json_error_is_protocol() {
        let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }
}
