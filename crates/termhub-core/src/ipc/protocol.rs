//! Wire protocol between the termhub daemon and its clients
//!
//! Newline-delimited JSON (ndjson) over a Unix domain socket. A connection
//! starts in request/response mode: one [`Request`] per line, answered by one
//! [`Response`] line. A `stream` request with `follow` or an `attach` request
//! upgrades the connection for good; from then on the daemon pushes
//! [`StreamFrame`]s and, for attach, the client sends [`AttachFrame`]s.
//!
//! Raw terminal bytes travel as JSON arrays of numbers.

use std::path::PathBuf;

use nix::unistd::getuid;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// Daemon version reported by `version`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Per-user runtime directory, preferring XDG_RUNTIME_DIR for security
pub fn state_dir() -> PathBuf {
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(xdg) if !xdg.is_empty() => PathBuf::from(xdg).join("termhub"),
        _ => PathBuf::from(format!("/tmp/termhub-{}", getuid())),
    }
}

/// Socket path used when settings do not name one
pub fn default_socket_path() -> PathBuf {
    state_dir().join("daemon.sock")
}

/// A client request, tagged by `action`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Request {
    /// One line per session
    List,
    /// Spawn a session running `command`
    Start {
        command: String,
        /// Session id; generated when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },
    /// Stop one session, or every session when `id` is absent
    Stop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// Upgrade to an interactive attach
    Attach { id: String },
    /// Rendered screen text
    Stdout {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lines: Option<usize>,
    },
    /// Raw output bytes
    Stream {
        id: String,
        /// Continue from this connection's previous `since_last` read
        #[serde(default)]
        since_last: bool,
        #[serde(default = "default_true")]
        strip_ansi: bool,
        /// Explicit resume offset, from a previous response's `cursor`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<u64>,
        /// Keep the connection open and push new output as it arrives
        #[serde(default)]
        follow: bool,
    },
    /// Input tokens, translated from key names unless `literal`
    Stdin {
        id: String,
        data: Vec<String>,
        #[serde(default)]
        literal: bool,
    },
    /// Signed so out-of-range values reach validation instead of failing decode
    Resize { id: String, cols: i64, rows: i64 },
    TermSize { id: String },
    Version,
    KillServer,
}

fn default_true() -> bool {
    true
}

/// Wire names of every action, for telling unknown actions from malformed ones
const ACTIONS: &[&str] = &[
    "list",
    "start",
    "stop",
    "attach",
    "stdout",
    "stream",
    "stdin",
    "resize",
    "term-size",
    "version",
    "kill-server",
];

impl Request {
    /// Decode one request line.
    ///
    /// A well-formed object whose `action` is not recognized fails with
    /// [`Error::UnknownAction`]; anything else undecodable is a protocol error.
    pub fn decode(line: &[u8]) -> Result<Self> {
        serde_json::from_slice(line).map_err(|e| {
            let action = serde_json::from_slice::<serde_json::Value>(line)
                .ok()
                .and_then(|v| v.get("action")?.as_str().map(str::to_string));
            match action {
                Some(action) if !ACTIONS.contains(&action.as_str()) => {
                    Error::UnknownAction(action)
                }
                _ => Error::Protocol(e.to_string()),
            }
        })
    }
}

/// Successful response bodies, tagged by `type`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Id { id: String },
    Text { text: String },
    Status { message: String },
    Size { cols: u16, rows: u16 },
    Stream { data: Vec<u8>, cursor: u64 },
    Attached { id: String },
    Version { version: String },
}

/// A response line: a payload or `{error, kind}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Error { error: String, kind: ErrorKind },
    Ok(Payload),
}

impl Response {
    pub fn status(message: impl Into<String>) -> Self {
        Response::Ok(Payload::Status {
            message: message.into(),
        })
    }

    /// Turn a received response back into a result
    pub fn into_result(self) -> Result<Payload> {
        match self {
            Response::Ok(payload) => Ok(payload),
            Response::Error { error, kind } => Err(Error::Remote {
                kind,
                message: error,
            }),
        }
    }
}

impl From<Error> for Response {
    fn from(e: Error) -> Self {
        Response::Error {
            error: e.to_string(),
            kind: e.kind(),
        }
    }
}

impl From<Result<Payload>> for Response {
    fn from(result: Result<Payload>) -> Self {
        match result {
            Ok(payload) => Response::Ok(payload),
            Err(e) => e.into(),
        }
    }
}

/// Daemon → client frames after a connection upgrade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum StreamFrame {
    /// Session output, in arrival order
    Output { data: Vec<u8> },
    /// The session ended; no more frames follow
    Exit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
    },
    /// Detach acknowledged; the session keeps running
    Detached,
    /// This subscriber fell too far behind and was cut off
    Dropped,
    Error { error: String },
}

/// Client → daemon frames during an attach
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum AttachFrame {
    Input { data: Vec<u8> },
    Resize { cols: u16, rows: u16 },
    Detach,
}

/// Encode a message as ndjson (JSON + newline)
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let mut json = serde_json::to_vec(msg)?;
    json.push(b'\n');
    Ok(json)
}

/// Decode a message from a JSON line
pub fn decode<T: DeserializeOwned>(line: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(line)?)
}
