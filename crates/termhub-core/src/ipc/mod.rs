//! Daemon IPC
//!
//! Unix domain socket with a newline-delimited JSON (ndjson) protocol. The
//! daemon owns the session registry; clients are short-lived.

pub mod client;
pub mod protocol;
pub mod router;
pub mod server;

pub use client::{Connection, DaemonClient, FrameReader, FrameWriter};
pub use protocol::{
    decode, default_socket_path, encode, state_dir, AttachFrame, Payload, Request, Response,
    StreamFrame, VERSION,
};
pub use router::{ConnectionState, Outcome, Router};
pub use server::Server;
