//! termhub-core: pty sessions, terminal emulation and the daemon protocol
//! behind the `termhub` command.

pub mod ansi;
pub mod config;
pub mod error;
pub mod ipc;
pub mod keys;
pub mod session;
pub mod term;

pub use error::{Error, ErrorKind, Result};
