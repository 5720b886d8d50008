//! Sessions and the registry that owns them

mod handle;
pub mod namegen;
mod raw_log;
mod registry;

pub use handle::{Session, SessionInfo, SessionStatus, Subscription};
pub use raw_log::RawLog;
pub use registry::{Registry, StartOptions};
