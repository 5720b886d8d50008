mod settings;

pub use settings::{ClientSettings, SessionSettings, Settings};
