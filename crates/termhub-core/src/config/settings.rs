use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::ipc::default_socket_path;

/// Application settings (from config file)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Daemon socket; defaults to the per-user runtime directory
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    /// Defaults applied to newly started sessions
    #[serde(default)]
    pub session: SessionSettings,

    /// Client-side behaviour
    #[serde(default)]
    pub client: ClientSettings,
}

/// Session defaults and buffer limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Terminal width when `start` does not give one
    #[serde(default = "default_cols")]
    pub default_cols: u16,

    /// Terminal height when `start` does not give one
    #[serde(default = "default_rows")]
    pub default_rows: u16,

    /// Rendered lines kept above the screen
    #[serde(default = "default_scrollback_lines")]
    pub scrollback_lines: usize,

    /// Raw output bytes kept per session; older bytes are evicted
    #[serde(default = "default_raw_log_bytes")]
    pub raw_log_bytes: usize,

    /// Output chunks buffered per streaming or attached client
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,

    /// Shell used to run commands (falls back to $SHELL, then /bin/sh)
    #[serde(default)]
    pub shell: Option<String>,

    /// TERM exported to child processes
    #[serde(default = "default_term")]
    pub term: String,
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

fn default_scrollback_lines() -> usize {
    1000
}

fn default_raw_log_bytes() -> usize {
    1024 * 1024
}

fn default_subscriber_queue() -> usize {
    256
}

fn default_term() -> String {
    "xterm-256color".to_string()
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_cols: default_cols(),
            default_rows: default_rows(),
            scrollback_lines: default_scrollback_lines(),
            raw_log_bytes: default_raw_log_bytes(),
            subscriber_queue: default_subscriber_queue(),
            shell: None,
            term: default_term(),
        }
    }
}

impl SessionSettings {
    /// Shell used to run `-c <command>`
    pub fn shell(&self) -> String {
        self.shell
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
}

/// Client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Upper bound on a one-shot request round trip
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Chord that detaches an interactive attach (tmux notation)
    #[serde(default = "default_detach_key")]
    pub detach_key: String,
}

fn default_request_timeout() -> u64 {
    5000
}

fn default_detach_key() -> String {
    "C-\\".to_string()
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            detach_key: default_detach_key(),
        }
    }
}

impl Settings {
    /// Load settings from config file or use defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // An explicit path must exist
        if let Some(p) = path {
            return Self::load_file(p);
        }

        let default_paths = [
            dirs::config_dir().map(|p| p.join("termhub/config.toml")),
            dirs::home_dir().map(|p| p.join(".config/termhub/config.toml")),
            dirs::home_dir().map(|p| p.join(".termhub.toml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                return Self::load_file(path);
            }
        }

        Ok(Self::default())
    }

    fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Socket the daemon listens on and clients connect to
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(default_socket_path)
    }

    /// Validate and normalize settings values
    ///
    /// Sizes and queue depths have a floor of 1 so sessions can always be
    /// created; the raw log keeps at least one page of output.
    pub fn validate(&mut self) {
        const MIN_RAW_LOG_BYTES: usize = 4096;
        const MIN_REQUEST_TIMEOUT_MS: u64 = 100;

        let session = &mut self.session;
        session.default_cols = session.default_cols.max(1);
        session.default_rows = session.default_rows.max(1);
        session.subscriber_queue = session.subscriber_queue.max(1);
        session.raw_log_bytes = session.raw_log_bytes.max(MIN_RAW_LOG_BYTES);
        if session.term.is_empty() {
            session.term = default_term();
        }

        let client = &mut self.client;
        client.request_timeout_ms = client.request_timeout_ms.max(MIN_REQUEST_TIMEOUT_MS);
    }
}
