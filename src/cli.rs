use clap::{Parser, Subcommand};
use std::path::PathBuf;

use termhub_core::config::Settings;

/// Command-line interface
#[derive(Parser, Debug)]
#[command(author, version, about = "Centralized terminal session manager")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Daemon socket path
    #[arg(short, long, global = true)]
    pub socket: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the daemon in the foreground
    Server,
    /// List sessions
    #[command(alias = "ls")]
    List,
    /// Start a session running a shell command
    Start {
        /// Session id
        name: String,
        /// Command line, run through the configured shell
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
        /// Working directory (defaults to the current one)
        #[arg(long)]
        cwd: Option<PathBuf>,
        #[arg(long)]
        cols: Option<u16>,
        #[arg(long)]
        rows: Option<u16>,
    },
    /// Stop a session, or every session when no id is given
    Stop { id: Option<String> },
    /// Attach this terminal to a session
    Attach { id: String },
    /// Print the rendered screen
    Stdout {
        id: String,
        /// Only the last N lines (scrollback included)
        #[arg(short = 'n', long)]
        lines: Option<usize>,
    },
    /// Print raw output
    Stream {
        id: String,
        /// Only output not yet returned on this connection. Each call is a
        /// new connection, so pass the printed cursor back with --cursor to
        /// read incrementally across calls
        #[arg(long)]
        since_last: bool,
        /// Keep escape sequences
        #[arg(long)]
        ansi: bool,
        /// Keep printing output until the session exits
        #[arg(short, long)]
        follow: bool,
        /// Resume from a cursor printed by an earlier call
        #[arg(long)]
        cursor: Option<u64>,
    },
    /// Send input, translating key names like Enter or C-c
    Stdin {
        id: String,
        #[arg(required = true, allow_hyphen_values = true)]
        tokens: Vec<String>,
        /// Send tokens as-is
        #[arg(short, long)]
        literal: bool,
    },
    /// Resize a session's terminal
    Resize {
        id: String,
        #[arg(allow_negative_numbers = true)]
        cols: i64,
        #[arg(allow_negative_numbers = true)]
        rows: i64,
    },
    /// Print a session's terminal size
    TermSize { id: String },
    /// Print client and server versions
    Version,
    /// Stop every session and the daemon
    KillServer,
}

impl Cli {
    /// Apply command-line overrides to loaded settings
    pub fn merge_into(&self, settings: &mut Settings) {
        if let Some(socket) = &self.socket {
            settings.socket_path = Some(socket.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("termhub").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_start_collects_command_words() {
        let cli = parse(&["start", "--cols", "120", "build", "npm", "run", "build", "--watch"]);
        assert_eq!(
            cli.command,
            Command::Start {
                name: "build".into(),
                command: vec!["npm".into(), "run".into(), "build".into(), "--watch".into()],
                cwd: None,
                cols: Some(120),
                rows: None,
            }
        );
    }

    #[test]
    fn test_stdin_tokens() {
        let cli = parse(&["stdin", "--literal", "py", "print(1)", "Enter"]);
        assert_eq!(
            cli.command,
            Command::Stdin {
                id: "py".into(),
                tokens: vec!["print(1)".into(), "Enter".into()],
                literal: true,
            }
        );
    }

    #[test]
    fn test_resize_accepts_negative_for_daemon_validation() {
        let cli = parse(&["resize", "s", "-1", "24"]);
        assert_eq!(
            cli.command,
            Command::Resize {
                id: "s".into(),
                cols: -1,
                rows: 24
            }
        );
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = parse(&["list", "--socket", "/tmp/x.sock", "-d"]);
        assert!(cli.debug);
        let mut settings = Settings::default();
        cli.merge_into(&mut settings);
        assert_eq!(settings.socket_path(), PathBuf::from("/tmp/x.sock"));
    }

    #[test]
    fn test_missing_arguments_are_usage_errors() {
        assert!(Cli::try_parse_from(["termhub", "start", "only-a-name"]).is_err());
        assert!(Cli::try_parse_from(["termhub", "stdout"]).is_err());
        assert!(Cli::try_parse_from(["termhub", "frobnicate"]).is_err());
    }

    #[test]
    fn test_stream_flags() {
        let cli = parse(&["stream", "s", "--since-last", "--ansi", "-f"]);
        assert_eq!(
            cli.command,
            Command::Stream {
                id: "s".into(),
                since_last: true,
                ansi: true,
                follow: true,
                cursor: None,
            }
        );
    }
}
