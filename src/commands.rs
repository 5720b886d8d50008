//! One-shot client commands and the server entry point

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};

use termhub_core::config::Settings;
use termhub_core::ipc::{DaemonClient, Payload, Request, Server, StreamFrame, VERSION};
use termhub_core::{keys, ErrorKind};

use crate::attach::{self, AttachEnd};
use crate::cli::Command;

/// Run one subcommand to completion
pub async fn run(command: Command, settings: &Settings) -> Result<()> {
    let client = DaemonClient::new(
        settings.socket_path(),
        Duration::from_millis(settings.client.request_timeout_ms),
    );

    match command {
        Command::Server => Server::bind(settings).await?.run().await,
        Command::Attach { id } => {
            let detach_key = keys::parse_detach_key(&settings.client.detach_key)?;
            let end = attach::run(&client, &id, detach_key).await?;
            report_attach_end(&id, &end);
            Ok(())
        }
        command => {
            let request = build_request(command)?;
            match &request {
                Request::List => list(&client).await,
                Request::Stream { follow: true, .. } => follow_stream(&client, &request).await,
                _ => {
                    if request == Request::Version {
                        println!("termhub {}", VERSION);
                    }
                    let payload = client.request(&request).await?;
                    if let Some(note) = cursor_note(&request, &payload) {
                        eprintln!("{}", note);
                    }
                    print_payload(payload)
                }
            }
        }
    }
}

/// The single daemon request a one-shot command sends
fn build_request(command: Command) -> Result<Request> {
    let request = match command {
        Command::List => Request::List,
        Command::Start {
            name,
            command,
            cwd,
            cols,
            rows,
        } => {
            let cwd = match cwd {
                Some(cwd) => cwd,
                None => std::env::current_dir().context("Failed to read current directory")?,
            };
            Request::Start {
                command: command.join(" "),
                name: Some(name),
                cwd: Some(cwd),
                cols,
                rows,
            }
        }
        Command::Stop { id } => Request::Stop { id },
        Command::Stdout { id, lines } => Request::Stdout { id, lines },
        Command::Stream {
            id,
            since_last,
            ansi,
            follow,
            cursor,
        } => Request::Stream {
            id,
            since_last,
            strip_ansi: !ansi,
            cursor,
            follow,
        },
        Command::Stdin {
            id,
            tokens,
            literal,
        } => Request::Stdin {
            id,
            data: tokens,
            literal,
        },
        Command::Resize { id, cols, rows } => Request::Resize { id, cols, rows },
        Command::TermSize { id } => Request::TermSize { id },
        Command::Version => Request::Version,
        Command::KillServer => Request::KillServer,
        Command::Server | Command::Attach { .. } => {
            anyhow::bail!("{:?} is not a one-shot request", command)
        }
    };
    Ok(request)
}

/// Cursor to resume from, for reads that asked for incremental output.
///
/// Every CLI call is its own connection, so the daemon's since-last cursor
/// does not outlive it; `--cursor` carries the position between calls.
fn cursor_note(request: &Request, payload: &Payload) -> Option<String> {
    match (request, payload) {
        (
            Request::Stream {
                since_last, cursor, ..
            },
            Payload::Stream { cursor: next, .. },
        ) if *since_last || cursor.is_some() => Some(format!("cursor: {}", next)),
        _ => None,
    }
}

/// `list` with no daemon is an empty listing, not a failure
async fn list(client: &DaemonClient) -> Result<()> {
    match client.request(&Request::List).await {
        Ok(payload) => print_payload(payload),
        Err(e) if e.kind() == ErrorKind::NoServer => {
            println!("no active sessions");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn follow_stream(client: &DaemonClient, request: &Request) -> Result<()> {
    let mut conn = client.connect().await?;
    let mut stdout = std::io::stdout();
    if let Payload::Stream { data, .. } = conn.call(request).await? {
        stdout.write_all(&data)?;
        stdout.flush()?;
    }
    loop {
        match conn.recv::<StreamFrame>().await? {
            Some(StreamFrame::Output { data }) => {
                stdout.write_all(&data)?;
                stdout.flush()?;
            }
            Some(StreamFrame::Exit { code }) => {
                tracing::debug!("Session exited with {:?}", code);
                return Ok(());
            }
            Some(StreamFrame::Dropped) => {
                anyhow::bail!("stream dropped: output arrived faster than it was read")
            }
            Some(StreamFrame::Error { error }) => anyhow::bail!(error),
            Some(StreamFrame::Detached) | None => return Ok(()),
        }
    }
}

/// Print a response body the way each command shows it
fn print_payload(payload: Payload) -> Result<()> {
    if let Some(text) = render_payload(&payload) {
        println!("{}", text);
    }
    if let Payload::Stream { data, .. } = payload {
        let mut stdout = std::io::stdout();
        stdout.write_all(&data)?;
        stdout.flush()?;
    }
    Ok(())
}

/// Text form of a payload; `None` for silent acknowledgements and raw bytes
fn render_payload(payload: &Payload) -> Option<String> {
    match payload {
        Payload::Id { id } => Some(id.clone()),
        Payload::Text { text } => Some(text.clone()),
        Payload::Status { message } if message == "ok" => None,
        Payload::Status { message } => Some(message.clone()),
        Payload::Size { cols, rows } => Some(format!("{} {}", cols, rows)),
        Payload::Stream { .. } => None,
        Payload::Attached { id } => Some(format!("attached to {}", id)),
        Payload::Version { version } => Some(format!("server {}", version)),
    }
}

fn report_attach_end(id: &str, end: &AttachEnd) {
    match end {
        AttachEnd::Detached => eprintln!("[detached from {}]", id),
        AttachEnd::Exited(Some(code)) => eprintln!("[{} exited with code {}]", id, code),
        AttachEnd::Exited(None) => eprintln!("[{} exited]", id),
        AttachEnd::Dropped => eprintln!("[{}: connection dropped, client too slow]", id),
        AttachEnd::Closed => eprintln!("[{}: server closed the connection]", id),
    }
}
