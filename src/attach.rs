//! Interactive attach
//!
//! Puts the local terminal in raw mode and forwards keystrokes to the
//! session until the detach key is pressed or the session exits.

use std::io::{Read, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::terminal;
use tokio::sync::mpsc;

use termhub_core::ipc::{AttachFrame, DaemonClient, Payload, Request, StreamFrame};

/// Interval between terminal size checks
const SIZE_POLL: Duration = Duration::from_millis(100);

/// Restores cooked mode on drop
struct RawModeGuard;

impl RawModeGuard {
    fn enter() -> Result<Self> {
        terminal::enable_raw_mode().context("Failed to enable raw terminal mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

enum Input {
    Bytes(Vec<u8>),
    Detach,
}

/// How an attach ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachEnd {
    Detached,
    Exited(Option<i32>),
    /// The daemon cut this client off for falling behind
    Dropped,
    /// The daemon went away
    Closed,
}

/// Attach the current terminal to session `id`
pub async fn run(client: &DaemonClient, id: &str, detach_key: u8) -> Result<AttachEnd> {
    let mut conn = client.connect().await?;
    match conn.call(&Request::Attach { id: id.to_string() }).await? {
        Payload::Attached { .. } => {}
        other => anyhow::bail!("Unexpected attach response: {:?}", other),
    }
    let (mut reader, mut writer) = conn.into_split();

    let _raw = RawModeGuard::enter()?;
    let mut size = terminal::size().context("Failed to read terminal size")?;
    writer
        .send(&AttachFrame::Resize {
            cols: size.0,
            rows: size.1,
        })
        .await?;

    let (input_tx, mut input_rx) = mpsc::channel::<Input>(64);
    std::thread::spawn(move || read_stdin(input_tx, detach_key));

    let mut ticker = tokio::time::interval(SIZE_POLL);
    let mut stdout = std::io::stdout();
    let mut detaching = false;

    let end = loop {
        tokio::select! {
            frame = reader.recv::<StreamFrame>() => match frame? {
                Some(StreamFrame::Output { data }) => {
                    stdout.write_all(&data)?;
                    stdout.flush()?;
                }
                Some(StreamFrame::Exit { code }) => break AttachEnd::Exited(code),
                Some(StreamFrame::Detached) => break AttachEnd::Detached,
                Some(StreamFrame::Dropped) => break AttachEnd::Dropped,
                Some(StreamFrame::Error { error }) => {
                    tracing::debug!("Daemon reported: {}", error);
                }
                None => break AttachEnd::Closed,
            },
            input = input_rx.recv(), if !detaching => match input {
                Some(Input::Bytes(data)) => writer.send(&AttachFrame::Input { data }).await?,
                // Stdin closed counts as a detach
                Some(Input::Detach) | None => {
                    detaching = true;
                    writer.send(&AttachFrame::Detach).await?;
                }
            },
            _ = ticker.tick() => {
                if let Ok(current) = terminal::size() {
                    if current != size {
                        size = current;
                        writer
                            .send(&AttachFrame::Resize {
                                cols: size.0,
                                rows: size.1,
                            })
                            .await?;
                    }
                }
            }
        }
    };
    Ok(end)
}

/// Blocking stdin pump; runs until stdin closes or the detach key is seen
fn read_stdin(tx: mpsc::Sender<Input>, detach_key: u8) {
    let mut stdin = std::io::stdin();
    let mut buf = [0u8; 4096];
    loop {
        let n = match stdin.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let (data, detach) = split_detach(&buf[..n], detach_key);
        if !data.is_empty() && tx.blocking_send(Input::Bytes(data.to_vec())).is_err() {
            return;
        }
        if detach {
            let _ = tx.blocking_send(Input::Detach);
            return;
        }
    }
    let _ = tx.blocking_send(Input::Detach);
}

/// Bytes to forward before the detach key, and whether it was pressed
fn split_detach(chunk: &[u8], detach_key: u8) -> (&[u8], bool) {
    match chunk.iter().position(|&b| b == detach_key) {
        Some(pos) => (&chunk[..pos], true),
        None => (chunk, false),
    }
}
