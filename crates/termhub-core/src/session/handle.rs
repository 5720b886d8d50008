//! A pty-backed session
//!
//! Each session owns one child process on a pseudo-terminal. A reader thread
//! feeds pty output into the raw log, the emulator and any subscribers; a
//! waiter thread reaps the child and freezes the session when it exits.
//!
//! Two locks guard a session. `state` covers the buffers, status and
//! subscriber list and is held only briefly. `control` covers the pty writer,
//! master and child killer, serializing writes and resizes. When both are
//! needed `control` is taken first.

use std::fmt;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::raw_log::RawLog;
use crate::config::SessionSettings;
use crate::error::{Error, Result};
use crate::term::Emulator;

const READ_BUF_SIZE: usize = 8192;

/// How long the waiter gives the reader to drain after the child exits
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Grace period between SIGHUP and SIGKILL on stop
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Lifecycle of a session; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    Exited(i32),
}

impl SessionStatus {
    pub fn is_exited(&self) -> bool {
        matches!(self, SessionStatus::Exited(_))
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            SessionStatus::Exited(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Starting => write!(f, "starting"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Exited(code) => write!(f, "exited({})", code),
        }
    }
}

/// Snapshot of a session's metadata
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub command: String,
    pub cwd: PathBuf,
    pub status: SessionStatus,
    pub pid: Option<u32>,
    pub cols: u16,
    pub rows: u16,
    pub created_at: DateTime<Utc>,
}

impl SessionInfo {
    /// One `list` line: `id status cwd command`
    pub fn list_line(&self) -> String {
        format!(
            "{} {} {} {}",
            self.id,
            self.status,
            self.cwd.display(),
            self.command
        )
    }
}

struct Subscriber {
    key: u64,
    tx: mpsc::Sender<Bytes>,
    /// Set when the reader dropped this subscriber for falling behind
    dropped: Arc<AtomicBool>,
    /// Interactive clients answer terminal queries themselves
    interactive: bool,
}

struct SessionState {
    status: SessionStatus,
    emulator: Emulator,
    raw: RawLog,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
}

struct Control {
    writer: Box<dyn Write + Send>,
    master: Box<dyn MasterPty + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

/// A running (or exited) program on its own pty
pub struct Session {
    id: String,
    serial: u64,
    command: String,
    cwd: PathBuf,
    pid: Option<u32>,
    created_at: DateTime<Utc>,
    queue_depth: usize,
    state: Mutex<SessionState>,
    control: Mutex<Control>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("serial", &self.serial)
            .field("command", &self.command)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Spawn `command` through the configured shell on a new pty.
    ///
    /// Fails with [`Error::Spawn`] when the pty cannot be opened, the working
    /// directory does not exist, or the shell cannot be started.
    pub fn spawn(
        id: String,
        serial: u64,
        command: &str,
        cwd: Option<PathBuf>,
        (cols, rows): (u16, u16),
        settings: &SessionSettings,
    ) -> Result<Arc<Self>> {
        let spawn_err = |reason: String| Error::Spawn {
            command: command.to_string(),
            reason,
        };
        let (cols, rows) = (cols.max(1), rows.max(1));

        let cwd = match cwd {
            Some(dir) if !dir.is_dir() => {
                return Err(spawn_err(format!(
                    "working directory does not exist: {}",
                    dir.display()
                )));
            }
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };

        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| spawn_err(format!("failed to open pty: {}", e)))?;

        let mut cmd = CommandBuilder::new(settings.shell());
        cmd.arg("-c");
        cmd.arg(command);
        cmd.cwd(&cwd);
        cmd.env("TERM", &settings.term);

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| spawn_err(e.to_string()))?;
        // The child holds its own copy; ours would keep the pty open past exit
        drop(pair.slave);

        let io = pair
            .master
            .try_clone_reader()
            .and_then(|reader| Ok((reader, pair.master.take_writer()?)));
        let (reader, writer) = match io {
            Ok(io) => io,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(spawn_err(format!("failed to open pty streams: {}", e)));
            }
        };

        let pid = child.process_id();
        let session = Arc::new(Self {
            id,
            serial,
            command: command.to_string(),
            cwd,
            pid,
            created_at: Utc::now(),
            queue_depth: settings.subscriber_queue.max(1),
            state: Mutex::new(SessionState {
                status: SessionStatus::Starting,
                emulator: Emulator::new(cols, rows, settings.scrollback_lines),
                raw: RawLog::new(settings.raw_log_bytes),
                subscribers: Vec::new(),
                next_subscriber: 0,
            }),
            control: Mutex::new(Control {
                writer,
                master: pair.master,
                killer: child.clone_killer(),
            }),
        });

        let reader_thread = {
            let session = session.clone();
            thread::spawn(move || session.pump_output(reader))
        };

        {
            let session = session.clone();
            thread::spawn(move || {
                let code = match child.wait() {
                    Ok(status) => status.exit_code() as i32,
                    Err(e) => {
                        tracing::debug!("wait failed for session {}: {}", session.id, e);
                        -1
                    }
                };
                join_thread_with_timeout(reader_thread, READER_JOIN_TIMEOUT);
                session.mark_exited(code);
            });
        }

        {
            let mut state = session.state.lock();
            if state.status == SessionStatus::Starting {
                state.status = SessionStatus::Running;
            }
        }

        tracing::info!(
            "Started session {} (pid {:?}): {}",
            session.id,
            session.pid,
            session.command
        );
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Unique per daemon lifetime, unlike the id which may be reused
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    /// Size as (cols, rows)
    pub fn size(&self) -> (u16, u16) {
        self.state.lock().emulator.size()
    }

    pub fn info(&self) -> SessionInfo {
        let state = self.state.lock();
        let (cols, rows) = state.emulator.size();
        SessionInfo {
            id: self.id.clone(),
            command: self.command.clone(),
            cwd: self.cwd.clone(),
            status: state.status,
            pid: self.pid,
            cols,
            rows,
            created_at: self.created_at,
        }
    }

    /// Write input to the pty
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        self.write_all(&[bytes])
    }

    /// Write every chunk in order as one uninterrupted unit of input
    pub fn write_all<B: AsRef<[u8]>>(&self, chunks: &[B]) -> Result<()> {
        let mut control = self.control.lock();
        self.ensure_running()?;
        for chunk in chunks {
            control.writer.write_all(chunk.as_ref())?;
        }
        control.writer.flush()?;
        Ok(())
    }

    /// Resize the pty and the emulator; a no-op when the size is unchanged
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if cols == 0 || rows == 0 {
            return Err(Error::InvalidArgument(format!(
                "terminal size must be positive, got {}x{}",
                cols, rows
            )));
        }
        let control = self.control.lock();
        self.ensure_running()?;
        let mut state = self.state.lock();
        if state.emulator.size() == (cols, rows) {
            return Ok(());
        }
        control
            .master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| Error::Io(io::Error::other(e.to_string())))?;
        state.emulator.resize(cols, rows);
        tracing::debug!("Resized session {} to {}x{}", self.id, cols, rows);
        Ok(())
    }

    /// Rendered screen text; see [`Emulator::render`]
    pub fn read_rendered(&self, lines: Option<usize>) -> String {
        self.state.lock().emulator.render(lines)
    }

    /// Raw output from `cursor` (or the oldest retained byte), plus the cursor
    /// to resume from. While the session runs, the slice never ends inside an
    /// escape sequence or a UTF-8 character.
    pub fn read_raw(&self, cursor: Option<u64>, strip_ansi: bool) -> (Vec<u8>, u64) {
        let state = self.state.lock();
        let mut bytes = state.raw.since(cursor.unwrap_or(0));
        let mut next = state.raw.end();
        let running = !state.status.is_exited();
        drop(state);
        // A sequence still being written is left for the next read
        if running {
            let keep = crate::ansi::complete_len(&bytes);
            next -= (bytes.len() - keep) as u64;
            bytes.truncate(keep);
        }
        if strip_ansi {
            (crate::ansi::strip(&bytes), next)
        } else {
            (bytes, next)
        }
    }

    /// Subscribe to live output, receiving everything since `cursor` as the
    /// backlog. Nothing is missed or repeated between backlog and live feed.
    pub fn subscribe(self: &Arc<Self>, cursor: Option<u64>) -> Subscription {
        let mut state = self.state.lock();
        let backlog = state.raw.since(cursor.unwrap_or(0));
        self.register(&mut state, backlog, false)
    }

    /// Subscribe as an interactive client: the backlog repaints the current
    /// screen, and terminal queries are left for the client to answer
    pub fn attach(self: &Arc<Self>) -> Subscription {
        let mut state = self.state.lock();
        let backlog = state.emulator.repaint();
        self.register(&mut state, backlog, true)
    }

    fn register(
        self: &Arc<Self>,
        state: &mut SessionState,
        backlog: Vec<u8>,
        interactive: bool,
    ) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let dropped = Arc::new(AtomicBool::new(false));
        let key = state.next_subscriber;
        state.next_subscriber += 1;
        // An exited session has no more output; the feed ends immediately
        if !state.status.is_exited() {
            state.subscribers.push(Subscriber {
                key,
                tx,
                dropped: dropped.clone(),
                interactive,
            });
        }
        Subscription {
            backlog,
            cursor: state.raw.end(),
            rx,
            dropped,
            key,
            session: Arc::downgrade(self),
        }
    }

    /// Kill the child and its process group. Idempotent; an already exited
    /// session is left untouched.
    pub fn terminate(&self) {
        if self.status().is_exited() {
            return;
        }
        let pgid = self.pid.map(|pid| Pid::from_raw(pid as i32));
        if let Some(pgid) = pgid {
            let _ = signal::killpg(pgid, Signal::SIGHUP);
        }
        if let Some(mut control) = self.control.try_lock_for(KILL_GRACE) {
            let _ = control.killer.kill();
        }
        if !self.wait_exited(KILL_GRACE) {
            tracing::debug!("Session {} ignored SIGHUP, sending SIGKILL", self.id);
            if let Some(pgid) = pgid {
                let _ = signal::killpg(pgid, Signal::SIGKILL);
            }
            self.wait_exited(READER_JOIN_TIMEOUT + KILL_GRACE);
        }
    }

    /// Block until the session has exited or `timeout` passes
    pub fn wait_exited(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.status().is_exited() {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.status().is_exited() {
            Err(Error::not_running(&self.id))
        } else {
            Ok(())
        }
    }

    fn pump_output(&self, mut reader: Box<dyn Read + Send>) {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.ingest(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // EIO once the last slave fd closes
                    tracing::debug!("PTY read ended for session {}: {}", self.id, e);
                    break;
                }
            }
        }
    }

    fn ingest(&self, chunk: &[u8]) {
        let replies = {
            let mut state = self.state.lock();
            // Leftovers from processes that outlived the session's child
            if state.status.is_exited() {
                return;
            }
            state.raw.append(chunk);
            state.emulator.consume(chunk);

            let data = Bytes::copy_from_slice(chunk);
            let id = &self.id;
            state
                .subscribers
                .retain(|sub| match sub.tx.try_send(data.clone()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!("Dropping subscriber on session {}: queue full", id);
                        sub.dropped.store(true, Ordering::Release);
                        false
                    }
                    Err(TrySendError::Closed(_)) => false,
                });

            let replies = state.emulator.take_replies();
            if state.subscribers.iter().any(|sub| sub.interactive) {
                Vec::new()
            } else {
                replies
            }
        };

        if !replies.is_empty() {
            let mut control = self.control.lock();
            let _ = control.writer.write_all(&replies);
            let _ = control.writer.flush();
        }
    }

    fn mark_exited(&self, code: i32) {
        let mut state = self.state.lock();
        state.status = SessionStatus::Exited(code);
        // Dropping the senders ends every subscriber's feed
        state.subscribers.clear();
        tracing::info!("Session {} exited with code {}", self.id, code);
    }

    fn unsubscribe(&self, key: u64) {
        self.state.lock().subscribers.retain(|sub| sub.key != key);
    }
}

/// Live output feed from one session
pub struct Subscription {
    /// Bytes preceding the live feed (raw backlog, or a repaint for attach)
    pub backlog: Vec<u8>,
    /// Raw log offset just past the backlog
    pub cursor: u64,
    rx: mpsc::Receiver<Bytes>,
    dropped: Arc<AtomicBool>,
    key: u64,
    session: Weak<Session>,
}

impl Subscription {
    /// Next chunk of output; `None` once the session exits or this
    /// subscriber was dropped
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Whether the feed ended because this subscriber fell behind
    pub fn was_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.unsubscribe(self.key);
        }
    }
}

/// Join a thread with a timeout, abandoning it if it doesn't finish in time
fn join_thread_with_timeout<T>(handle: JoinHandle<T>, timeout: Duration) {
    let start = Instant::now();
    loop {
        if handle.is_finished() {
            let _ = handle.join();
            return;
        }
        if start.elapsed() >= timeout {
            tracing::debug!("Thread join timed out, abandoning thread");
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
}
