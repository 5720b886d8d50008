//! termhub daemon
//!
//! Listens on a Unix domain socket and serves each connection on its own
//! task. Connections begin in request/response mode and may be upgraded to
//! a follow stream or an interactive attach for a single session.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

use crate::ansi::{self, Reassembler};
use crate::config::Settings;
use crate::ipc::protocol::*;
use crate::ipc::router::{ConnectionState, Outcome, Router};
use crate::session::{Registry, Session, Subscription};

/// Newline-delimited reader that hands lines over as bytes, so a line that
/// is not UTF-8 still reaches the decoder and gets a protocol error
struct LineReader {
    inner: BufReader<OwnedReadHalf>,
    buf: Vec<u8>,
}

impl LineReader {
    fn new(read: OwnedReadHalf) -> Self {
        Self {
            inner: BufReader::new(read),
            buf: Vec::new(),
        }
    }

    /// Next line without its terminator, `None` at end of stream.
    ///
    /// Cancel safe: a partly read line stays buffered for the next call.
    async fn next_line(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        let n = self.inner.read_until(b'\n', &mut self.buf).await?;
        if n == 0 && self.buf.is_empty() {
            return Ok(None);
        }
        let mut line = std::mem::take(&mut self.buf);
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(Some(line))
    }
}

/// The daemon: socket listener plus the session registry it serves
pub struct Server {
    listener: UnixListener,
    socket: PathBuf,
    router: Router,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Server {
    /// Bind the daemon socket.
    ///
    /// Fails if another daemon answers on the same path; a stale socket file
    /// left by a dead daemon is removed.
    pub async fn bind(settings: &Settings) -> Result<Self> {
        let sock = settings.socket_path();
        ensure_socket_dir(&sock)?;

        if sock.exists() {
            match UnixStream::connect(&sock).await {
                Ok(_) => {
                    anyhow::bail!(
                        "Another termhub server is already running (socket {} is active)",
                        sock.display()
                    );
                }
                Err(_) => {
                    std::fs::remove_file(&sock).with_context(|| {
                        format!("Failed to remove stale socket: {}", sock.display())
                    })?;
                }
            }
        }

        let listener = UnixListener::bind(&sock)
            .with_context(|| format!("Failed to bind socket: {}", sock.display()))?;

        // Set socket permissions to owner-only
        std::fs::set_permissions(&sock, std::fs::Permissions::from_mode(0o700))
            .context("Failed to set socket permissions")?;

        let registry = Arc::new(Registry::new(settings.session.clone()));
        let (shutdown, _) = watch::channel(false);

        tracing::info!("termhub server {} listening on {}", VERSION, sock.display());
        Ok(Self {
            listener,
            socket: sock,
            router: Router::new(registry),
            shutdown: Arc::new(shutdown),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.router.registry()
    }

    /// Serve connections until `kill-server` or a termination signal, then
    /// stop every session and remove the socket
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let router = self.router.clone();
                        let shutdown = self.shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, router, shutdown).await {
                                tracing::debug!("Connection ended: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Accept error: {}", e);
                    }
                },
                _ = shutdown_rx.changed() => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    tracing::info!("Terminated, shutting down");
                    break;
                }
            }
        }

        let registry = self.router.registry().clone();
        let stopped = tokio::task::spawn_blocking(move || registry.stop_all()).await?;
        if stopped > 0 {
            tracing::info!("Stopped {} remaining session(s)", stopped);
        }
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket);
    }
}

/// Serve one client connection
async fn handle_connection(
    stream: UnixStream,
    router: Router,
    shutdown: Arc<watch::Sender<bool>>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = LineReader::new(reader);
    let mut conn = ConnectionState::default();

    while let Some(line) = lines.next_line().await? {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let outcome = match Request::decode(&line) {
            Ok(request) => {
                tracing::debug!("Request: {:?}", request);
                let router = router.clone();
                let (outcome, state) = tokio::task::spawn_blocking(move || {
                    let outcome = router.dispatch(request, &mut conn);
                    (outcome, conn)
                })
                .await?;
                conn = state;
                outcome
            }
            Err(e) => Outcome::Reply(e.into()),
        };

        send(&mut writer, outcome.response()).await?;

        match outcome {
            Outcome::Reply(_) => {}
            Outcome::Follow {
                subscription,
                session,
                strip_ansi,
                stream,
                ..
            } => {
                let feed = Feed {
                    subscription,
                    session,
                    strip_ansi,
                    stream,
                };
                return follow(writer, lines, feed).await;
            }
            Outcome::Attach { session, .. } => return attach(writer, lines, session).await,
            Outcome::Shutdown(_) => {
                writer.flush().await?;
                let _ = shutdown.send(true);
                return Ok(());
            }
        }
    }
    Ok(())
}

/// A follow stream's live side
struct Feed {
    subscription: Subscription,
    session: Arc<Session>,
    strip_ansi: bool,
    stream: Reassembler,
}

impl Feed {
    fn frame(&self, data: Vec<u8>) -> Option<StreamFrame> {
        let data = if self.strip_ansi {
            ansi::strip(&data)
        } else {
            data
        };
        (!data.is_empty()).then_some(StreamFrame::Output { data })
    }
}

/// Push a session's output until it exits or the client goes away
async fn follow(mut writer: OwnedWriteHalf, mut lines: LineReader, mut feed: Feed) -> Result<()> {
    loop {
        tokio::select! {
            chunk = feed.subscription.recv() => match chunk {
                Some(data) => {
                    let data = feed.stream.push(&data);
                    if let Some(frame) = feed.frame(data) {
                        send(&mut writer, &frame).await?;
                    }
                }
                None => {
                    let rest = std::mem::take(&mut feed.stream).finish();
                    if let Some(frame) = feed.frame(rest) {
                        send(&mut writer, &frame).await?;
                    }
                    send(&mut writer, &end_frame(&feed.subscription, &feed.session)).await?;
                    return Ok(());
                }
            },
            line = lines.next_line() => match line {
                // Nothing is expected from a follower; closing is the only signal
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => {
                    tracing::debug!("Follower of session {} disconnected", feed.session.id());
                    return Ok(());
                }
            },
        }
    }
}

/// Bidirectional forwarding between a client terminal and a session
async fn attach(mut writer: OwnedWriteHalf, mut lines: LineReader, session: Arc<Session>) -> Result<()> {
    let mut subscription = session.attach();
    tracing::debug!("Client attached to session {}", session.id());

    let repaint = std::mem::take(&mut subscription.backlog);
    send(&mut writer, &StreamFrame::Output { data: repaint }).await?;

    loop {
        tokio::select! {
            chunk = subscription.recv() => match chunk {
                Some(data) => send(&mut writer, &StreamFrame::Output { data: data.to_vec() }).await?,
                None => {
                    send(&mut writer, &end_frame(&subscription, &session)).await?;
                    return Ok(());
                }
            },
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    // Client vanished; same as a detach
                    Ok(None) | Err(_) => return Ok(()),
                };
                let frame = match decode::<AttachFrame>(&line) {
                    Ok(frame) => frame,
                    Err(e) => {
                        send(&mut writer, &StreamFrame::Error { error: e.to_string() }).await?;
                        continue;
                    }
                };
                let session = session.clone();
                let result = match frame {
                    AttachFrame::Input { data } => {
                        tokio::task::spawn_blocking(move || session.write(&data)).await?
                    }
                    AttachFrame::Resize { cols, rows } => {
                        tokio::task::spawn_blocking(move || session.resize(cols, rows)).await?
                    }
                    AttachFrame::Detach => {
                        send(&mut writer, &StreamFrame::Detached).await?;
                        tracing::debug!("Client detached from session {}", session.id());
                        return Ok(());
                    }
                };
                if let Err(e) = result {
                    send(&mut writer, &StreamFrame::Error { error: e.to_string() }).await?;
                }
            }
        }
    }
}

/// Why a subscription's feed ended
fn end_frame(subscription: &Subscription, session: &Session) -> StreamFrame {
    if subscription.was_dropped() {
        StreamFrame::Dropped
    } else {
        StreamFrame::Exit {
            code: session.status().exit_code(),
        }
    }
}

async fn send<T: Serialize>(writer: &mut OwnedWriteHalf, msg: &T) -> Result<()> {
    writer.write_all(&encode(msg)?).await?;
    Ok(())
}

/// Ensure the socket's directory exists with proper permissions
///
/// A directory we create, or the default per-user state directory, is
/// restricted to the owner. A user-chosen existing directory is left alone.
fn ensure_socket_dir(sock: &Path) -> Result<()> {
    let dir = match sock.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => return Ok(()),
    };
    // Check for symlink attack before creating
    let existed = match std::fs::symlink_metadata(dir) {
        Ok(meta) if meta.is_symlink() => {
            anyhow::bail!(
                "Socket directory is a symlink (possible attack): {}",
                dir.display()
            );
        }
        Ok(meta) if !meta.is_dir() => {
            anyhow::bail!("Socket directory is not a directory: {}", dir.display());
        }
        Ok(_) => true,
        Err(_) => false,
    };
    if !existed {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create socket directory: {}", dir.display()))?;
    }
    if !existed || dir == state_dir() {
        let metadata = std::fs::metadata(dir)
            .with_context(|| format!("Failed to read metadata for: {}", dir.display()))?;
        if metadata.permissions().mode() & 0o777 != 0o700 {
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
                .with_context(|| format!("Failed to set permissions on: {}", dir.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionSettings;
    use crate::ipc::client::DaemonClient;
    use crate::error::ErrorKind;
    use std::time::Duration;

    fn settings(dir: &Path) -> Settings {
        Settings {
            socket_path: Some(dir.join("run/daemon.sock")),
            session: SessionSettings {
                shell: Some("/bin/sh".to_string()),
                term: "dumb".to_string(),
                ..SessionSettings::default()
            },
            ..Settings::default()
        }
    }

    async fn spawn_server(settings: &Settings) -> (DaemonClient, tokio::task::JoinHandle<Result<()>>) {
        let server = Server::bind(settings).await.unwrap();
        let client = DaemonClient::new(server.socket_path().to_path_buf(), Duration::from_secs(5));
        let handle = tokio::spawn(server.run());
        (client, handle)
    }

    fn start(id: &str, command: &str) -> Request {
        Request::Start {
            command: command.to_string(),
            name: Some(id.to_string()),
            cwd: None,
            cols: None,
            rows: None,
        }
    }

    #[tokio::test]
    async fn test_request_round_trip_and_kill_server() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let (client, handle) = spawn_server(&settings).await;

        let mode = std::fs::metadata(dir.path().join("run")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);

        assert_eq!(
            client.request(&Request::Version).await.unwrap(),
            Payload::Version {
                version: VERSION.to_string()
            }
        );
        client.request(&start("a", "sleep 30")).await.unwrap();
        let err = client.request(&start("a", "sleep 30")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateSession);

        let payload = client.request(&Request::KillServer).await.unwrap();
        assert!(matches!(payload, Payload::Status { .. }));
        handle.await.unwrap().unwrap();
        assert!(!settings.socket_path().exists());

        let err = client.request(&Request::List).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoServer);
    }

    #[tokio::test]
    async fn test_second_server_refuses_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let (client, handle) = spawn_server(&settings).await;

        let err = Server::bind(&settings).await.err().unwrap();
        assert!(err.to_string().contains("already running"));
        // The first daemon is undisturbed
        client.request(&Request::List).await.unwrap();

        client.request(&Request::KillServer).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        std::fs::create_dir_all(dir.path().join("run")).unwrap();
        std::fs::write(settings.socket_path(), b"").unwrap();

        let (client, handle) = spawn_server(&settings).await;
        client.request(&Request::List).await.unwrap();
        client.request(&Request::KillServer).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_lines_get_structured_errors() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let (client, handle) = spawn_server(&settings).await;

        let mut conn = client.connect().await.unwrap();
        conn.send_raw(b"{\"action\":\"explode\"}\n").await.unwrap();
        let resp: Response = conn.recv().await.unwrap().unwrap();
        assert!(matches!(resp, Response::Error { kind: ErrorKind::UnknownAction, .. }));

        conn.send_raw(b"garbage\n").await.unwrap();
        let resp: Response = conn.recv().await.unwrap().unwrap();
        assert!(matches!(resp, Response::Error { kind: ErrorKind::Protocol, .. }));

        // The connection is still usable
        assert!(conn.call(&Request::List).await.is_ok());

        client.request(&Request::KillServer).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_a_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let (client, handle) = spawn_server(&settings).await;

        let mut conn = client.connect().await.unwrap();
        conn.send_raw(b"{\"action\":\"list\xff\"}\n").await.unwrap();
        let resp: Response = conn.recv().await.unwrap().unwrap();
        assert!(matches!(resp, Response::Error { kind: ErrorKind::Protocol, .. }));

        conn.send_raw(b"\xfe\xff\r\n").await.unwrap();
        let resp: Response = conn.recv().await.unwrap().unwrap();
        assert!(matches!(resp, Response::Error { kind: ErrorKind::Protocol, .. }));

        assert!(conn.call(&Request::List).await.is_ok());

        client.request(&Request::KillServer).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_follow_stream_until_exit() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let (client, handle) = spawn_server(&settings).await;

        client
            .request(&start("f", "echo before; read go; echo after; exit 4"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let mut conn = client.connect().await.unwrap();
        let payload = conn
            .call(&Request::Stream {
                id: "f".into(),
                since_last: false,
                strip_ansi: true,
                cursor: None,
                follow: true,
            })
            .await
            .unwrap();
        let Payload::Stream { data, .. } = payload else {
            panic!("expected stream payload");
        };
        assert_eq!(data, b"before\n".to_vec());

        client
            .request(&Request::Stdin {
                id: "f".into(),
                data: vec!["Enter".into()],
                literal: false,
            })
            .await
            .unwrap();

        let mut output = Vec::new();
        let code = loop {
            match conn.recv::<StreamFrame>().await.unwrap() {
                Some(StreamFrame::Output { data }) => output.extend(data),
                Some(StreamFrame::Exit { code }) => break code,
                other => panic!("unexpected frame {:?}", other),
            }
        };
        assert_eq!(code, Some(4));
        assert!(String::from_utf8_lossy(&output).contains("after"));

        client.request(&Request::KillServer).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_follow_reassembles_split_escape_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let (client, handle) = spawn_server(&settings).await;

        client
            .request(&start("s", "stty -echo; printf 'hi\\033[3'; read go; printf '1mred\\n'"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let mut conn = client.connect().await.unwrap();
        let payload = conn
            .call(&Request::Stream {
                id: "s".into(),
                since_last: false,
                strip_ansi: true,
                cursor: None,
                follow: true,
            })
            .await
            .unwrap();
        assert_eq!(
            payload,
            Payload::Stream {
                data: b"hi".to_vec(),
                cursor: 2
            }
        );

        client
            .request(&Request::Stdin {
                id: "s".into(),
                data: vec!["Enter".into()],
                literal: false,
            })
            .await
            .unwrap();

        let mut output = Vec::new();
        loop {
            match conn.recv::<StreamFrame>().await.unwrap() {
                Some(StreamFrame::Output { data }) => output.extend(data),
                Some(StreamFrame::Exit { .. }) => break,
                other => panic!("unexpected frame {:?}", other),
            }
        }
        assert_eq!(output, b"red\n".to_vec());

        client.request(&Request::KillServer).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_attach_forwards_both_ways_and_detaches() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let (client, handle) = spawn_server(&settings).await;

        client.request(&start("sh", "cat")).await.unwrap();

        let mut conn = client.connect().await.unwrap();
        let payload = conn.call(&Request::Attach { id: "sh".into() }).await.unwrap();
        assert_eq!(payload, Payload::Attached { id: "sh".into() });

        // Repaint comes first
        let Some(StreamFrame::Output { data }) = conn.recv::<StreamFrame>().await.unwrap() else {
            panic!("expected repaint");
        };
        assert!(data.starts_with(b"\x1b[H\x1b[2J"));

        conn.send(&AttachFrame::Input {
            data: b"ping\r".to_vec(),
        })
        .await
        .unwrap();
        conn.send(&AttachFrame::Resize { cols: 100, rows: 30 }).await.unwrap();

        let mut seen = Vec::new();
        while !String::from_utf8_lossy(&seen).contains("ping\r\nping") {
            match conn.recv::<StreamFrame>().await.unwrap() {
                Some(StreamFrame::Output { data }) => seen.extend(data),
                other => panic!("unexpected frame {:?}", other),
            }
        }

        conn.send(&AttachFrame::Detach).await.unwrap();
        loop {
            match conn.recv::<StreamFrame>().await.unwrap() {
                Some(StreamFrame::Detached) => break,
                Some(StreamFrame::Output { .. }) => {}
                other => panic!("unexpected frame {:?}", other),
            }
        }

        // The session survives the detach
        assert_eq!(
            client.request(&Request::TermSize { id: "sh".into() }).await.unwrap(),
            Payload::Size { cols: 100, rows: 30 }
        );
        let Payload::Text { text } = client.request(&Request::List).await.unwrap() else {
            panic!("expected text");
        };
        assert!(text.starts_with("sh running"));

        client.request(&Request::KillServer).await.unwrap();
        handle.await.unwrap().unwrap();
    }
}
