//! Client side of the daemon socket
//!
//! One-shot commands open a connection, send a single request and read the
//! reply. Streaming commands keep the [`Connection`] and read frames from it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use crate::error::{Error, Result};
use crate::ipc::protocol::*;

/// Handle for reaching the daemon at a socket path
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl DaemonClient {
    pub fn new(socket_path: PathBuf, timeout: Duration) -> Self {
        Self {
            socket_path,
            timeout,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Open a connection; an absent or dead socket is [`Error::NoServer`]
    pub async fn connect(&self) -> Result<Connection> {
        let connect = UnixStream::connect(&self.socket_path);
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(stream)) => Ok(Connection::new(stream, self.timeout)),
            Ok(Err(e)) => {
                tracing::debug!("Connect to {} failed: {}", self.socket_path.display(), e);
                Err(self.no_server())
            }
            Err(_) => Err(self.no_server()),
        }
    }

    /// Send one request on a fresh connection and return its payload
    pub async fn request(&self, request: &Request) -> Result<Payload> {
        let mut conn = self.connect().await?;
        conn.call(request).await
    }

    fn no_server(&self) -> Error {
        Error::NoServer {
            path: self.socket_path.display().to_string(),
        }
    }
}

/// An open daemon connection
pub struct Connection {
    reader: FrameReader,
    writer: FrameWriter,
    timeout: Duration,
}

impl Connection {
    fn new(stream: UnixStream, timeout: Duration) -> Self {
        let (read, write) = stream.into_split();
        Self {
            reader: FrameReader {
                lines: BufReader::new(read).lines(),
            },
            writer: FrameWriter { inner: write },
            timeout,
        }
    }

    /// Request/response exchange, bounded by the client timeout
    pub async fn call(&mut self, request: &Request) -> Result<Payload> {
        let timeout = self.timeout;
        let exchange = async {
            self.writer.send(request).await?;
            match self.reader.recv::<Response>().await? {
                Some(response) => response.into_result(),
                None => Err(Error::Protocol(
                    "connection closed before a response arrived".to_string(),
                )),
            }
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no response within {}ms", timeout.as_millis()),
            ))),
        }
    }

    pub async fn send<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        self.writer.send(msg).await
    }

    /// Write bytes as-is, newline included
    pub async fn send_raw(&mut self, line: &[u8]) -> Result<()> {
        self.writer.send_raw(line).await
    }

    /// Next message, or `None` once the daemon closes the connection
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        self.reader.recv().await
    }

    /// Split for concurrent reading and writing during an attach
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

/// Receiving half of a [`Connection`]
pub struct FrameReader {
    lines: Lines<BufReader<OwnedReadHalf>>,
}

impl FrameReader {
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        loop {
            match self.lines.next_line().await? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return decode(line.as_bytes()).map(Some),
                None => return Ok(None),
            }
        }
    }
}

/// Sending half of a [`Connection`]
pub struct FrameWriter {
    inner: OwnedWriteHalf,
}

impl FrameWriter {
    pub async fn send<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        let line = encode(msg)?;
        self.send_raw(&line).await
    }

    pub async fn send_raw(&mut self, line: &[u8]) -> Result<()> {
        self.inner.write_all(line).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn test_missing_socket_is_no_server() {
        let dir = tempfile::tempdir().unwrap();
        let client = DaemonClient::new(dir.path().join("none.sock"), Duration::from_secs(1));
        let err = client.request(&Request::List).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoServer);
        assert!(err.to_string().contains("none.sock"));
    }

    #[tokio::test]
    async fn test_request_times_out_on_silent_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silent.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let accept = tokio::spawn(async move {
            // Hold the connection open without answering
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(stream);
        });

        let client = DaemonClient::new(path, Duration::from_millis(200));
        let err = client.request(&Request::Version).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        accept.abort();
    }

    #[tokio::test]
    async fn test_remote_error_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.split();
            let mut lines = BufReader::new(read).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            assert!(line.contains("\"action\":\"stdout\""));
            write
                .write_all(b"{\"error\":\"session not found: x\",\"kind\":\"not_found\"}\n")
                .await
                .unwrap();
        });

        let client = DaemonClient::new(path, Duration::from_secs(2));
        let err = client
            .request(&Request::Stdout {
                id: "x".into(),
                lines: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "session not found: x");
    }
}
