//! Request dispatch
//!
//! The router turns one decoded [`Request`] into a response. It is
//! synchronous (session operations may block briefly on a pty) and is driven
//! from the server through `spawn_blocking`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ansi::{self, Reassembler};
use crate::error::{Error, Result};
use crate::ipc::protocol::{Payload, Request, Response, VERSION};
use crate::keys;
use crate::session::{Registry, Session, StartOptions, Subscription};

/// Per-connection state carried between requests
#[derive(Debug, Default)]
pub struct ConnectionState {
    /// Since-last cursors, keyed by session serial so a re-created session
    /// with the same id starts from scratch
    cursors: HashMap<u64, u64>,
}

/// What the server should do after a request
pub enum Outcome {
    /// Send the response and keep serving requests
    Reply(Response),
    /// Send the response, then push the subscription's output
    Follow {
        response: Response,
        subscription: Subscription,
        session: Arc<Session>,
        strip_ansi: bool,
        /// Carries a sequence split between the backlog and the live feed
        stream: Reassembler,
    },
    /// Send the response, then run an interactive attach
    Attach {
        response: Response,
        session: Arc<Session>,
    },
    /// Send the response, then shut the daemon down
    Shutdown(Response),
}

impl Outcome {
    pub fn response(&self) -> &Response {
        match self {
            Outcome::Reply(response)
            | Outcome::Follow { response, .. }
            | Outcome::Attach { response, .. }
            | Outcome::Shutdown(response) => response,
        }
    }
}

/// Dispatches requests against the session registry
#[derive(Clone)]
pub struct Router {
    registry: Arc<Registry>,
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Handle one request. Failures become `{error, kind}` responses
    pub fn dispatch(&self, request: Request, conn: &mut ConnectionState) -> Outcome {
        match request {
            Request::List => Outcome::Reply(self.list().into()),
            Request::Start {
                command,
                name,
                cwd,
                cols,
                rows,
            } => {
                let result = self
                    .registry
                    .start(StartOptions {
                        id: name,
                        command,
                        cwd,
                        cols,
                        rows,
                    })
                    .map(|session| Payload::Id {
                        id: session.id().to_string(),
                    });
                Outcome::Reply(result.into())
            }
            Request::Stop { id } => Outcome::Reply(self.stop(id).into()),
            Request::Attach { id } => match self.attach(&id) {
                Ok(session) => Outcome::Attach {
                    response: Response::Ok(Payload::Attached { id }),
                    session,
                },
                Err(e) => Outcome::Reply(e.into()),
            },
            Request::Stdout { id, lines } => {
                let result = self.registry.get(&id).map(|session| Payload::Text {
                    text: session.read_rendered(lines),
                });
                Outcome::Reply(result.into())
            }
            Request::Stream {
                id,
                since_last,
                strip_ansi,
                cursor,
                follow,
            } => match self.stream(conn, &id, since_last, strip_ansi, cursor, follow) {
                Ok(outcome) => outcome,
                Err(e) => Outcome::Reply(e.into()),
            },
            Request::Stdin { id, data, literal } => {
                Outcome::Reply(self.stdin(&id, &data, literal).into())
            }
            Request::Resize { id, cols, rows } => {
                Outcome::Reply(self.resize(&id, cols, rows).into())
            }
            Request::TermSize { id } => {
                let result = self.registry.get(&id).map(|session| {
                    let (cols, rows) = session.size();
                    Payload::Size { cols, rows }
                });
                Outcome::Reply(result.into())
            }
            Request::Version => Outcome::Reply(Response::Ok(Payload::Version {
                version: VERSION.to_string(),
            })),
            Request::KillServer => {
                let stopped = self.registry.stop_all();
                Outcome::Shutdown(Response::status(format!(
                    "stopped {} session(s), server exiting",
                    stopped
                )))
            }
        }
    }

    fn list(&self) -> Result<Payload> {
        let sessions = self.registry.list();
        let text = if sessions.is_empty() {
            "no active sessions".to_string()
        } else {
            sessions
                .iter()
                .map(|info| info.list_line())
                .collect::<Vec<_>>()
                .join("\n")
        };
        Ok(Payload::Text { text })
    }

    fn stop(&self, id: Option<String>) -> Result<Payload> {
        let message = match id {
            Some(id) => {
                self.registry.stop(&id)?;
                format!("stopped {}", id)
            }
            None => format!("stopped {} session(s)", self.registry.stop_all()),
        };
        Ok(Payload::Status { message })
    }

    fn attach(&self, id: &str) -> Result<Arc<Session>> {
        let session = self.registry.get(id)?;
        if session.status().is_exited() {
            return Err(Error::not_running(id));
        }
        Ok(session)
    }

    fn stream(
        &self,
        conn: &mut ConnectionState,
        id: &str,
        since_last: bool,
        strip_ansi: bool,
        cursor: Option<u64>,
        follow: bool,
    ) -> Result<Outcome> {
        let session = self.registry.get(id)?;
        let serial = session.serial();
        let from = match cursor {
            Some(cursor) => Some(cursor),
            None if since_last => Some(conn.cursors.get(&serial).copied().unwrap_or(0)),
            None => None,
        };

        if follow {
            let subscription = session.subscribe(from);
            let mut stream = Reassembler::default();
            let backlog = stream.push(&subscription.backlog);
            let cursor = subscription.cursor - stream.pending_len() as u64;
            if since_last {
                conn.cursors.insert(serial, cursor);
            }
            let data = if strip_ansi {
                ansi::strip(&backlog)
            } else {
                backlog
            };
            let response = Response::Ok(Payload::Stream { data, cursor });
            return Ok(Outcome::Follow {
                response,
                subscription,
                session,
                strip_ansi,
                stream,
            });
        }

        let (data, next) = session.read_raw(from, strip_ansi);
        if since_last {
            conn.cursors.insert(serial, next);
        }
        Ok(Outcome::Reply(Response::Ok(Payload::Stream {
            data,
            cursor: next,
        })))
    }

    fn stdin(&self, id: &str, data: &[String], literal: bool) -> Result<Payload> {
        let session = self.registry.get(id)?;
        let chunks: Vec<Vec<u8>> = data
            .iter()
            .map(|token| keys::translate(std::slice::from_ref(token), literal))
            .collect();
        session.write_all(&chunks)?;
        Ok(Payload::Status {
            message: "ok".to_string(),
        })
    }

    fn resize(&self, id: &str, cols: i64, rows: i64) -> Result<Payload> {
        let check = |name: &str, value: i64| {
            u16::try_from(value)
                .ok()
                .filter(|v| *v > 0)
                .ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "{} must be between 1 and {}, got {}",
                        name,
                        u16::MAX,
                        value
                    ))
                })
        };
        let (cols, rows) = (check("cols", cols)?, check("rows", rows)?);
        self.registry.get(id)?.resize(cols, rows)?;
        Ok(Payload::Status {
            message: "ok".to_string(),
        })
    }
}
