//! Daemon-wide session table

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::handle::{Session, SessionInfo};
use super::namegen::generate_unique_name;
use crate::config::SessionSettings;
use crate::error::{Error, Result};

/// Parameters for a new session
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Session id; generated when absent
    pub id: Option<String>,
    /// Shell command line to run
    pub command: String,
    pub cwd: Option<PathBuf>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

/// All sessions owned by the daemon, keyed by id
pub struct Registry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Ids claimed by starts whose spawn is still in progress
    reserved: Mutex<HashSet<String>>,
    settings: SessionSettings,
    next_serial: AtomicU64,
}

impl Registry {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            reserved: Mutex::new(HashSet::new()),
            settings,
            next_serial: AtomicU64::new(1),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Spawn and register a session.
    ///
    /// The id is reserved before the spawn and the table is only locked to
    /// claim and publish it, so two starts racing for the same id cannot both
    /// succeed while other requests proceed. An exited session's id may be
    /// reused; the frozen instance is replaced once the new one is running.
    pub fn start(&self, opts: StartOptions) -> Result<Arc<Session>> {
        if opts.command.trim().is_empty() {
            return Err(Error::InvalidArgument("command must not be empty".to_string()));
        }
        if let Some(id) = &opts.id {
            validate_id(id)?;
        }

        let id = self.reserve(opts.id)?;
        let size = (
            opts.cols.unwrap_or(self.settings.default_cols),
            opts.rows.unwrap_or(self.settings.default_rows),
        );
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let spawned = Session::spawn(
            id.clone(),
            serial,
            &opts.command,
            opts.cwd,
            size,
            &self.settings,
        );

        let mut sessions = self.sessions.write();
        self.reserved.lock().remove(&id);
        let session = spawned?;
        if let Some(previous) = sessions.insert(id, session.clone()) {
            tracing::debug!("Replaced exited session {}", previous.id());
        }
        Ok(session)
    }

    /// Claim an id for a start in progress. A live session or another
    /// pending start holding the id is a duplicate.
    fn reserve(&self, requested: Option<String>) -> Result<String> {
        let sessions = self.sessions.read();
        let mut reserved = self.reserved.lock();
        let id = match requested {
            Some(id) => {
                let live = sessions.get(&id).is_some_and(|s| !s.status().is_exited());
                if live || reserved.contains(&id) {
                    return Err(Error::DuplicateSession { id });
                }
                id
            }
            None => generate_unique_name(|name| {
                sessions.contains_key(name) || reserved.contains(name)
            }),
        };
        reserved.insert(id.clone());
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(id))
    }

    /// Terminate one session and forget it
    pub fn stop(&self, id: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .remove(id)
            .ok_or_else(|| Error::not_found(id))?;
        session.terminate();
        tracing::info!("Stopped session {}", id);
        Ok(())
    }

    /// Terminate every session, returning how many there were
    pub fn stop_all(&self) -> usize {
        let drained: Vec<Arc<Session>> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.terminate();
        }
        if !drained.is_empty() {
            tracing::info!("Stopped {} session(s)", drained.len());
        }
        drained.len()
    }

    /// Metadata for every session, sorted by id
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.sessions.read().values().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

/// Ids are typed on command lines and shown in `list`; keep them to one word
fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::InvalidArgument(format!(
            "invalid session id {:?}: must be non-empty without whitespace",
            id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;
    use std::time::Duration;

    fn registry() -> Registry {
        Registry::new(SessionSettings {
            shell: Some("/bin/sh".to_string()),
            ..SessionSettings::default()
        })
    }

    fn opts(id: Option<&str>, command: &str) -> StartOptions {
        StartOptions {
            id: id.map(str::to_string),
            command: command.to_string(),
            ..StartOptions::default()
        }
    }

    #[test]
    fn test_start_list_stop() {
        let registry = registry();
        registry.start(opts(Some("b"), "sleep 30")).unwrap();
        registry.start(opts(Some("a"), "sleep 30")).unwrap();

        let ids: Vec<String> = registry.list().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["a", "b"]);

        registry.stop("a").unwrap();
        assert_eq!(registry.len(), 1);
        assert!(matches!(registry.get("a").unwrap_err(), Error::NotFound { .. }));
        assert_eq!(registry.stop_all(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = registry();
        registry.start(opts(Some("dup"), "sleep 30")).unwrap();
        let err = registry.start(opts(Some("dup"), "sleep 30")).unwrap_err();
        assert!(matches!(err, Error::DuplicateSession { .. }));
        registry.stop_all();
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let registry = registry();
        let a = registry.start(opts(None, "sleep 30")).unwrap();
        let b = registry.start(opts(None, "sleep 30")).unwrap();
        assert_ne!(a.id(), b.id());
        assert!(a.id().contains('-'));
        registry.stop_all();
    }

    #[test]
    fn test_id_reuse_after_stop_is_a_fresh_session() {
        let registry = registry();
        let first = registry.start(opts(Some("s"), "echo one; sleep 30")).unwrap();
        registry.stop("s").unwrap();
        let second = registry.start(opts(Some("s"), "echo two; sleep 30")).unwrap();
        assert_ne!(first.serial(), second.serial());
        assert!(first.status().is_exited());
        assert_eq!(second.status(), SessionStatus::Running);
        registry.stop_all();
    }

    #[test]
    fn test_start_replaces_exited_session() {
        let registry = registry();
        let first = registry.start(opts(Some("job"), "exit 1")).unwrap();
        assert!(first.wait_exited(Duration::from_secs(5)));

        let second = registry.start(opts(Some("job"), "sleep 30")).unwrap();
        assert_ne!(first.serial(), second.serial());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("job").unwrap().serial(), second.serial());
        assert_eq!(registry.list()[0].status, SessionStatus::Running);

        // A running one is still protected
        let err = registry.start(opts(Some("job"), "sleep 30")).unwrap_err();
        assert!(matches!(err, Error::DuplicateSession { .. }));
        registry.stop_all();
    }

    #[test]
    fn test_racing_starts_for_one_id() {
        let registry = Arc::new(registry());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.start(opts(Some("race"), "sleep 30")).is_ok())
            })
            .collect();
        let won = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(won, 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.reserved.lock().is_empty());
        registry.stop_all();
    }

    #[test]
    fn test_stop_self_exited_session() {
        let registry = registry();
        let session = registry.start(opts(Some("quick"), "exit 7")).unwrap();
        assert!(session.wait_exited(Duration::from_secs(5)));
        // Exited sessions stay listed until stopped or replaced
        assert_eq!(registry.list()[0].status, SessionStatus::Exited(7));
        registry.stop("quick").unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_start_applies_size_and_defaults() {
        let registry = registry();
        let sized = registry
            .start(StartOptions {
                cols: Some(132),
                rows: Some(50),
                ..opts(Some("sized"), "sleep 30")
            })
            .unwrap();
        assert_eq!(sized.size(), (132, 50));
        let default = registry.start(opts(Some("default"), "sleep 30")).unwrap();
        assert_eq!(default.size(), (80, 24));
        registry.stop_all();
    }

    #[test]
    fn test_invalid_start_arguments() {
        let registry = registry();
        assert!(matches!(
            registry.start(opts(Some("bad id"), "true")).unwrap_err(),
            Error::InvalidArgument(_)
        ));
        assert!(matches!(
            registry.start(opts(None, "  ")).unwrap_err(),
            Error::InvalidArgument(_)
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_spawn_failure_is_not_registered() {
        let registry = registry();
        let err = registry
            .start(StartOptions {
                cwd: Some(PathBuf::from("/nonexistent/termhub")),
                ..opts(Some("broken"), "true")
            })
            .unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
        assert!(registry.is_empty());

        // The failed start gave its id back
        registry.start(opts(Some("broken"), "sleep 30")).unwrap();
        registry.stop_all();
    }
}
