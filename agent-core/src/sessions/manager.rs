//! Session registry: a keyed map of active long-lived operations (terminals, remote-desktop
//! peer connections, file transfers), each with its own output stream and cancellation
//! handle, behind a single short-held `Mutex`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// The kind of long-lived operation a session represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// An interactive shell session.
    Terminal,
    /// A remote-desktop / WebRTC peer connection.
    RemoteDesktop,
    /// A chunked file transfer or directory scan in progress.
    FileTransfer,
}

/// A sink the session's producer writes output frames to. Invoked only from the session's
/// own task — never called reentrantly into [`SessionManager`] methods.
pub type OutputSink = Arc<dyn Fn(Vec<u8>) + Send + Sync>;
/// A sink invoked exactly once when the session is closed, either explicitly via
/// [`SessionManager::close`] or because the session died on its own (child process exit,
/// peer failure).
pub type CloseSink = Arc<dyn Fn() + Send + Sync>;

/// Errors from session registry operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// `create` was called with a `session_id` already registered.
    #[error("session {0} already exists")]
    AlreadyExists(String),
    /// The referenced session isn't registered.
    #[error("session {0} not found")]
    NotFound(String),
}

struct SessionEntry {
    kind: SessionKind,
    created_at: i64,
    cancel: CancellationToken,
    output: OutputSink,
    on_close: CloseSink,
    closed: Arc<AtomicBool>,
}

/// A live handle returned by [`SessionManager::create`] and [`SessionManager::get`].
#[derive(Clone)]
pub struct SessionHandle {
    /// Server-assigned session identifier.
    pub session_id: String,
    /// Kind of operation this session represents.
    pub kind: SessionKind,
    /// Cancellation handle the session's producer task selects on.
    pub cancel: CancellationToken,
    /// Output sink the producer writes frames to.
    pub output: OutputSink,
}

/// Registry of active sessions.
#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<Mutex<HashMap<String, SessionEntry>>>,
}

impl SessionManager {
    /// Builds an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new session. Fails with [`SessionError::AlreadyExists`] if `session_id`
    /// is already registered — the existing session is left untouched.
    pub fn create(
        &self,
        kind: SessionKind,
        session_id: impl Into<String>,
        on_output: OutputSink,
        on_close: CloseSink,
    ) -> Result<SessionHandle, SessionError> {
        let session_id = session_id.into();
        let mut sessions = self.sessions.lock().expect("sessions mutex poisoned");
        if sessions.contains_key(&session_id) {
            return Err(SessionError::AlreadyExists(session_id));
        }

        let cancel = CancellationToken::new();
        let entry = SessionEntry {
            kind,
            created_at: now_unix(),
            cancel: cancel.clone(),
            output: on_output.clone(),
            on_close,
            closed: Arc::new(AtomicBool::new(false)),
        };
        sessions.insert(session_id.clone(), entry);

        Ok(SessionHandle {
            session_id,
            kind,
            cancel,
            output: on_output,
        })
    }

    /// Looks up an active session by id.
    pub fn get(&self, session_id: &str) -> Option<SessionHandle> {
        let sessions = self.sessions.lock().expect("sessions mutex poisoned");
        sessions.get(session_id).map(|entry| SessionHandle {
            session_id: session_id.to_string(),
            kind: entry.kind,
            cancel: entry.cancel.clone(),
            output: entry.output.clone(),
        })
    }

    /// Returns the Unix timestamp the session was created at, if it exists.
    pub fn created_at(&self, session_id: &str) -> Option<i64> {
        self.sessions
            .lock()
            .expect("sessions mutex poisoned")
            .get(session_id)
            .map(|e| e.created_at)
    }

    /// Cancels the session's producer, invokes `on_close` exactly once, then removes the
    /// registry entry. Safe to call more than once or concurrently with the session dying
    /// on its own — the close callback still fires exactly once.
    pub fn close(&self, session_id: &str) -> Result<(), SessionError> {
        let entry = {
            let mut sessions = self.sessions.lock().expect("sessions mutex poisoned");
            sessions.remove(session_id)
        };
        let Some(entry) = entry else {
            return Err(SessionError::NotFound(session_id.to_string()));
        };

        entry.cancel.cancel();
        if entry
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            (entry.on_close)();
        }
        Ok(())
    }

    /// Cancels every active session concurrently, invoking each `on_close` exactly once,
    /// then clears the registry. Used on shutdown.
    pub fn close_all(&self) {
        let entries: Vec<SessionEntry> = {
            let mut sessions = self.sessions.lock().expect("sessions mutex poisoned");
            sessions.drain().map(|(_, v)| v).collect()
        };
        for entry in entries {
            entry.cancel.cancel();
            if entry
                .closed
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                (entry.on_close)();
            }
        }
    }

    /// Number of currently registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().expect("sessions mutex poisoned").len()
    }

    /// Whether the registry currently holds no sessions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn duplicate_create_is_rejected_and_leaves_existing_session() {
        let sm = SessionManager::new();
        let noop_out: OutputSink = Arc::new(|_| {});
        let noop_close: CloseSink = Arc::new(|| {});

        sm.create(SessionKind::Terminal, "s1", noop_out.clone(), noop_close.clone())
            .unwrap();
        let result = sm.create(SessionKind::Terminal, "s1", noop_out, noop_close);

        assert_eq!(result, Err(SessionError::AlreadyExists("s1".to_string())));
        assert!(sm.get("s1").is_some());
    }

    #[test]
    fn close_fires_on_close_exactly_once() {
        let sm = SessionManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let noop_out: OutputSink = Arc::new(|_| {});
        let on_close: CloseSink = Arc::new(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        sm.create(SessionKind::Terminal, "s1", noop_out, on_close).unwrap();
        sm.close("s1").unwrap();
        assert!(sm.close("s1").is_err());

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_all_closes_every_session_once() {
        let sm = SessionManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let noop_out: OutputSink = Arc::new(|_| {});

        for id in ["s1", "s2", "s3"] {
            let count_clone = count.clone();
            let on_close: CloseSink = Arc::new(move || {
                count_clone.fetch_add(1, Ordering::SeqCst);
            });
            sm.create(SessionKind::Terminal, id, noop_out.clone(), on_close)
                .unwrap();
        }

        sm.close_all();
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(sm.is_empty());
    }
}
