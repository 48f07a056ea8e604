//! Terminal sessions: spawns a child process behind a pluggable [`PtySpawner`] (the real
//! pseudoterminal I/O is an external collaborator, out of scope here), streams its output
//! through the session's output sink, and routes `terminal_input`/`terminal_resize` back in.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

use super::manager::{CloseSink, OutputSink, SessionKind, SessionManager};

/// Errors from terminal session operations.
#[derive(Debug, Error)]
pub enum TerminalError {
    /// The underlying pseudoterminal could not be spawned.
    #[error("failed to spawn pty: {0}")]
    SpawnFailed(String),
    /// Writing to the child's stdin failed.
    #[error("failed to write terminal input: {0}")]
    WriteFailed(String),
    /// The referenced terminal session does not exist.
    #[error("terminal session not found")]
    NotFound,
}

/// A live pseudoterminal child process. The concrete implementation (a real PTY, on Unix
/// and Windows) lives outside this crate; this trait is the seam.
pub trait PtyHandle: Send + Sync {
    /// Writes bytes to the child's stdin.
    fn write_input(&self, data: &[u8]) -> Result<(), TerminalError>;
    /// Resizes the pty viewport.
    fn resize(&self, cols: u16, rows: u16) -> Result<(), TerminalError>;
    /// Terminates the child process.
    fn kill(&self);
}

type SpawnFuture =
    Pin<Box<dyn Future<Output = Result<(Arc<dyn PtyHandle>, OutputStream), TerminalError>> + Send>>;
/// A stream of output chunks read from the child, yielded until the child exits.
pub type OutputStream = Pin<Box<dyn futures_util::Stream<Item = Vec<u8>> + Send>>;

/// Spawns a shell/pty behind this agent's platform. The real implementation (forking a pty
/// master/slave pair) is a Non-goal here — only the trait seam is specified.
pub trait PtySpawner: Send + Sync {
    /// Spawns `command` with `args` in a pseudoterminal, returning a handle plus the stream
    /// of output chunks it produces.
    fn spawn(&self, command: String, args: Vec<String>) -> SpawnFuture;
}

/// Drives terminal sessions on top of [`SessionManager`] and a [`PtySpawner`] collaborator.
pub struct TerminalHandler {
    sessions: SessionManager,
    spawner: Arc<dyn PtySpawner>,
    ptys: Arc<std::sync::Mutex<std::collections::HashMap<String, Arc<dyn PtyHandle>>>>,
}

impl TerminalHandler {
    /// Builds a handler bound to the shared session registry and a pty-spawning
    /// collaborator.
    pub fn new(sessions: SessionManager, spawner: Arc<dyn PtySpawner>) -> Self {
        Self {
            sessions,
            spawner,
            ptys: Arc::new(std::sync::Mutex::new(std::collections::HashMap::new())),
        }
    }

    /// Opens a new terminal session, registering it with the session manager and spawning a
    /// task that forwards output chunks to `on_output` until the child exits or the session
    /// is cancelled.
    pub async fn start_terminal(
        &self,
        session_id: String,
        command: String,
        args: Vec<String>,
        on_output: OutputSink,
        on_close: CloseSink,
    ) -> Result<(), TerminalError> {
        let (pty, mut output) = self.spawner.spawn(command, args).await?;

        let handle = self
            .sessions
            .create(SessionKind::Terminal, session_id.clone(), on_output.clone(), on_close)
            .map_err(|e| TerminalError::SpawnFailed(e.to_string()))?;

        self.ptys
            .lock()
            .expect("ptys mutex poisoned")
            .insert(session_id.clone(), pty.clone());

        let sessions = self.sessions.clone();
        let ptys = self.ptys.clone();
        let cancel = handle.cancel.clone();
        let sid = session_id.clone();

        tokio::spawn(async move {
            use futures_util::StreamExt;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    chunk = output.next() => {
                        match chunk {
                            Some(bytes) => on_output(bytes),
                            None => break, // child exited
                        }
                    }
                }
            }
            pty.kill();
            ptys.lock().expect("ptys mutex poisoned").remove(&sid);
            let _ = sessions.close(&sid);
        });

        Ok(())
    }

    /// Routes `terminal_input` bytes to the child identified by `session_id`.
    pub fn terminal_input(&self, session_id: &str, data: &[u8]) -> Result<(), TerminalError> {
        let ptys = self.ptys.lock().expect("ptys mutex poisoned");
        let pty = ptys.get(session_id).ok_or(TerminalError::NotFound)?;
        pty.write_input(data)
    }

    /// Routes a `terminal_resize` to the child identified by `session_id`.
    pub fn terminal_resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), TerminalError> {
        let ptys = self.ptys.lock().expect("ptys mutex poisoned");
        let pty = ptys.get(session_id).ok_or(TerminalError::NotFound)?;
        pty.resize(cols, rows)
    }

    /// Closes a terminal session: kills the child first, then removes it from the registry.
    pub fn close_terminal(&self, session_id: &str) -> Result<(), TerminalError> {
        if let Some(pty) = self.ptys.lock().expect("ptys mutex poisoned").remove(session_id) {
            pty.kill();
        }
        self.sessions
            .close(session_id)
            .map_err(|_| TerminalError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakePty {
        killed: Arc<AtomicBool>,
    }

    impl PtyHandle for FakePty {
        fn write_input(&self, _data: &[u8]) -> Result<(), TerminalError> {
            Ok(())
        }
        fn resize(&self, _cols: u16, _rows: u16) -> Result<(), TerminalError> {
            Ok(())
        }
        fn kill(&self) {
            self.killed.store(true, Ordering::SeqCst);
        }
    }

    struct FakeSpawner {
        killed: Arc<AtomicBool>,
    }

    impl PtySpawner for FakeSpawner {
        fn spawn(&self, _command: String, _args: Vec<String>) -> SpawnFuture {
            let killed = self.killed.clone();
            Box::pin(async move {
                let handle: Arc<dyn PtyHandle> = Arc::new(FakePty { killed });
                let output: OutputStream = Box::pin(stream::iter(vec![b"hello".to_vec()]));
                Ok((handle, output))
            })
        }
    }

    #[tokio::test]
    async fn terminal_session_closes_and_kills_child_when_output_ends() {
        let sessions = SessionManager::new();
        let killed = Arc::new(AtomicBool::new(false));
        let spawner = Arc::new(FakeSpawner { killed: killed.clone() });
        let handler = TerminalHandler::new(sessions.clone(), spawner);

        let received = Arc::new(std::sync::Mutex::new(Vec::new()));
        let received_clone = received.clone();
        let on_output: OutputSink = Arc::new(move |bytes| {
            received_clone.lock().unwrap().push(bytes);
        });
        let on_close: CloseSink = Arc::new(|| {});

        handler
            .start_terminal("t1".to_string(), "/bin/sh".to_string(), vec![], on_output, on_close)
            .await
            .unwrap();

        // Give the forwarding task a chance to observe end-of-stream and close.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(killed.load(Ordering::SeqCst));
        assert!(sessions.get("t1").is_none());
        assert_eq!(received.lock().unwrap().len(), 1);
    }
}
