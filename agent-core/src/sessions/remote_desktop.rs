//! Remote-desktop / WebRTC sessions: the fabric around an opaque peer-connection factory.
//! Media engine, ICE negotiation, and screen capture are external collaborators (out of
//! scope); this module binds their signaling to the control channel and their input events
//! to a platform input driver, with hard timeouts around anything that can hang.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::manager::{CloseSink, OutputSink, SessionKind, SessionManager};

/// Errors from remote-desktop session operations.
#[derive(Debug, Error)]
pub enum RemoteDesktopError {
    /// The peer-connection factory failed to create a session.
    #[error("failed to create remote desktop session: {0}")]
    FactoryFailed(String),
    /// Setting the remote description did not complete within the hard timeout.
    #[error("set_remote_description timed out")]
    SignalTimeout,
    /// The referenced session does not exist.
    #[error("remote desktop session not found")]
    NotFound,
}

/// Hard deadline for any single peer-connection negotiation step. The underlying native
/// media library can hang on malformed input, so these steps always run in an
/// independently spawned task wrapped in a timeout rather than being awaited inline.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(15);

/// A live remote-desktop peer connection, created by a [`DesktopSessionFactory`].
pub trait PeerConnection: Send + Sync {
    /// Applies a remote SDP answer or ICE candidate.
    fn set_remote_description(
        &self,
        sdp: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), RemoteDesktopError>> + Send>>;
    /// Tears the connection down.
    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

type CreateFuture = Pin<
    Box<dyn Future<Output = Result<(Arc<dyn PeerConnection>, OutputStream), RemoteDesktopError>> + Send>,
>;
/// Stream of outgoing signaling messages (ICE candidates, SDP answer) and video/input
/// frames produced by the peer connection.
pub type OutputStream = Pin<Box<dyn futures_util::Stream<Item = Vec<u8>> + Send>>;

/// Opaque collaborator responsible for media engine setup, ICE negotiation, and screen
/// capture. The concrete implementation is platform-specific and outside this crate.
pub trait DesktopSessionFactory: Send + Sync {
    /// Creates a new peer connection for `session_id`.
    fn create(&self, session_id: String) -> CreateFuture;
}

/// Opaque collaborator that applies incoming input events (mouse, keyboard) to the host.
/// Platform-specific and outside this crate.
pub trait PlatformInputDriver: Send + Sync {
    /// Applies one input event, given as an opaque JSON payload.
    fn apply_input(&self, event: serde_json::Value);
}

/// Filters ICE candidate lines that reference an mDNS `.local` address, which can block on
/// name resolution inside the signaling hot path.
pub fn sanitize_sdp(sdp: &str) -> String {
    sdp.lines()
        .filter(|line| !(line.contains("candidate") && line.contains(".local")))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Drives remote-desktop sessions on top of [`SessionManager`] and a
/// [`DesktopSessionFactory`] collaborator.
pub struct RemoteDesktopHandler {
    sessions: SessionManager,
    factory: Arc<dyn DesktopSessionFactory>,
    input_driver: Arc<dyn PlatformInputDriver>,
    peers: Arc<std::sync::Mutex<std::collections::HashMap<String, Arc<dyn PeerConnection>>>>,
}

impl RemoteDesktopHandler {
    /// Builds a handler bound to the shared session registry and the platform-specific
    /// collaborators.
    pub fn new(
        sessions: SessionManager,
        factory: Arc<dyn DesktopSessionFactory>,
        input_driver: Arc<dyn PlatformInputDriver>,
    ) -> Self {
        Self {
            sessions,
            factory,
            input_driver,
            peers: Arc::new(std::sync::Mutex::new(std::collections::HashMap::new())),
        }
    }

    /// Starts a new remote-desktop session: creates the peer connection via the factory and
    /// forwards its outgoing signaling/frames through `on_output` until closed.
    pub async fn start_remote(
        &self,
        session_id: String,
        on_output: OutputSink,
        on_close: CloseSink,
    ) -> Result<(), RemoteDesktopError> {
        let (peer, mut output) = self.factory.create(session_id.clone()).await?;

        let handle = self
            .sessions
            .create(SessionKind::RemoteDesktop, session_id.clone(), on_output.clone(), on_close)
            .map_err(|e| RemoteDesktopError::FactoryFailed(e.to_string()))?;

        self.peers
            .lock()
            .expect("peers mutex poisoned")
            .insert(session_id.clone(), peer.clone());

        let sessions = self.sessions.clone();
        let peers = self.peers.clone();
        let cancel = handle.cancel.clone();
        let sid = session_id.clone();

        tokio::spawn(async move {
            use futures_util::StreamExt;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = output.next() => {
                        match frame {
                            Some(bytes) => on_output(bytes),
                            None => break,
                        }
                    }
                }
            }
            peer.close().await;
            peers.lock().expect("peers mutex poisoned").remove(&sid);
            let _ = sessions.close(&sid);
        });

        Ok(())
    }

    /// Applies an incoming SDP answer or ICE candidate, sanitizing mDNS candidates first and
    /// running the apply in an independently spawned task with a hard timeout since the
    /// underlying native library can hang.
    pub async fn webrtc_signal(&self, session_id: &str, sdp: String) -> Result<(), RemoteDesktopError> {
        let peer = self
            .peers
            .lock()
            .expect("peers mutex poisoned")
            .get(session_id)
            .cloned()
            .ok_or(RemoteDesktopError::NotFound)?;

        let sanitized = sanitize_sdp(&sdp);
        let task = tokio::spawn(async move { peer.set_remote_description(sanitized).await });

        match tokio::time::timeout(NEGOTIATION_TIMEOUT, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(_join_error)) => Err(RemoteDesktopError::FactoryFailed("negotiation task panicked".into())),
            Err(_) => Err(RemoteDesktopError::SignalTimeout),
        }
    }

    /// Routes an incoming `remote_input` event to the platform input driver.
    pub fn remote_input(&self, event: serde_json::Value) {
        self.input_driver.apply_input(event);
    }

    /// Stops an active remote-desktop session, tearing down its peer connection with the
    /// same hard timeout used for negotiation.
    pub async fn stop_remote(&self, session_id: &str) -> Result<(), RemoteDesktopError> {
        let peer = self
            .peers
            .lock()
            .expect("peers mutex poisoned")
            .remove(session_id);
        if let Some(peer) = peer {
            let _ = tokio::time::timeout(NEGOTIATION_TIMEOUT, peer.close()).await;
        }
        self.sessions
            .close(session_id)
            .map_err(|_| RemoteDesktopError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_sdp_drops_mdns_candidates() {
        let sdp = "a=candidate:1 1 UDP 2 192.168.1.1 1 typ host\n\
                   a=candidate:2 1 UDP 2 8f3a.local 1 typ host\n\
                   v=0";
        let cleaned = sanitize_sdp(sdp);
        assert!(!cleaned.contains(".local"));
        assert!(cleaned.contains("192.168.1.1"));
        assert!(cleaned.contains("v=0"));
    }
}
