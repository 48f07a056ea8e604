//! Placeholder collaborators for the platform-bound seams this crate only specifies as
//! traits: pseudoterminal I/O, remote-desktop peer connections, platform input injection,
//! and OS service (de)registration. None of these are implementable in a way that is
//! portable across the host operating systems this agent targets, so every method here
//! fails loudly rather than silently no-op'ing — a real deployment links a platform crate
//! that supplies working implementations of these same traits.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use agent_core::sessions::remote_desktop::OutputStream as DesktopOutputStream;
use agent_core::sessions::terminal::OutputStream as TerminalOutputStream;
use agent_core::sessions::{
    DesktopSessionFactory, PeerConnection, PlatformInputDriver, PtyHandle, PtySpawner,
    RemoteDesktopError, TerminalError,
};
use agent_core::service::{ServiceInstaller, UninstallError};

/// Returns the OS filesystem root that `FileTransferHandler` is rooted at. A production
/// deployment may prefer scoping this to a narrower managed directory; the full root
/// matches the remote-file-management expectations of this class of agent.
pub fn filesystem_root() -> PathBuf {
    #[cfg(windows)]
    {
        PathBuf::from("C:\\")
    }
    #[cfg(not(windows))]
    {
        PathBuf::from("/")
    }
}

pub struct UnimplementedPtySpawner;

impl PtySpawner for UnimplementedPtySpawner {
    fn spawn(
        &self,
        _command: String,
        _args: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<(Arc<dyn PtyHandle>, TerminalOutputStream), TerminalError>> + Send>>
    {
        Box::pin(async {
            Err(TerminalError::SpawnFailed(
                "pseudoterminal I/O is not implemented on this build".to_string(),
            ))
        })
    }
}

pub struct UnimplementedDesktopSessionFactory;

impl DesktopSessionFactory for UnimplementedDesktopSessionFactory {
    fn create(
        &self,
        _session_id: String,
    ) -> Pin<Box<dyn Future<Output = Result<(Arc<dyn PeerConnection>, DesktopOutputStream), RemoteDesktopError>> + Send>>
    {
        Box::pin(async {
            Err(RemoteDesktopError::FactoryFailed(
                "remote desktop is not implemented on this build".to_string(),
            ))
        })
    }
}

pub struct UnimplementedInputDriver;

impl PlatformInputDriver for UnimplementedInputDriver {
    fn apply_input(&self, _event: serde_json::Value) {
        log::warn!("dropping remote_input event: no platform input driver on this build");
    }
}

pub struct UnimplementedServiceInstaller;

impl ServiceInstaller for UnimplementedServiceInstaller {
    fn register(&self) -> Pin<Box<dyn Future<Output = Result<(), UninstallError>> + Send>> {
        Box::pin(async {
            Err(UninstallError::UnregisterFailed(
                "service registration is not implemented on this build".to_string(),
            ))
        })
    }

    fn unregister(&self) -> Pin<Box<dyn Future<Output = Result<(), UninstallError>> + Send>> {
        Box::pin(async {
            Err(UninstallError::UnregisterFailed(
                "service unregistration is not implemented on this build".to_string(),
            ))
        })
    }
}
