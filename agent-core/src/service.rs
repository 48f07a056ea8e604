//! OS service (de)registration: the `register-as-service`/`unregister` process-bootstrap
//! commands and the control-channel `uninstall_agent` operation all delegate the actual
//! platform mechanics to this trait. Out of scope here (platform-bound); only the seam is
//! specified.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

/// Errors from the uninstall flow.
#[derive(Debug, Error)]
pub enum UninstallError {
    /// The platform collaborator failed to unregister the service.
    #[error("service unregistration failed: {0}")]
    UnregisterFailed(String),
}

/// Opaque collaborator that removes the agent's OS-level service registration. Platform
/// bound and outside this crate's scope.
pub trait ServiceInstaller: Send + Sync {
    /// Registers the agent to run as an OS service/daemon.
    fn register(&self) -> Pin<Box<dyn Future<Output = Result<(), UninstallError>> + Send>>;
    /// Removes the agent's OS service registration.
    fn unregister(&self) -> Pin<Box<dyn Future<Output = Result<(), UninstallError>> + Send>>;
}

/// Drives the uninstall operation.
pub struct UninstallHandler {
    installer: std::sync::Arc<dyn ServiceInstaller>,
}

impl UninstallHandler {
    /// Builds a handler bound to the platform service-installer collaborator.
    pub fn new(installer: std::sync::Arc<dyn ServiceInstaller>) -> Self {
        Self { installer }
    }

    /// Marks the agent for removal and unregisters its OS service entry. The caller is
    /// responsible for terminating the process after this returns.
    pub async fn uninstall(&self) -> Result<(), UninstallError> {
        self.installer.unregister().await
    }
}
