//! Placeholder collaborator for the one platform-bound seam this binary needs: OS service
//! (de)registration. Out of scope per the Non-goals — platform-bound — so it fails loudly
//! rather than silently no-op'ing; a real deployment links a platform crate that supplies a
//! working `ServiceInstaller`.

use std::future::Future;
use std::pin::Pin;

use agent_core::service::{ServiceInstaller, UninstallError};

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
