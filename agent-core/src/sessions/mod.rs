//! Session registry and per-kind operation handlers: terminal, remote-desktop/WebRTC, file
//! transfer, and diagnostics. Every handler shares the same [`SessionManager`] registry so
//! peers can look sessions up by id regardless of which handler created them. OS service
//! (de)registration lives in [`crate::service`] since it has nothing to do with the session
//! registry.

pub mod command;
pub mod diagnostics;
pub mod file_transfer;
pub mod manager;
pub mod remote_desktop;
pub mod terminal;

pub use command::{CommandError, CommandHandler, CommandOutput};
pub use diagnostics::{DiagnosticsError, DiagnosticsHandler, DiagnosticsReport};
pub use file_transfer::{FileEntry, FileTransferError, FileTransferHandler};
pub use manager::{CloseSink, OutputSink, SessionError, SessionHandle, SessionKind, SessionManager};
pub use remote_desktop::{
    DesktopSessionFactory, PeerConnection, PlatformInputDriver, RemoteDesktopError,
    RemoteDesktopHandler,
};
pub use terminal::{PtyHandle, PtySpawner, TerminalError, TerminalHandler};
