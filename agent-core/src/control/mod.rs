//! Control-plane and data-plane WebSocket clients.

mod backoff;
pub mod client;
pub mod dataplane;

pub use backoff::Backoff;
pub use client::{ConnectionState, ControlClient, ControlClientConfig, ControlError, HandlerFn};
pub use dataplane::{DataPlaneClient, DataPlaneConfig};
