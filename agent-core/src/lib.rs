//! # agent-core
//!
//! Connection fabric and operation multiplexer for the endpoint management agent: the
//! control-plane client, the session registry, the offline queue, the self-update state
//! machine, and the ambient stack (config, logging, HTTP, supervisor IPC) that ties them
//! together. The daemon and CLI binaries are thin wiring over this crate.
//!
//! Modules are feature-gated so a consumer only pulls in the dependencies it needs; the
//! `full` feature enables every module, which is what `agent-daemon` depends on.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Persisted agent identity and runtime configuration, loaded with CLI > env > file > default
/// precedence.
#[cfg(feature = "config")]
pub mod config;

/// Generic retrying HTTP client used for enrollment, version checks, and binary downloads.
#[cfg(feature = "http")]
pub mod http;

/// One-time HTTP enrollment handshake shared by the CLI and daemon entry points.
#[cfg(feature = "enrollment")]
pub mod enrollment;

/// Host and process fact-gathering shared by enrollment and diagnostics.
#[cfg(feature = "sysinfo")]
pub mod sysinfo;

/// Structured, rotated local logging.
#[cfg(feature = "logging")]
pub mod logging;

/// Durable, bounded, prioritized offline queue backed by `rusqlite`.
#[cfg(feature = "queue")]
pub mod queue;

/// Wire protocol shared by the control-plane and data-plane clients.
#[cfg(feature = "control")]
pub mod protocol;

/// Control-plane and data-plane websocket clients, reconnect/backoff, request correlation.
#[cfg(feature = "control")]
pub mod control;

/// Session registry and per-kind operation handlers.
#[cfg(feature = "sessions")]
pub mod sessions;

/// Self-update state machine: version check, staged download, checksum verification.
#[cfg(feature = "updater")]
pub mod update;

/// Out-of-band IPC to the external supervisor that performs the binary swap.
#[cfg(feature = "supervisor")]
pub mod supervisor;

/// OS service (de)registration seam shared by the process-bootstrap CLI and the daemon's
/// `uninstall_agent` control operation.
#[cfg(feature = "service")]
pub mod service;
