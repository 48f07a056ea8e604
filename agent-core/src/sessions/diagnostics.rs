//! Diagnostics collection, reusing the same host/process fact-gathering helpers used to
//! populate the enrollment request body.

use serde::Serialize;
use thiserror::Error;

use crate::sysinfo::{self, SysInfoError};

/// Errors collecting diagnostics.
#[derive(Debug, Error)]
pub enum DiagnosticsError {
    /// Host fact collection failed.
    #[error(transparent)]
    SysInfo(#[from] SysInfoError),
}

/// Diagnostics payload returned for a `collect_diagnostics` request.
#[derive(Debug, Serialize)]
pub struct DiagnosticsReport {
    /// Host facts, the same set gathered at enrollment.
    pub host: sysinfo::HostFacts,
    /// Currently running agent version.
    pub agent_version: String,
    /// Process uptime, in seconds.
    pub uptime_secs: u64,
}

/// Collects a diagnostics snapshot.
pub struct DiagnosticsHandler {
    agent_version: String,
    started_at: std::time::Instant,
}

impl DiagnosticsHandler {
    /// Builds a handler that reports `agent_version` and measures uptime from construction
    /// time (which should be startup time).
    pub fn new(agent_version: String) -> Self {
        Self {
            agent_version,
            started_at: std::time::Instant::now(),
        }
    }

    /// Gathers the current diagnostics snapshot.
    pub fn collect(&self) -> Result<DiagnosticsReport, DiagnosticsError> {
        Ok(DiagnosticsReport {
            host: sysinfo::collect_host_facts()?,
            agent_version: self.agent_version.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_returns_a_populated_report() {
        let handler = DiagnosticsHandler::new("1.0.0".to_string());
        let report = handler.collect().unwrap();
        assert_eq!(report.agent_version, "1.0.0");
        assert!(!report.host.hostname.is_empty());
    }
}
