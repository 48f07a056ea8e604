//! Host and process fact-gathering shared by the enrollment request body and the
//! diagnostics operation handler.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors collecting host facts.
#[derive(Debug, Error)]
pub enum SysInfoError {
    /// The system hostname could not be determined.
    #[error("failed to read hostname: {0}")]
    Hostname(#[source] std::io::Error),
    /// The hostname was not valid UTF-8.
    #[error("hostname is not valid UTF-8")]
    HostnameEncoding,
    /// The local IP address could not be determined.
    #[error("failed to resolve local IP address: {0}")]
    LocalIp(#[source] local_ip_address::Error),
}

/// Static and near-static facts about the host the agent runs on, sent at enrollment and
/// reused by diagnostics collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostFacts {
    /// Machine hostname.
    pub hostname: String,
    /// `std::env::consts::OS` ("linux", "windows", "macos", ...).
    pub os_type: String,
    /// Best-effort OS version string.
    pub os_version: String,
    /// `std::env::consts::ARCH` ("x86_64", "aarch64", ...).
    pub architecture: String,
    /// Number of logical CPUs.
    pub cpu_count: usize,
    /// CPU model string, when available.
    pub cpu_brand: Option<String>,
    /// Total physical memory, in bytes.
    pub memory_total: u64,
    /// Memory currently available, in bytes.
    pub memory_available: u64,
    /// Total storage capacity of the volume the agent is installed on, in bytes.
    pub storage_total: u64,
    /// Hardware serial number, when the platform exposes one.
    pub serial: Option<String>,
    /// Hardware manufacturer, when known.
    pub manufacturer: Option<String>,
    /// Hardware model, when known.
    pub model: Option<String>,
    /// Windows domain or equivalent, when joined.
    pub domain: Option<String>,
    /// Primary local IP address.
    pub ip_address: Option<String>,
    /// Primary network interface MAC address, when available.
    pub mac_address: Option<String>,
}

/// Process-level facts written after every startup so the supervisor can judge whether a
/// freshly-applied update came up healthy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Running agent version.
    pub version: String,
    /// Unix timestamp (seconds) the process started.
    pub started_at: i64,
    /// Process id.
    pub pid: u32,
    /// Stable agent identifier.
    pub agent_id: String,
}

/// Collects the facts used in the enrollment request body and diagnostics responses.
///
/// Fields this platform cannot determine are left `None` rather than failing the whole
/// collection — enrollment and diagnostics both tolerate partial facts.
pub fn collect_host_facts() -> Result<HostFacts, SysInfoError> {
    let hostname = hostname::get()
        .map_err(SysInfoError::Hostname)?
        .into_string()
        .map_err(|_| SysInfoError::HostnameEncoding)?;

    let ip_address = local_ip_address::local_ip()
        .map(|ip| ip.to_string())
        .ok();

    let (memory_total, memory_available) = memory_bytes();

    Ok(HostFacts {
        hostname,
        os_type: std::env::consts::OS.to_string(),
        os_version: os_version(),
        architecture: std::env::consts::ARCH.to_string(),
        cpu_count: std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
        cpu_brand: None,
        memory_total,
        memory_available,
        storage_total: 0,
        serial: None,
        manufacturer: None,
        model: None,
        domain: None,
        ip_address,
        mac_address: None,
    })
}

fn os_version() -> String {
    std::env::consts::OS.to_string()
}

#[cfg(target_os = "linux")]
fn memory_bytes() -> (u64, u64) {
    let meminfo = match std::fs::read_to_string("/proc/meminfo") {
        Ok(s) => s,
        Err(_) => return (0, 0),
    };
    let mut total = 0u64;
    let mut available = 0u64;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = parse_kb(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = parse_kb(rest);
        }
    }
    (total * 1024, available * 1024)
}

#[cfg(target_os = "linux")]
fn parse_kb(field: &str) -> u64 {
    field
        .trim()
        .trim_end_matches(" kB")
        .trim()
        .parse()
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn memory_bytes() -> (u64, u64) {
    (0, 0)
}

/// Builds the [`AgentInfo`] record written after startup.
pub fn agent_info(version: &str, agent_id: &str, started_at: i64) -> AgentInfo {
    AgentInfo {
        version: version.to_string(),
        started_at,
        pid: std::process::id(),
        agent_id: agent_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_host_facts_succeeds() {
        let facts = collect_host_facts().expect("host facts should always collect");
        assert!(!facts.hostname.is_empty());
        assert!(facts.cpu_count >= 1);
    }

    #[test]
    fn agent_info_captures_pid() {
        let info = agent_info("1.2.3", "agent-abc", 1_700_000_000);
        assert_eq!(info.pid, std::process::id());
        assert_eq!(info.version, "1.2.3");
    }
}
