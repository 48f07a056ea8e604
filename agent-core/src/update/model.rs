//! Wire types for the unary version-check and update-result-reporting endpoints.

use semver::Version;
use serde::{Deserialize, Serialize};

/// What the server advertises for a given `platform`/`arch`/`current` triple, consumed only
/// by the updater.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Advertised version.
    pub version: Version,
    /// Target platform ("linux", "windows", "macos").
    pub platform: String,
    /// Target architecture ("x86_64", "aarch64").
    pub arch: String,
    /// URL the binary is streamed from.
    pub download_url: String,
    /// Hex-encoded SHA-256 the downloaded binary must match.
    pub checksum: String,
    /// Expected binary size, in bytes.
    pub size: u64,
    /// Whether this update must be applied (informational; the core always verifies and
    /// applies regardless — policy enforcement of `required` is a server/UI concern).
    pub required: bool,
}

/// Response body of `GET /api/agent/version`.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionCheckResponse {
    /// Whether a newer version is available.
    pub available: bool,
    /// The version currently reported by the agent.
    pub current_version: String,
    /// The latest version known to the server.
    pub latest_version: String,
    /// Present when `available` is true. Accepts the original source's camelCase wire name
    /// as an alias alongside the snake_case field name used elsewhere in this crate.
    #[serde(alias = "versionInfo")]
    pub version_info: Option<VersionInfo>,
}

/// Body posted to `POST /api/agent/update/status` and `POST /api/agent/update/result`.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateResultReport {
    /// Server-assigned device identifier.
    pub device_id: String,
    /// Terminal state as a lowercase string: "complete" | "failed" | "rolled_back".
    pub state: String,
    /// Version the update attempted to move to.
    pub version: String,
    /// Version the agent was running before this attempt.
    pub previous_version: String,
    /// Failure detail, present when `state == "failed"`.
    pub error: Option<String>,
    /// Unix timestamp the attempt started.
    pub started_at: i64,
    /// Unix timestamp this report was generated.
    pub completed_at: i64,
}
