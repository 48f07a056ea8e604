//! One-time unary HTTP enrollment handshake, turning a bare `--token` into a server-assigned
//! `device_id`. Shared by the CLI's `register-as-service` command and the daemon's own
//! startup path, so an agent started directly with `--server`/`--token` and no prior CLI
//! bootstrap still enrolls itself.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{AgentConfig, ConfigError};
use crate::http::{self, ApiClient};
use crate::sysinfo::{self, HostFacts, SysInfoError};

/// Errors from the enrollment handshake.
#[derive(Debug, Error)]
pub enum EnrollmentError {
    /// Reading, saving, or the enrollability precondition on [`AgentConfig`] failed.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    /// Host fact collection failed.
    #[error("failed to collect host facts: {0}")]
    SysInfo(#[from] SysInfoError),
    /// The server URL could not be turned into an HTTP(S) base URL.
    #[error("invalid server URL: {0}")]
    BadUrl(#[from] url::ParseError),
    /// The HTTP transport itself failed (network error or retry exhaustion).
    #[error("enrollment request failed: {0}")]
    Http(#[from] reqwest_middleware::Error),
    /// The server replied with a non-2xx status.
    #[error("enrollment server returned {status}: {body}")]
    ServerError {
        /// HTTP status code.
        status: u16,
        /// Raw response body, for logging.
        body: String,
    },
}

#[derive(Debug, Serialize)]
struct EnrollRequest {
    agent_id: String,
    #[serde(flatten)]
    host: HostFacts,
    agent_version: String,
}

#[derive(Debug, Deserialize)]
struct EnrollResponseConfig {
    heartbeat_interval: u64,
    metrics_interval: u64,
}

#[derive(Debug, Deserialize)]
struct EnrollResponse {
    success: bool,
    device_id: String,
    config: EnrollResponseConfig,
}

/// Performs `POST /api/agent/enroll` and persists the result into `config`, including the
/// server-advertised heartbeat/metrics intervals. A second call against an already-enrolled
/// agent overwrites `device_id` unconditionally — enrollment is idempotent by design, not
/// guarded against replay.
pub async fn enroll(config: &mut AgentConfig, agent_version: &str) -> Result<(), EnrollmentError> {
    config.require_enrollable()?;

    let body = EnrollRequest {
        agent_id: config.identity.agent_id.clone(),
        host: sysinfo::collect_host_facts()?,
        agent_version: agent_version.to_string(),
    };

    let base_url = http::derive_http_base_url(&config.server_url)?;
    let api = ApiClient::new(base_url.as_str(), None)?;
    let headers = http::single_header("X-Enrollment-Token", config.identity.enrollment_token.clone());

    let resp = api
        .request::<EnrollResponse, _>(Method::POST, "api/agent/enroll", Some(&body), headers)
        .await?;

    if !resp.success {
        return Err(EnrollmentError::ServerError {
            status: resp.status,
            body: resp.error_body.unwrap_or_default(),
        });
    }
    let data = resp.data.ok_or_else(|| EnrollmentError::ServerError {
        status: resp.status,
        body: "enrollment response had no body".to_string(),
    })?;
    if !data.success {
        return Err(EnrollmentError::ServerError {
            status: resp.status,
            body: "server reported success=false".to_string(),
        });
    }

    config.heartbeat_interval_secs = data.config.heartbeat_interval;
    config.metrics_interval_secs = data.config.metrics_interval;
    config.complete_enrollment(data.device_id)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enroll_rejects_configs_with_no_token() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::defaults(dir.path());
        let result = tokio_test_block_on(enroll(&mut config, "1.0.0"));
        assert!(matches!(result, Err(EnrollmentError::Config(ConfigError::NotEnrolled))));
    }

    fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f)
    }
}
