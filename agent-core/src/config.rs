//! Persisted agent configuration.
//!
//! Mirrors the file-then-CLI-override merge this codebase already uses for runtime
//! configuration elsewhere, adapted from ad hoc environment discovery to an explicit typed
//! struct with atomic saves. Precedence, highest first: CLI flags, environment variables,
//! the on-disk JSON file, built-in defaults.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors loading or persisting [`AgentConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file existed but could not be parsed.
    #[error("failed to parse config file at {path}: {source}")]
    Parse {
        /// Path of the offending file.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },
    /// An I/O error occurred while reading or writing the config file.
    #[error("config I/O error at {path}: {source}")]
    Io {
        /// Path involved in the failed operation.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The agent has not completed enrollment and no server/token overrides were supplied.
    #[error("agent is not enrolled and no --server/--token was provided")]
    NotEnrolled,
}

/// Identity assigned at enrollment. Created once; mutated only by the enrollment step;
/// persisted atomically as part of [`AgentConfig`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentIdentity {
    /// Stable identifier across restarts, generated locally on first run.
    pub agent_id: String,
    /// Identifier assigned by the server at enrollment. Empty until enrolled.
    pub device_id: String,
    /// Whether enrollment has completed successfully.
    pub enrolled: bool,
    /// Bearer token presented during enrollment and reconnects.
    pub enrollment_token: String,
}

impl Default for AgentIdentity {
    fn default() -> Self {
        Self {
            agent_id: uuid::Uuid::new_v4().to_string(),
            device_id: String::new(),
            enrolled: false,
            enrollment_token: String::new(),
        }
    }
}

/// CLI-overridable fields. Everything else in [`AgentConfig`] is file/default only — the
/// spec names `--server` and `--token` as the only global overrides.
#[derive(Debug, Parser, Default)]
pub struct ConfigOverrides {
    /// Override the control server URL.
    #[arg(long, env = "AGENT_SERVER")]
    pub server: Option<String>,
    /// Override the enrollment token.
    #[arg(long, env = "AGENT_TOKEN")]
    pub token: Option<String>,
}

/// Full persisted and runtime configuration for the agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    /// Agent identity, enrollment state, and bearer token.
    #[serde(flatten)]
    pub identity: AgentIdentity,
    /// Control-plane WebSocket URL.
    pub server_url: String,
    /// Heartbeat cadence while authenticated.
    pub heartbeat_interval_secs: u64,
    /// Metrics collection/drain cadence.
    pub metrics_interval_secs: u64,
    /// Optional secondary data-plane WebSocket URL.
    pub data_plane_url: Option<String>,
    /// Update check cadence.
    pub update_check_interval_secs: u64,
    /// Directory rotated log files are written to.
    pub log_dir: PathBuf,
    /// Log verbosity: "debug" | "info" | "warn" | "error".
    pub log_level: String,
    /// Path to the offline queue's SQLite file.
    pub queue_db_path: PathBuf,
    /// Directory staged update binaries are downloaded into.
    pub stage_dir: PathBuf,
    /// Path the `UpdateRequest` record is written to.
    pub update_request_path: PathBuf,
    /// Path the supervisor writes `UpdateStatus` to.
    pub update_status_path: PathBuf,
    /// Path the `AgentInfo` record is written to on every startup.
    pub agent_info_path: PathBuf,
    /// Named pipe (or platform equivalent) used to signal the supervisor.
    pub supervisor_pipe_path: PathBuf,

    /// Path this config was loaded from / will be saved to. Not serialized.
    #[serde(skip)]
    path: PathBuf,
}

impl AgentConfig {
    /// Builds the default configuration rooted at a platform data directory.
    pub fn defaults(data_dir: &Path) -> Self {
        Self {
            identity: AgentIdentity::default(),
            server_url: "wss://localhost:8443/ws/agent".to_string(),
            heartbeat_interval_secs: 30,
            metrics_interval_secs: 60,
            data_plane_url: None,
            update_check_interval_secs: 3600,
            log_dir: data_dir.join("logs"),
            log_level: "info".to_string(),
            queue_db_path: data_dir.join("queue.sqlite3"),
            stage_dir: data_dir.join("staging"),
            update_request_path: data_dir.join("update_request.json"),
            update_status_path: data_dir.join("update_status.json"),
            agent_info_path: data_dir.join("agent_info.json"),
            supervisor_pipe_path: data_dir.join("supervisor.pipe"),
            path: data_dir.join("config.json"),
        }
    }

    /// Platform data directory the default config lives under.
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("endpoint-agent")
    }

    /// Loads the config file if present, merges environment and CLI overrides on top, and
    /// falls back to built-in defaults for anything still unset.
    pub fn load(overrides: &ConfigOverrides, data_dir: &Path) -> Result<Self, ConfigError> {
        let path = data_dir.join("config.json");
        let mut config = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            let mut loaded: AgentConfig =
                serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                })?;
            loaded.path = path.clone();
            loaded
        } else {
            Self::defaults(data_dir)
        };

        if let Some(server) = &overrides.server {
            config.server_url = server.clone();
        }
        if let Some(token) = &overrides.token {
            config.identity.enrollment_token = token.clone();
        }

        Ok(config)
    }

    /// Returns `Ok(())` if the agent has enough information to attempt enrollment or
    /// reconnection, `Err(ConfigError::NotEnrolled)` otherwise.
    pub fn require_enrollable(&self) -> Result<(), ConfigError> {
        if self.identity.enrolled || !self.identity.enrollment_token.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::NotEnrolled)
        }
    }

    /// Persists the config through a single serialized write-then-rename path: build the
    /// full JSON document, write it to a sibling `.tmp` file, `fsync`, then rename over the
    /// target. The enrollment step is the only mutator of [`AgentIdentity`] and always goes
    /// through this path.
    pub fn save(&self) -> Result<(), ConfigError> {
        let tmp_path = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let body = serde_json::to_vec_pretty(self).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })?;

        let mut file = fs::File::create(&tmp_path).map_err(|source| ConfigError::Io {
            path: tmp_path.clone(),
            source,
        })?;
        file.write_all(&body).map_err(|source| ConfigError::Io {
            path: tmp_path.clone(),
            source,
        })?;
        file.sync_all().map_err(|source| ConfigError::Io {
            path: tmp_path.clone(),
            source,
        })?;
        drop(file);

        fs::rename(&tmp_path, &self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }

    /// Records a completed enrollment and saves immediately.
    pub fn complete_enrollment(&mut self, device_id: String) -> Result<(), ConfigError> {
        self.identity.device_id = device_id;
        self.identity.enrolled = true;
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::defaults(dir.path());
        config.identity.enrollment_token = "tok-123".to_string();
        config.heartbeat_interval_secs = 45;
        config.save().unwrap();

        let overrides = ConfigOverrides::default();
        let reloaded = AgentConfig::load(&overrides, dir.path()).unwrap();

        assert_eq!(reloaded.identity.enrollment_token, "tok-123");
        assert_eq!(reloaded.heartbeat_interval_secs, 45);
        assert_eq!(reloaded.identity.agent_id, config.identity.agent_id);
    }

    #[test]
    fn cli_overrides_take_precedence_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::defaults(dir.path());
        config.save().unwrap();

        let overrides = ConfigOverrides {
            server: Some("wss://override.example/ws".to_string()),
            token: Some("override-token".to_string()),
        };
        let reloaded = AgentConfig::load(&overrides, dir.path()).unwrap();

        assert_eq!(reloaded.server_url, "wss://override.example/ws");
        assert_eq!(reloaded.identity.enrollment_token, "override-token");
    }

    #[test]
    fn not_enrolled_without_token_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::defaults(dir.path());
        assert!(matches!(
            config.require_enrollable(),
            Err(ConfigError::NotEnrolled)
        ));
    }
}
