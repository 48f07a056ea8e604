//! Out-of-band IPC to the external supervisor that performs the binary swap and restarts
//! the agent. Two mechanisms, per the spec: a request file (the canonical, reboot-surviving
//! record) and a signaling pipe (best-effort, absence is non-fatal — the supervisor also
//! polls the request file).

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A request the agent hands off to the supervisor: stage a binary at `staged_path`,
/// verified against `checksum`, in place of `target_path`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateRequest {
    /// Version being applied.
    pub version: String,
    /// Path of the verified, staged binary.
    pub staged_path: PathBuf,
    /// Hex-encoded SHA-256 the staged binary must match.
    pub checksum: String,
    /// Unix timestamp the request was written.
    pub requested_at: i64,
    /// What initiated this request ("update_loop", "manual_trigger", ...).
    pub requested_by: String,
    /// Path of the running binary the supervisor should replace.
    pub target_path: PathBuf,
}

/// Terminal and intermediate states the supervisor reports back after taking ownership of
/// an [`UpdateRequest`]. Written by the supervisor; read by the agent on its next startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UpdateStatus {
    /// Request seen, not yet acted on.
    Pending,
    /// Supervisor is downloading (used when the supervisor itself fetches the binary).
    Downloading,
    /// Verifying the staged binary's checksum.
    Verifying,
    /// Swapping the staged binary into place.
    Staging,
    /// Restarting the agent process.
    Restarting,
    /// The new binary is running and healthy.
    Complete,
    /// The update failed; the agent should report `error` and continue on the old binary.
    Failed {
        /// Human-readable failure reason.
        error: String,
    },
    /// The update was applied but rolled back after a failed health check.
    RolledBack,
}

impl UpdateStatus {
    /// Whether this state is final — the agent should report it once and clear the file.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpdateStatus::Complete | UpdateStatus::Failed { .. } | UpdateStatus::RolledBack
        )
    }
}

/// Errors from supervisor IPC operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// An I/O error occurred reading or writing a supervisor file.
    #[error("supervisor I/O error at {path}: {source}")]
    Io {
        /// Path involved in the failed operation.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The request or status file existed but could not be parsed.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// Path of the offending file.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },
}

fn atomic_write(path: &Path, body: &[u8]) -> Result<(), SupervisorError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| SupervisorError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let tmp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path).map_err(|source| SupervisorError::Io {
        path: tmp_path.clone(),
        source,
    })?;
    file.write_all(body).map_err(|source| SupervisorError::Io {
        path: tmp_path.clone(),
        source,
    })?;
    file.sync_all().map_err(|source| SupervisorError::Io {
        path: tmp_path.clone(),
        source,
    })?;
    drop(file);
    fs::rename(&tmp_path, path).map_err(|source| SupervisorError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// The agent's half of the supervisor IPC contract: writing the canonical request file and
/// best-effort pinging a signaling pipe, then later reading back whatever terminal status
/// the supervisor left behind.
#[derive(Debug, Clone)]
pub struct SupervisorClient {
    request_path: PathBuf,
    status_path: PathBuf,
    pipe_path: PathBuf,
}

impl SupervisorClient {
    /// Builds a client bound to the three well-known paths from [`crate::config::AgentConfig`].
    pub fn new(request_path: PathBuf, status_path: PathBuf, pipe_path: PathBuf) -> Self {
        Self {
            request_path,
            status_path,
            pipe_path,
        }
    }

    /// Writes the canonical `UpdateRequest` record atomically (write-then-rename) and pings
    /// the signaling pipe. The pipe ping is best-effort: a missing or unread pipe is logged
    /// and otherwise ignored, since the supervisor is expected to also poll the request
    /// file directly.
    pub async fn hand_off(&self, request: &UpdateRequest) -> Result<(), SupervisorError> {
        let body = serde_json::to_vec_pretty(request).map_err(|source| SupervisorError::Parse {
            path: self.request_path.clone(),
            source,
        })?;
        atomic_write(&self.request_path, &body)?;

        if let Err(e) = self.signal_pipe().await {
            log::warn!(
                "supervisor signaling pipe unavailable at {}: {e} (request file written; supervisor will pick it up on its next poll)",
                self.pipe_path.display()
            );
        }
        Ok(())
    }

    /// Reads any terminal [`UpdateStatus`] left by the supervisor from the last run,
    /// without clearing it. Returns `Ok(None)` if no status file exists.
    pub fn read_status(&self) -> Result<Option<UpdateStatus>, SupervisorError> {
        if !self.status_path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.status_path).map_err(|source| SupervisorError::Io {
            path: self.status_path.clone(),
            source,
        })?;
        let status: UpdateStatus =
            serde_json::from_str(&raw).map_err(|source| SupervisorError::Parse {
                path: self.status_path.clone(),
                source,
            })?;
        Ok(Some(status))
    }

    /// Removes the status file after its terminal state has been reported to the server.
    pub fn clear_status(&self) -> Result<(), SupervisorError> {
        match fs::remove_file(&self.status_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SupervisorError::Io {
                path: self.status_path.clone(),
                source,
            }),
        }
    }

    #[cfg(unix)]
    async fn signal_pipe(&self) -> std::io::Result<()> {
        use tokio::net::unix::pipe;
        let tx = pipe::OpenOptions::new().open_sender(&self.pipe_path)?;
        tx.writable().await?;
        tx.try_write(b"update\n")?;
        Ok(())
    }

    #[cfg(not(unix))]
    async fn signal_pipe(&self) -> std::io::Result<()> {
        // No portable named-pipe primitive on this platform; the supervisor is expected to
        // rely on polling the request file alone.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hand_off_writes_request_file_even_without_a_listening_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let client = SupervisorClient::new(
            dir.path().join("update_request.json"),
            dir.path().join("update_status.json"),
            dir.path().join("supervisor.pipe"),
        );
        let request = UpdateRequest {
            version: "1.46.0".to_string(),
            staged_path: dir.path().join("staged-bin"),
            checksum: "deadbeef".to_string(),
            requested_at: 1_700_000_000,
            requested_by: "update_loop".to_string(),
            target_path: PathBuf::from("/usr/local/bin/agent"),
        };

        tokio_test_block_on(client.hand_off(&request));

        let raw = fs::read_to_string(dir.path().join("update_request.json")).unwrap();
        let round_tripped: UpdateRequest = serde_json::from_str(&raw).unwrap();
        assert_eq!(round_tripped, request);
    }

    #[test]
    fn read_status_returns_none_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let client = SupervisorClient::new(
            dir.path().join("update_request.json"),
            dir.path().join("update_status.json"),
            dir.path().join("supervisor.pipe"),
        );
        assert!(client.read_status().unwrap().is_none());
    }

    #[test]
    fn terminal_status_round_trips_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let status_path = dir.path().join("update_status.json");
        fs::write(&status_path, serde_json::to_vec(&UpdateStatus::Complete).unwrap()).unwrap();

        let client = SupervisorClient::new(
            dir.path().join("update_request.json"),
            status_path.clone(),
            dir.path().join("supervisor.pipe"),
        );

        let status = client.read_status().unwrap().unwrap();
        assert!(status.is_terminal());
        client.clear_status().unwrap();
        assert!(client.read_status().unwrap().is_none());
    }

    /// Minimal helper to drive a `Future` to completion in a `#[test]` without pulling in a
    /// `#[tokio::test]` just for the one async method under test here.
    fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f)
    }
}
