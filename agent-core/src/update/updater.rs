//! The self-update state machine: version check, staged download with content-hash
//! verification, and supervisor handoff. The agent never replaces its own executable — see
//! [`crate::supervisor`] for the handoff side of this.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Method;
use semver::Version;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::http::ApiClient;
use crate::supervisor::{SupervisorClient, SupervisorError, UpdateRequest, UpdateStatus};

use super::model::{UpdateResultReport, VersionCheckResponse, VersionInfo};

/// Errors from update operations. All are recoverable — the update loop logs and continues
/// to the next tick rather than propagating these to the caller.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The version-check or result-reporting HTTP call failed outright.
    #[error("update server request failed: {0}")]
    Http(#[from] reqwest_middleware::Error),
    /// The server replied with a non-2xx status.
    #[error("update server returned {status}: {body}")]
    ServerError {
        /// HTTP status code.
        status: u16,
        /// Raw response body, for logging.
        body: String,
    },
    /// An I/O error occurred staging the downloaded binary.
    #[error("update I/O error at {path}: {source}")]
    Io {
        /// Path involved in the failed operation.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The downloaded binary's content hash did not match the advertised checksum. No
    /// update is applied; the staged `.tmp` file is deleted.
    #[error("checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch {
        /// Checksum the server advertised.
        expected: String,
        /// Checksum actually computed from the downloaded bytes.
        computed: String,
    },
    /// Supervisor handoff failed.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// Static configuration an [`Updater`] is built from.
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    /// Server-assigned device identifier, reported alongside update results.
    pub device_id: String,
    /// Version currently running.
    pub current_version: Version,
    /// Platform string advertised in the version-check request.
    pub platform: String,
    /// Architecture string advertised in the version-check request.
    pub arch: String,
    /// Directory staged binaries are downloaded into.
    pub stage_dir: PathBuf,
    /// Path of the running binary the supervisor should eventually replace.
    pub target_path: PathBuf,
    /// Cadence of the periodic update check.
    pub check_interval: Duration,
}

/// A `std::io::Write` sink that hashes every byte written to it in parallel with writing it
/// to the wrapped sink, so the download and the integrity check happen in one streaming
/// pass rather than a second read-back of the staged file.
struct HashingWriter<W> {
    inner: W,
    hasher: Arc<Mutex<Sha256>>,
}

impl<W: std::io::Write> std::io::Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher
            .lock()
            .expect("hasher mutex poisoned")
            .update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Drives the independent update loop: periodic version checks, staged downloads, checksum
/// verification, and supervisor handoff. Guarded so only one update attempt runs at a time.
pub struct Updater {
    api: ApiClient,
    supervisor: SupervisorClient,
    config: UpdaterConfig,
    in_progress: Arc<AtomicBool>,
}

impl Updater {
    /// Builds an updater against the unary HTTP transport and supervisor IPC paths.
    pub fn new(api: ApiClient, supervisor: SupervisorClient, config: UpdaterConfig) -> Self {
        Self {
            api,
            supervisor,
            config,
            in_progress: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Asks the server over the unary HTTP transport (not the control channel) whether a
    /// newer version is available.
    pub async fn check_for_update(&self) -> Result<Option<VersionInfo>, UpdateError> {
        let path = format!(
            "api/agent/version?platform={}&arch={}&current={}",
            self.config.platform, self.config.arch, self.config.current_version
        );
        let resp = self
            .api
            .request::<VersionCheckResponse, ()>(Method::GET, &path, None, None)
            .await?;

        if !resp.success {
            return Err(UpdateError::ServerError {
                status: resp.status,
                body: resp.error_body.unwrap_or_default(),
            });
        }
        let body = resp.data.ok_or_else(|| UpdateError::ServerError {
            status: resp.status,
            body: "version check response had no body".to_string(),
        })?;

        if !body.available {
            return Ok(None);
        }
        Ok(body.version_info)
    }

    /// Streams the advertised binary into the staging directory under a `.tmp` name,
    /// hashing while writing. Renames to the final staged name on success; deletes the
    /// `.tmp` file and returns [`UpdateError::ChecksumMismatch`] if the computed hash
    /// doesn't match `info.checksum`.
    pub async fn download_update(&self, info: &VersionInfo) -> Result<PathBuf, UpdateError> {
        std::fs::create_dir_all(&self.config.stage_dir).map_err(|source| UpdateError::Io {
            path: self.config.stage_dir.clone(),
            source,
        })?;

        let tmp_path = self.config.stage_dir.join(format!("agent-{}.tmp", info.version));
        let final_path = self.config.stage_dir.join(format!("agent-{}", info.version));

        let file = std::fs::File::create(&tmp_path).map_err(|source| UpdateError::Io {
            path: tmp_path.clone(),
            source,
        })?;
        let hasher = Arc::new(Mutex::new(Sha256::new()));
        let writer = HashingWriter {
            inner: file,
            hasher: hasher.clone(),
        };

        self.api.download(&info.download_url, writer).await?;

        let computed = hex::encode(
            Arc::try_unwrap(hasher)
                .expect("download sink dropped by the time download() returns")
                .into_inner()
                .expect("hasher mutex poisoned")
                .finalize(),
        );

        if !computed.eq_ignore_ascii_case(&info.checksum) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(UpdateError::ChecksumMismatch {
                expected: info.checksum.clone(),
                computed,
            });
        }

        std::fs::rename(&tmp_path, &final_path).map_err(|source| UpdateError::Io {
            path: final_path.clone(),
            source,
        })?;
        Ok(final_path)
    }

    /// Writes the `UpdateRequest` record and signals the supervisor. The agent never
    /// replaces its own binary — everything past this call is the supervisor's
    /// responsibility.
    pub async fn apply_update(
        &self,
        staged_path: &Path,
        info: &VersionInfo,
        requested_by: &str,
    ) -> Result<(), UpdateError> {
        let request = UpdateRequest {
            version: info.version.to_string(),
            staged_path: staged_path.to_path_buf(),
            checksum: info.checksum.clone(),
            requested_at: now_unix(),
            requested_by: requested_by.to_string(),
            target_path: self.config.target_path.clone(),
        };
        self.supervisor.hand_off(&request).await?;
        Ok(())
    }

    /// On startup, reads any terminal `UpdateStatus` the supervisor left behind, posts it to
    /// the server, and clears the status file. A no-op if no status file exists or the
    /// state isn't terminal yet.
    pub async fn check_and_report_update_result(
        &self,
        previous_version: &str,
    ) -> Result<(), UpdateError> {
        let Some(status) = self.supervisor.read_status()? else {
            return Ok(());
        };
        if !status.is_terminal() {
            return Ok(());
        }

        let (state, error) = match &status {
            UpdateStatus::Complete => ("complete".to_string(), None),
            UpdateStatus::Failed { error } => ("failed".to_string(), Some(error.clone())),
            UpdateStatus::RolledBack => ("rolled_back".to_string(), None),
            UpdateStatus::Pending
            | UpdateStatus::Downloading
            | UpdateStatus::Verifying
            | UpdateStatus::Staging
            | UpdateStatus::Restarting => {
                unreachable!("is_terminal() already filtered these out")
            }
        };

        let report = UpdateResultReport {
            device_id: self.config.device_id.clone(),
            state,
            version: self.config.current_version.to_string(),
            previous_version: previous_version.to_string(),
            error,
            started_at: now_unix(),
            completed_at: now_unix(),
        };

        self.api
            .request::<serde_json::Value, _>(Method::POST, "api/agent/update/result", Some(&report), None)
            .await?;
        self.supervisor.clear_status()?;
        Ok(())
    }

    /// Runs the periodic-check-plus-manual-trigger loop until `cancel` fires. Only one
    /// update attempt proceeds at a time; a tick or trigger that arrives mid-attempt is
    /// silently skipped rather than queued.
    pub async fn run_update_loop(self: Arc<Self>, cancel: CancellationToken, mut manual_trigger: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.clone().run_once("update_loop").await;
                }
                trigger = manual_trigger.recv() => {
                    if trigger.is_none() {
                        break;
                    }
                    self.clone().run_once("manual_trigger").await;
                }
            }
        }
    }

    async fn run_once(self: Arc<Self>, requested_by: &str) {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::debug!("update already in progress, skipping this tick");
            return;
        }

        let result = self.try_update(requested_by).await;
        self.in_progress.store(false, Ordering::SeqCst);

        if let Err(e) = result {
            log::warn!("update attempt failed: {e}");
        }
    }

    async fn try_update(&self, requested_by: &str) -> Result<(), UpdateError> {
        let Some(info) = self.check_for_update().await? else {
            return Ok(());
        };
        if info.version <= self.config.current_version {
            return Ok(());
        }

        log::info!("update available: {} -> {}", self.config.current_version, info.version);
        let staged = self.download_update(&info).await?;
        self.apply_update(&staged, &info, requested_by).await
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(stage_dir: PathBuf) -> UpdaterConfig {
        UpdaterConfig {
            device_id: "dev-1".to_string(),
            current_version: Version::parse("1.0.0").unwrap(),
            platform: "linux".to_string(),
            arch: "x86_64".to_string(),
            stage_dir,
            target_path: PathBuf::from("/usr/local/bin/agent"),
            check_interval: Duration::from_secs(3600),
        }
    }

    #[test]
    fn hashing_writer_computes_sha256_while_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let hasher = Arc::new(Mutex::new(Sha256::new()));
        let mut writer = HashingWriter {
            inner: std::fs::File::create(&path).unwrap(),
            hasher: hasher.clone(),
        };
        writer.write_all(b"hello world").unwrap();
        drop(writer);

        let computed = hex::encode(Arc::try_unwrap(hasher).unwrap().into_inner().unwrap().finalize());
        let mut expected_hasher = Sha256::new();
        expected_hasher.update(b"hello world");
        assert_eq!(computed, hex::encode(expected_hasher.finalize()));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn apply_update_writes_request_without_touching_running_binary() {
        let dir = tempfile::tempdir().unwrap();
        let api = ApiClient::new("https://updates.example.test", None).unwrap();
        let supervisor = SupervisorClient::new(
            dir.path().join("update_request.json"),
            dir.path().join("update_status.json"),
            dir.path().join("supervisor.pipe"),
        );
        let updater = Updater::new(api, supervisor, test_config(dir.path().join("staging")));

        let info = VersionInfo {
            version: Version::parse("1.1.0").unwrap(),
            platform: "linux".to_string(),
            arch: "x86_64".to_string(),
            download_url: "https://updates.example.test/agent".to_string(),
            checksum: "abc123".to_string(),
            size: 42,
            required: false,
        };
        let staged_path = dir.path().join("staging").join("agent-1.1.0");

        updater.apply_update(&staged_path, &info, "manual_trigger").await.unwrap();

        assert!(dir.path().join("update_request.json").exists());
        assert!(!updater.config.target_path.exists());
    }

    #[tokio::test]
    async fn check_and_report_is_a_noop_without_a_status_file() {
        let dir = tempfile::tempdir().unwrap();
        let api = ApiClient::new("https://updates.example.test", None).unwrap();
        let supervisor = SupervisorClient::new(
            dir.path().join("update_request.json"),
            dir.path().join("update_status.json"),
            dir.path().join("supervisor.pipe"),
        );
        let updater = Updater::new(api, supervisor, test_config(dir.path().join("staging")));

        updater.check_and_report_update_result("1.0.0").await.unwrap();
    }
}
