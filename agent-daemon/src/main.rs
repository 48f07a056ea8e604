//! Entry point for the long-running agent runtime: loads configuration, self-enrolls if
//! necessary, wires the control/data-plane clients, session handlers, offline queue, and
//! updater together, and drives them until a shutdown signal arrives.

mod platform;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent_core::config::{AgentConfig, ConfigError, ConfigOverrides};
use agent_core::control::{ControlClient, ControlClientConfig, DataPlaneClient, DataPlaneConfig};
use agent_core::enrollment::{self, EnrollmentError};
use agent_core::http::{self, ApiClient};
use agent_core::protocol::{Message, MessageKind};
use agent_core::queue::{Priority, Queue, QueueLimits};
use agent_core::service::UninstallHandler;
use agent_core::sessions::{
    CommandHandler, DiagnosticsHandler, FileTransferHandler, OutputSink, RemoteDesktopHandler,
    SessionManager, TerminalHandler,
};
use agent_core::supervisor::SupervisorClient;
use agent_core::sysinfo;
use agent_core::update::{Updater, UpdaterConfig};

use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "agent-daemon", version, about = "Endpoint management agent runtime")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[command(flatten)]
    overrides: ConfigOverrides,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Commands {
    /// Run non-interactively, the way an installed OS service launches the agent.
    RunAsService,
    /// Run attached to the current terminal, logging to stdout as well as the log file.
    RunInteractive,
}

#[derive(Debug, thiserror::Error)]
enum DaemonError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Enrollment(#[from] EnrollmentError),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn main() {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let runtime = tokio::runtime::Runtime::new().expect("failed to build the tokio runtime");
    let exit_code = match runtime.block_on(run()) {
        Ok(()) => 0,
        Err(DaemonError::Permission(msg)) => {
            eprintln!("agent-daemon: permission denied: {msg}");
            2
        }
        Err(e @ DaemonError::Config(_)) | Err(e @ DaemonError::Enrollment(_)) => {
            eprintln!("agent-daemon: configuration error: {e}");
            1
        }
        Err(e) => {
            eprintln!("agent-daemon: {e}");
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run() -> Result<(), DaemonError> {
    let cli = Cli::parse();

    let data_dir = AgentConfig::default_data_dir();
    std::fs::create_dir_all(&data_dir).map_err(|e| permission_or_other(&data_dir, e))?;

    let mut config = AgentConfig::load(&cli.overrides, &data_dir)?;

    agent_core::logging::setup_logging(&config.log_dir, &config.log_level)
        .map_err(DaemonError::Other)?;

    log::info!(
        "agent-daemon {} starting in {:?} mode (agent_id={})",
        env!("CARGO_PKG_VERSION"),
        cli.command,
        config.identity.agent_id
    );

    if !config.identity.enrolled {
        config.require_enrollable()?;
        log::info!("agent is not yet enrolled; attempting enrollment against {}", config.server_url);
        enrollment::enroll(&mut config, env!("CARGO_PKG_VERSION")).await?;
        log::info!("enrollment complete: device_id={}", config.identity.device_id);
    }

    let queue = Arc::new(
        Queue::open(&config.queue_db_path, QueueLimits::default())
            .map_err(|e| DaemonError::Other(anyhow::anyhow!(e)))?,
    );

    let supervisor = SupervisorClient::new(
        config.update_request_path.clone(),
        config.update_status_path.clone(),
        config.supervisor_pipe_path.clone(),
    );

    let base_url = http::derive_http_base_url(&config.server_url)
        .map_err(|e| DaemonError::Other(anyhow::anyhow!(e)))?;
    let api_for_updates = ApiClient::new(base_url.as_str(), Some(config.identity.enrollment_token.clone()))
        .map_err(|e| DaemonError::Other(anyhow::anyhow!(e)))?;

    let previous_version = read_previous_version(&config.agent_info_path);
    let current_version = semver::Version::parse(env!("CARGO_PKG_VERSION"))
        .expect("crate version is valid semver");

    let updater = Arc::new(Updater::new(
        api_for_updates,
        supervisor.clone(),
        UpdaterConfig {
            device_id: config.identity.device_id.clone(),
            current_version: current_version.clone(),
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            stage_dir: config.stage_dir.clone(),
            target_path: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("agent-daemon")),
            check_interval: Duration::from_secs(config.update_check_interval_secs),
        },
    ));

    if let Err(e) = updater.check_and_report_update_result(&previous_version).await {
        log::warn!("failed to report the previous run's update result: {e}");
    }

    write_agent_info(&config.agent_info_path, current_version.to_string(), &config.identity.agent_id);

    let sessions = SessionManager::new();
    let terminal_handler = Arc::new(TerminalHandler::new(
        sessions.clone(),
        Arc::new(platform::UnimplementedPtySpawner),
    ));
    let file_handler = Arc::new(FileTransferHandler::new(sessions.clone(), platform::filesystem_root()));
    let remote_handler = Arc::new(RemoteDesktopHandler::new(
        sessions.clone(),
        Arc::new(platform::UnimplementedDesktopSessionFactory),
        Arc::new(platform::UnimplementedInputDriver),
    ));
    let diagnostics_handler = Arc::new(DiagnosticsHandler::new(env!("CARGO_PKG_VERSION").to_string()));
    let command_handler = Arc::new(CommandHandler::new());
    let uninstall_handler = Arc::new(UninstallHandler::new(Arc::new(platform::UnimplementedServiceInstaller)));

    let control = ControlClient::new(ControlClientConfig {
        url: config.server_url.clone(),
        agent_id: config.identity.agent_id.clone(),
        device_id: config.identity.device_id.clone(),
        enrollment_token: config.identity.enrollment_token.clone(),
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
        heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
        ..ControlClientConfig::default()
    });

    let cancel = CancellationToken::new();

    handlers::register(
        &control,
        terminal_handler,
        file_handler,
        remote_handler,
        diagnostics_handler,
        command_handler,
        uninstall_handler,
        cancel.clone(),
    );

    let data_plane = DataPlaneClient::new(DataPlaneConfig {
        url: config.data_plane_url.clone().unwrap_or_default(),
        ..DataPlaneConfig::default()
    });

    {
        let sessions = sessions.clone();
        control.on_disconnect(move || {
            log::warn!("control channel disconnected; closing {} active session(s)", sessions.len());
            sessions.close_all();
        });
    }

    let control_handle = tokio::spawn(control.clone().start(cancel.clone()));
    let data_plane_handle = tokio::spawn(data_plane.clone().start(cancel.clone()));

    let (manual_trigger_tx, manual_trigger_rx) = mpsc::channel(1);
    let _manual_trigger_tx = manual_trigger_tx;
    let updater_handle = tokio::spawn(updater.clone().run_update_loop(cancel.clone(), manual_trigger_rx));

    let drain_handle = tokio::spawn(drain_queue_loop(
        queue.clone(),
        control.clone(),
        data_plane.clone(),
        cancel.clone(),
        Duration::from_secs(config.metrics_interval_secs),
    ));

    let metrics_handle = tokio::spawn(metrics_loop(
        queue.clone(),
        control.clone(),
        data_plane.clone(),
        cancel.clone(),
        Duration::from_secs(config.metrics_interval_secs),
    ));

    wait_for_shutdown_signal().await;
    log::info!("shutdown signal received, stopping");

    cancel.cancel();
    sessions.close_all();
    let _ = tokio::join!(
        control_handle,
        data_plane_handle,
        updater_handle,
        drain_handle,
        metrics_handle
    );

    log::info!("agent-daemon shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("ctrl-c received");
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
                term.recv().await;
                log::info!("SIGTERM received");
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {}
    }
}

fn permission_or_other(path: &std::path::Path, source: std::io::Error) -> DaemonError {
    if source.kind() == std::io::ErrorKind::PermissionDenied {
        DaemonError::Permission(format!("cannot create {}: {source}", path.display()))
    } else {
        DaemonError::Other(anyhow::anyhow!("failed to create {}: {source}", path.display()))
    }
}

fn read_previous_version(agent_info_path: &std::path::Path) -> String {
    std::fs::read_to_string(agent_info_path)
        .ok()
        .and_then(|raw| serde_json::from_str::<sysinfo::AgentInfo>(&raw).ok())
        .map(|info| info.version)
        .unwrap_or_else(|| "unknown".to_string())
}

fn write_agent_info(path: &std::path::Path, version: String, agent_id: &str) {
    let info = sysinfo::agent_info(&version, agent_id, now_unix());
    let Ok(body) = serde_json::to_vec_pretty(&info) else {
        return;
    };
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(path, body) {
        log::warn!("failed to write agent info to {}: {e}", path.display());
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Drains the offline queue on the metrics cadence: reads a batch of each kind, sends it
/// (metrics prefer the data-plane channel, falling back to the control channel), and acks
/// only what was actually sent. Items left un-acked retry on the next tick.
async fn drain_queue_loop(
    queue: Arc<Queue>,
    control: ControlClient,
    data_plane: DataPlaneClient,
    cancel: CancellationToken,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if !control.is_authenticated() {
            continue;
        }

        drain_metrics(&queue, &control, &data_plane).await;
        drain_batch(&queue, &control, agent_core::queue::QueueKind::Event, MessageKind::Metrics).await;
        drain_batch(&queue, &control, agent_core::queue::QueueKind::CommandResult, MessageKind::Response).await;
    }
}

const DRAIN_BATCH_SIZE: i64 = 100;

async fn drain_metrics(queue: &Arc<Queue>, control: &ControlClient, data_plane: &DataPlaneClient) {
    let queue = queue.clone();
    let items = match tokio::task::spawn_blocking(move || queue.pending_metrics(DRAIN_BATCH_SIZE)).await {
        Ok(Ok(items)) => items,
        Ok(Err(e)) => {
            log::warn!("failed to read pending metrics: {e}");
            return;
        }
        Err(e) => {
            log::warn!("metrics drain task panicked: {e}");
            return;
        }
    };
    if items.is_empty() {
        return;
    }

    let mut acked = Vec::with_capacity(items.len());
    for item in &items {
        let sent = data_plane.send_metrics(item.payload.clone()).is_ok()
            || control
                .send(Message::fire(MessageKind::Metrics, json!({"raw": item.payload})))
                .is_ok();
        if sent {
            acked.push(item.id);
        }
    }
    ack_ids(queue, agent_core::queue::QueueKind::Metric, acked).await;
}

async fn drain_batch(
    queue: &Arc<Queue>,
    control: &ControlClient,
    kind: agent_core::queue::QueueKind,
    wire_kind: MessageKind,
) {
    let queue_for_read = queue.clone();
    let items = match kind {
        agent_core::queue::QueueKind::Event => {
            tokio::task::spawn_blocking(move || queue_for_read.pending_events(DRAIN_BATCH_SIZE)).await
        }
        agent_core::queue::QueueKind::CommandResult => {
            tokio::task::spawn_blocking(move || queue_for_read.pending_command_results(DRAIN_BATCH_SIZE)).await
        }
        agent_core::queue::QueueKind::Metric => unreachable!("metrics drained separately"),
    };
    let items = match items {
        Ok(Ok(items)) => items,
        Ok(Err(e)) => {
            log::warn!("failed to read pending {kind:?}: {e}");
            return;
        }
        Err(e) => {
            log::warn!("{kind:?} drain task panicked: {e}");
            return;
        }
    };
    if items.is_empty() {
        return;
    }

    let mut acked = Vec::with_capacity(items.len());
    for item in &items {
        let sent = control
            .send(Message::fire(wire_kind.clone(), json!({"raw": item.payload})))
            .is_ok();
        if sent {
            acked.push(item.id);
        }
    }
    ack_ids(queue.clone(), kind, acked).await;
}

async fn ack_ids(queue: Arc<Queue>, kind: agent_core::queue::QueueKind, ids: Vec<i64>) {
    if ids.is_empty() {
        return;
    }
    if let Err(e) = tokio::task::spawn_blocking(move || queue.ack(kind, &ids)).await {
        log::warn!("queue ack task panicked: {e}");
    }
}

/// Collects a host-facts snapshot on the metrics cadence. Sends it immediately over the
/// data-plane channel (falling back to the control channel) when connected; otherwise
/// enqueues it so `drain_queue_loop` can deliver it once connectivity is restored.
async fn metrics_loop(
    queue: Arc<Queue>,
    control: ControlClient,
    data_plane: DataPlaneClient,
    cancel: CancellationToken,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let facts = match sysinfo::collect_host_facts() {
            Ok(facts) => facts,
            Err(e) => {
                log::warn!("failed to collect metrics snapshot: {e}");
                continue;
            }
        };
        let Ok(payload) = serde_json::to_vec(&facts) else {
            continue;
        };

        let sent = data_plane.send_metrics(payload.clone()).is_ok()
            || (control.is_authenticated()
                && control
                    .send(Message::fire(MessageKind::Metrics, json!({"raw": payload})))
                    .is_ok());

        if sent {
            continue;
        }

        let queue = queue.clone();
        let enqueue_result = tokio::task::spawn_blocking(move || {
            queue.enqueue_metric(&payload, Priority::Normal, true)
        })
        .await;
        match enqueue_result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => log::warn!("failed to enqueue metrics snapshot: {e}"),
            Err(e) => log::warn!("metrics enqueue task panicked: {e}"),
        }
    }
}

mod handlers {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;

    type HandlerFuture = Pin<Box<dyn Future<Output = Option<Message>> + Send>>;

    fn ok(data: serde_json::Value) -> Option<Message> {
        Some(Message::ok_response(String::new(), data))
    }

    fn err(error: impl Into<String>) -> Option<Message> {
        Some(Message::err_response(String::new(), error.into()))
    }

    fn frame_sink(control: ControlClient, kind: MessageKind, session_id: String) -> OutputSink {
        Arc::new(move |bytes: Vec<u8>| {
            let frame = serde_json::from_slice::<serde_json::Value>(&bytes)
                .unwrap_or_else(|_| json!({ "bytes": bytes }));
            let data = json!({ "session_id": session_id, "frame": frame });
            if control.send(Message::fire(kind.clone(), data)).is_err() {
                log::warn!("dropped {kind:?} frame for session {session_id}: outbound channel full");
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn register(
        control: &ControlClient,
        terminal: Arc<TerminalHandler>,
        files: Arc<FileTransferHandler>,
        remote: Arc<RemoteDesktopHandler>,
        diagnostics: Arc<DiagnosticsHandler>,
        commands: Arc<CommandHandler>,
        uninstall: Arc<UninstallHandler>,
        cancel: CancellationToken,
    ) {
        {
            let terminal = terminal.clone();
            let control = control.clone();
            control.register_handler(
                MessageKind::StartTerminal,
                Arc::new(move |msg: Message| -> HandlerFuture {
                    let terminal = terminal.clone();
                    let control = control.clone();
                    Box::pin(async move {
                        let Some(session_id) = msg.data.get("session_id").and_then(|v| v.as_str()) else {
                            return err("missing session_id");
                        };
                        let session_id = session_id.to_string();
                        let Some(command) = msg.data.get("command").and_then(|v| v.as_str()) else {
                            return err("missing command");
                        };
                        let command = command.to_string();
                        let args: Vec<String> = msg
                            .data
                            .get("args")
                            .and_then(|v| serde_json::from_value(v.clone()).ok())
                            .unwrap_or_default();

                        let output = frame_sink(control, MessageKind::TerminalOutput, session_id.clone());
                        let close: agent_core::sessions::CloseSink = Arc::new(|| {});
                        match terminal.start_terminal(session_id, command, args, output, close).await {
                            Ok(()) => ok(serde_json::Value::Null),
                            Err(e) => err(e.to_string()),
                        }
                    })
                }),
            );
        }

        {
            let terminal = terminal.clone();
            control.register_handler(
                MessageKind::TerminalInput,
                Arc::new(move |msg: Message| -> HandlerFuture {
                    let terminal = terminal.clone();
                    Box::pin(async move {
                        let Some(session_id) = msg.data.get("session_id").and_then(|v| v.as_str()) else {
                            return err("missing session_id");
                        };
                        let session_id = session_id.to_string();
                        let Some(data) = msg
                            .data
                            .get("data")
                            .and_then(|v| serde_json::from_value::<Vec<u8>>(v.clone()).ok())
                        else {
                            return err("missing or invalid data");
                        };
                        match terminal.terminal_input(&session_id, &data) {
                            Ok(()) => ok(serde_json::Value::Null),
                            Err(e) => err(e.to_string()),
                        }
                    })
                }),
            );
        }

        {
            let terminal = terminal.clone();
            control.register_handler(
                MessageKind::TerminalResize,
                Arc::new(move |msg: Message| -> HandlerFuture {
                    let terminal = terminal.clone();
                    Box::pin(async move {
                        let Some(session_id) = msg.data.get("session_id").and_then(|v| v.as_str()) else {
                            return err("missing session_id");
                        };
                        let session_id = session_id.to_string();
                        let Some(cols) = msg.data.get("cols").and_then(|v| v.as_u64()) else {
                            return err("missing cols");
                        };
                        let Some(rows) = msg.data.get("rows").and_then(|v| v.as_u64()) else {
                            return err("missing rows");
                        };
                        let (cols, rows) = (cols as u16, rows as u16);
                        match terminal.terminal_resize(&session_id, cols, rows) {
                            Ok(()) => ok(serde_json::Value::Null),
                            Err(e) => err(e.to_string()),
                        }
                    })
                }),
            );
        }

        {
            let terminal = terminal.clone();
            control.register_handler(
                MessageKind::CloseTerminal,
                Arc::new(move |msg: Message| -> HandlerFuture {
                    let terminal = terminal.clone();
                    Box::pin(async move {
                        let Some(session_id) = msg.data.get("session_id").and_then(|v| v.as_str()) else {
                            return err("missing session_id");
                        };
                        let session_id = session_id.to_string();
                        match terminal.close_terminal(&session_id) {
                            Ok(()) => ok(serde_json::Value::Null),
                            Err(e) => err(e.to_string()),
                        }
                    })
                }),
            );
        }

        control.register_handler(
            MessageKind::ListDrives,
            Arc::new(move |_msg: Message| -> HandlerFuture {
                Box::pin(async move { ok(json!(agent_core::sessions::file_transfer::list_drives())) })
            }),
        );

        {
            let files = files.clone();
            control.register_handler(
                MessageKind::ListFiles,
                Arc::new(move |msg: Message| -> HandlerFuture {
                    let files = files.clone();
                    Box::pin(async move {
                        let Some(path) = msg.data.get("path").and_then(|v| v.as_str()) else {
                            return err("missing path");
                        };
                        let path = path.to_string();
                        match files.list_files(&path) {
                            Ok(entries) => ok(json!(entries)),
                            Err(e) => err(e.to_string()),
                        }
                    })
                }),
            );
        }

        {
            let files = files.clone();
            let control = control.clone();
            control.register_handler(
                MessageKind::ScanDirectory,
                Arc::new(move |msg: Message| -> HandlerFuture {
                    let files = files.clone();
                    let control = control.clone();
                    Box::pin(async move {
                        let Some(path) = msg.data.get("path").and_then(|v| v.as_str()) else {
                            return err("missing path");
                        };
                        let path = path.to_string();
                        let output = frame_sink(control, MessageKind::ScanProgress, path.clone());
                        let result =
                            tokio::task::spawn_blocking(move || files.scan_directory(&path, output)).await;
                        match result {
                            Ok(Ok(entries)) => ok(json!(entries)),
                            Ok(Err(e)) => err(e.to_string()),
                            Err(e) => err(e.to_string()),
                        }
                    })
                }),
            );
        }

        {
            let files = files.clone();
            let control = control.clone();
            control.register_handler(
                MessageKind::DownloadFile,
                Arc::new(move |msg: Message| -> HandlerFuture {
                    let files = files.clone();
                    let control = control.clone();
                    Box::pin(async move {
                        let Some(session_id) = msg.data.get("session_id").and_then(|v| v.as_str()) else {
                            return err("missing session_id");
                        };
                        let session_id = session_id.to_string();
                        let Some(path) = msg.data.get("path").and_then(|v| v.as_str()) else {
                            return err("missing path");
                        };
                        let path = path.to_string();
                        let output = frame_sink(control, MessageKind::FileChunk, session_id.clone());
                        let close: agent_core::sessions::CloseSink = Arc::new(|| {});
                        match files.download_file(session_id, &path, output, close).await {
                            Ok(()) => ok(serde_json::Value::Null),
                            Err(e) => err(e.to_string()),
                        }
                    })
                }),
            );
        }

        {
            let files = files.clone();
            control.register_handler(
                MessageKind::UploadFile,
                Arc::new(move |msg: Message| -> HandlerFuture {
                    let files = files.clone();
                    Box::pin(async move {
                        let Some(path) = msg.data.get("path").and_then(|v| v.as_str()) else {
                            return err("missing path");
                        };
                        let path = path.to_string();
                        let Some(data) = msg
                            .data
                            .get("data")
                            .and_then(|v| serde_json::from_value::<Vec<u8>>(v.clone()).ok())
                        else {
                            return err("missing or invalid data");
                        };
                        let append = msg.data.get("append").and_then(|v| v.as_bool()).unwrap_or(false);
                        match files.upload_file(&path, &data, append) {
                            Ok(()) => ok(serde_json::Value::Null),
                            Err(e) => err(e.to_string()),
                        }
                    })
                }),
            );
        }

        for kind in [MessageKind::StartRemote, MessageKind::WebrtcStart] {
            let remote = remote.clone();
            let control = control.clone();
            control.register_handler(
                kind,
                Arc::new(move |msg: Message| -> HandlerFuture {
                    let remote = remote.clone();
                    let control = control.clone();
                    Box::pin(async move {
                        let Some(session_id) = msg.data.get("session_id").and_then(|v| v.as_str()) else {
                            return err("missing session_id");
                        };
                        let session_id = session_id.to_string();
                        let output = frame_sink(control, MessageKind::RemoteFrame, session_id.clone());
                        let close: agent_core::sessions::CloseSink = Arc::new(|| {});
                        match remote.start_remote(session_id, output, close).await {
                            Ok(()) => ok(serde_json::Value::Null),
                            Err(e) => err(e.to_string()),
                        }
                    })
                }),
            );
        }

        {
            let remote = remote.clone();
            control.register_handler(
                MessageKind::WebrtcSignal,
                Arc::new(move |msg: Message| -> HandlerFuture {
                    let remote = remote.clone();
                    Box::pin(async move {
                        let Some(session_id) = msg.data.get("session_id").and_then(|v| v.as_str()) else {
                            return err("missing session_id");
                        };
                        let session_id = session_id.to_string();
                        let Some(sdp) = msg.data.get("sdp").and_then(|v| v.as_str()) else {
                            return err("missing sdp");
                        };
                        let sdp = sdp.to_string();
                        match remote.webrtc_signal(&session_id, sdp).await {
                            Ok(()) => ok(serde_json::Value::Null),
                            Err(e) => err(e.to_string()),
                        }
                    })
                }),
            );
        }

        {
            let remote = remote.clone();
            control.register_handler(
                MessageKind::RemoteInput,
                Arc::new(move |msg: Message| -> HandlerFuture {
                    let remote = remote.clone();
                    Box::pin(async move {
                        remote.remote_input(msg.data.get("event").cloned().unwrap_or(serde_json::Value::Null));
                        ok(serde_json::Value::Null)
                    })
                }),
            );
        }

        for kind in [MessageKind::StopRemote, MessageKind::WebrtcStop] {
            let remote = remote.clone();
            control.register_handler(
                kind,
                Arc::new(move |msg: Message| -> HandlerFuture {
                    let remote = remote.clone();
                    Box::pin(async move {
                        let Some(session_id) = msg.data.get("session_id").and_then(|v| v.as_str()) else {
                            return err("missing session_id");
                        };
                        let session_id = session_id.to_string();
                        match remote.stop_remote(&session_id).await {
                            Ok(()) => ok(serde_json::Value::Null),
                            Err(e) => err(e.to_string()),
                        }
                    })
                }),
            );
        }

        control.register_handler(
            MessageKind::CollectDiagnostics,
            Arc::new(move |_msg: Message| -> HandlerFuture {
                let diagnostics = diagnostics.clone();
                Box::pin(async move {
                    match diagnostics.collect() {
                        Ok(report) => ok(json!(report)),
                        Err(e) => err(e.to_string()),
                    }
                })
            }),
        );

        control.register_handler(
            MessageKind::ExecuteCommand,
            Arc::new(move |msg: Message| -> HandlerFuture {
                let commands = commands.clone();
                Box::pin(async move {
                    let Some(command) = msg.data.get("command").and_then(|v| v.as_str()) else {
                        return err("missing command");
                    };
                    let args: Vec<String> = msg
                        .data
                        .get("args")
                        .and_then(|v| serde_json::from_value(v.clone()).ok())
                        .unwrap_or_default();
                    match commands.execute_command(command, &args).await {
                        Ok(output) => ok(json!(output)),
                        Err(e) => err(e.to_string()),
                    }
                })
            }),
        );

        {
            let commands = commands.clone();
            control.register_handler(
                MessageKind::ExecuteScript,
                Arc::new(move |msg: Message| -> HandlerFuture {
                    let commands = commands.clone();
                    Box::pin(async move {
                        let Some(script) = msg.data.get("script").and_then(|v| v.as_str()) else {
                            return err("missing script");
                        };
                        match commands.execute_script(script).await {
                            Ok(output) => ok(json!(output)),
                            Err(e) => err(e.to_string()),
                        }
                    })
                }),
            );
        }

        control.register_handler(
            MessageKind::UninstallAgent,
            Arc::new(move |_msg: Message| -> HandlerFuture {
                let uninstall = uninstall.clone();
                let cancel = cancel.clone();
                Box::pin(async move {
                    let result = uninstall.uninstall().await;
                    // The caller terminates the process after this response is observed to
                    // have been sent; give the writer task a brief window to flush it.
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        cancel.cancel();
                    });
                    match result {
                        Ok(()) => ok(serde_json::Value::Null),
                        Err(e) => err(e.to_string()),
                    }
                })
            }),
        );
    }
}
