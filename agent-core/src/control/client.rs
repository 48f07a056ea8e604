//! Control-plane client: a persistent, authenticated, auto-reconnecting WebSocket channel
//! with request/response correlation. Grounded on the reconnect-supervisor pattern already
//! used in this codebase for upstream market-data channels, generalized from a
//! subscribe/resubscribe protocol to this agent's auth/heartbeat/dispatch protocol.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::protocol::{Message, MessageKind};

use super::backoff::Backoff;

/// Errors surfaced by control-client operations. Transport/protocol failures inside the
/// reconnect loop are logged, not returned — only caller-facing operations (`send_request`,
/// `send`) return an error.
#[derive(Debug, Error)]
pub enum ControlError {
    /// `send_request` exceeded its timeout without a matching response.
    #[error("request timed out waiting for response")]
    Timeout,
    /// The connection dropped while a request was in flight.
    #[error("connection dropped before a response arrived")]
    ConnectionDropped,
    /// The outbound channel was full; the caller should retry rather than block.
    #[error("outbound channel full, send rejected")]
    ChannelFull,
    /// The client isn't connected at all.
    #[error("not connected")]
    NotConnected,
}

/// Observable connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No active connection attempt.
    Disconnected,
    /// TCP/TLS/WebSocket handshake in progress.
    Dialing,
    /// Handshake complete, waiting on the auth exchange.
    Authenticating,
    /// Auth succeeded; the reader/writer loop is live.
    Authenticated,
}

type HandlerFuture = Pin<Box<dyn Future<Output = Option<Message>> + Send>>;
/// A handler bound to a server-initiated [`MessageKind`]. Returns `Some(response)` to have
/// the client send a correlated response back (only meaningful if the triggering message
/// carried a `request_id`); `None` for fire-and-forget notifications.
pub type HandlerFn = Arc<dyn Fn(Message) -> HandlerFuture + Send + Sync>;

/// Every send — fire-and-forget or correlated request — travels as a plain [`Message`]
/// through this single bounded channel; correlation is tracked separately in `pending`.
enum Outbound {
    Fire(Message),
}

/// Configuration for a [`ControlClient`].
#[derive(Debug, Clone)]
pub struct ControlClientConfig {
    /// WebSocket URL of the control endpoint.
    pub url: String,
    /// Stable local agent identifier.
    pub agent_id: String,
    /// Server-assigned device identifier.
    pub device_id: String,
    /// Enrollment bearer token presented on every auth attempt.
    pub enrollment_token: String,
    /// Semantic agent version reported at auth time.
    pub agent_version: String,
    /// Heartbeat cadence while authenticated.
    pub heartbeat_interval: Duration,
    /// Initial reconnect backoff delay.
    pub backoff_base: Duration,
    /// Reconnect backoff cap.
    pub backoff_max: Duration,
    /// Deadline for the auth handshake itself.
    pub auth_timeout: Duration,
    /// Depth of the bounded outbound command channel.
    pub outbound_capacity: usize,
}

impl Default for ControlClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            agent_id: String::new(),
            device_id: String::new(),
            enrollment_token: String::new(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            heartbeat_interval: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(10),
            outbound_capacity: 256,
        }
    }
}

/// The persistent control-plane client. Cheap to clone (internally `Arc`-backed); clone and
/// hand out freely to operation handlers that need to `send`/`send_request`.
#[derive(Clone)]
pub struct ControlClient {
    config: Arc<ControlClientConfig>,
    cmd_tx: mpsc::Sender<Outbound>,
    cmd_rx: Arc<Mutex<Option<mpsc::Receiver<Outbound>>>>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>,
    handlers: Arc<Mutex<HashMap<String, HandlerFn>>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    authenticated: Arc<AtomicBool>,
    on_connect: Arc<Mutex<Option<Arc<dyn Fn() + Send + Sync>>>>,
    on_disconnect: Arc<Mutex<Option<Arc<dyn Fn() + Send + Sync>>>>,
}

impl ControlClient {
    /// Builds a new client. `start` must be called exactly once to drive the connection.
    pub fn new(config: ControlClientConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.outbound_capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        Self {
            config: Arc::new(config),
            cmd_tx,
            cmd_rx: Arc::new(Mutex::new(Some(cmd_rx))),
            pending: Arc::new(Mutex::new(HashMap::new())),
            handlers: Arc::new(Mutex::new(HashMap::new())),
            state_tx: Arc::new(state_tx),
            state_rx,
            authenticated: Arc::new(AtomicBool::new(false)),
            on_connect: Arc::new(Mutex::new(None)),
            on_disconnect: Arc::new(Mutex::new(None)),
        }
    }

    /// Binds an async handler for a server-initiated message kind. Handlers run inline on
    /// the reader task; one that may block internally must hand off to a spawned task
    /// instead of awaiting in place, or it will stall heartbeats and other dispatch.
    pub fn register_handler(&self, kind: MessageKind, handler: HandlerFn) {
        self.handlers
            .lock()
            .expect("handlers mutex poisoned")
            .insert(kind.wire_key(), handler);
    }

    /// Registers a callback fired every time authentication succeeds.
    pub fn on_connect(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.on_connect.lock().expect("on_connect mutex poisoned") = Some(Arc::new(f));
    }

    /// Registers a callback fired every time the connection is lost.
    pub fn on_disconnect(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.on_disconnect.lock().expect("on_disconnect mutex poisoned") = Some(Arc::new(f));
    }

    /// True only while authenticated and the reader/writer loop is live.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Subscribes to connection-state transitions, for components (like the metrics ticker)
    /// that need to avoid firing while disconnected.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Fire-and-forget send. Fails fast with [`ControlError::ChannelFull`] rather than
    /// blocking the caller if the outbound channel is saturated.
    pub fn send(&self, msg: Message) -> Result<(), ControlError> {
        self.cmd_tx
            .try_send(Outbound::Fire(msg))
            .map_err(|_| ControlError::ChannelFull)
    }

    /// Sends a correlated request and waits for its response, the timeout, or a connection
    /// drop — exactly one of those three outcomes occurs, and the pending waiter is always
    /// removed from the correlation map before this returns.
    pub async fn send_request(
        &self,
        kind: MessageKind,
        data: serde_json::Value,
        timeout: Duration,
    ) -> Result<Message, ControlError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending mutex poisoned")
            .insert(request_id.clone(), tx);

        let message = Message::request(kind, request_id.clone(), data);
        if self.cmd_tx.try_send(Outbound::Fire(message)).is_err() {
            self.pending
                .lock()
                .expect("pending mutex poisoned")
                .remove(&request_id);
            return Err(ControlError::ChannelFull);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(_)) => {
                self.pending
                    .lock()
                    .expect("pending mutex poisoned")
                    .remove(&request_id);
                Err(ControlError::ConnectionDropped)
            }
            Err(_) => {
                self.pending
                    .lock()
                    .expect("pending mutex poisoned")
                    .remove(&request_id);
                Err(ControlError::Timeout)
            }
        }
    }

    /// Replies to a server-initiated request.
    pub fn send_response(
        &self,
        request_id: impl Into<String>,
        ok: bool,
        payload: serde_json::Value,
        error: Option<String>,
    ) -> Result<(), ControlError> {
        let request_id = request_id.into();
        let msg = if ok {
            Message::ok_response(request_id, payload)
        } else {
            Message::err_response(request_id, error.unwrap_or_default())
        };
        self.send(msg)
    }

    fn set_state(&self, state: ConnectionState) {
        self.authenticated
            .store(state == ConnectionState::Authenticated, Ordering::SeqCst);
        let _ = self.state_tx.send(state);
    }

    /// Runs the connect/auth/dispatch/reconnect loop until `cancel` fires. This is the
    /// single task that owns this channel's reader, writer, and heartbeat ticker — writes
    /// are serialized because only one `tokio::select!` arm drains `cmd_rx` at a time.
    pub async fn start(self, cancel: CancellationToken) {
        let mut cmd_rx = self
            .cmd_rx
            .lock()
            .expect("cmd_rx mutex poisoned")
            .take()
            .expect("ControlClient::start called more than once");
        let mut backoff = Backoff::new(self.config.backoff_base, self.config.backoff_max);

        while !cancel.is_cancelled() {
            self.set_state(ConnectionState::Dialing);
            match self.run_once(&mut cmd_rx, &cancel, &mut backoff).await {
                Ok(()) => {}
                Err(e) => log::info!("control channel disconnected: {e}"),
            }

            self.set_state(ConnectionState::Disconnected);
            self.fail_all_pending();
            if let Some(cb) = self.on_disconnect.lock().expect("mutex poisoned").clone() {
                cb();
            }

            if cancel.is_cancelled() {
                break;
            }
            let delay = backoff.next_delay();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        // Put the receiver back so a test harness (or a caller inspecting state after a
        // deliberate shutdown) can observe a consistent `ControlClient`.
        *self.cmd_rx.lock().expect("cmd_rx mutex poisoned") = Some(cmd_rx);
    }

    async fn run_once(
        &self,
        cmd_rx: &mut mpsc::Receiver<Outbound>,
        cancel: &CancellationToken,
        backoff: &mut Backoff,
    ) -> Result<(), ControlError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.config.url)
            .await
            .map_err(|_| ControlError::NotConnected)?;
        let (mut write, mut read) = ws_stream.split();

        self.set_state(ConnectionState::Authenticating);
        let auth = Message::fire(
            MessageKind::AuthResponse,
            json!({
                "agent_id": self.config.agent_id,
                "device_id": self.config.device_id,
                "enrollment_token": self.config.enrollment_token,
                "agent_version": self.config.agent_version,
            }),
        );
        let auth_line = auth
            .to_line()
            .unwrap_or_default();
        if write.send(WsMessage::Text(auth_line.into())).await.is_err() {
            return Err(ControlError::NotConnected);
        }

        let auth_ack = tokio::time::timeout(self.config.auth_timeout, read.next()).await;
        match auth_ack {
            Ok(Some(Ok(WsMessage::Text(text)))) => {
                let msg = Message::parse(&text).map_err(|_| ControlError::NotConnected)?;
                if msg.error.is_some() {
                    return Err(ControlError::NotConnected);
                }
            }
            _ => return Err(ControlError::NotConnected),
        }

        backoff.reset();
        self.set_state(ConnectionState::Authenticated);
        if let Some(cb) = self.on_connect.lock().expect("mutex poisoned").clone() {
            cb();
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    let hb = Message::fire(MessageKind::Heartbeat, serde_json::Value::Null);
                    if let Ok(line) = hb.to_line() {
                        if write.send(WsMessage::Text(line.into())).await.is_err() {
                            return Err(ControlError::NotConnected);
                        }
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Outbound::Fire(msg)) => {
                            if let Ok(line) = msg.to_line() {
                                if write.send(WsMessage::Text(line.into())).await.is_err() {
                                    return Err(ControlError::NotConnected);
                                }
                            }
                        }
                        None => return Ok(()),
                    }
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            self.dispatch(&text).await;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            return Err(ControlError::NotConnected);
                        }
                        Some(Err(_)) => {
                            return Err(ControlError::NotConnected);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    async fn dispatch(&self, text: &str) {
        let msg = match Message::parse(text) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("dropping undecodable control frame: {e}");
                return;
            }
        };

        if msg.kind == MessageKind::Response {
            if let Some(request_id) = &msg.request_id {
                let waiter = self
                    .pending
                    .lock()
                    .expect("pending mutex poisoned")
                    .remove(request_id);
                if let Some(tx) = waiter {
                    let _ = tx.send(msg);
                }
            }
            return;
        }

        let key = msg.kind.wire_key();
        let handler = self.handlers.lock().expect("handlers mutex poisoned").get(&key).cloned();
        let Some(handler) = handler else {
            log::debug!("no handler registered for message kind {key}");
            return;
        };

        let request_id = msg.request_id.clone();
        let response = handler(msg).await;
        match (request_id, response) {
            (Some(request_id), Some(response)) => {
                let out = match response.error {
                    Some(error) => Message::err_response(request_id, error),
                    None => Message::ok_response(request_id, response.data),
                };
                if self.send(out).is_err() {
                    log::warn!("dropped response: outbound channel full");
                }
            }
            (Some(request_id), None) => {
                log::warn!("handler for {key} produced no response for request {request_id}");
                let out = Message::err_response(request_id, "handler produced no response".to_string());
                if self.send(out).is_err() {
                    log::warn!("dropped response: outbound channel full");
                }
            }
            (None, _) => {}
        }
    }

    fn fail_all_pending(&self) {
        let mut pending = self.pending.lock().expect("pending mutex poisoned");
        for (_, waiter) in pending.drain() {
            drop(waiter); // dropping the sender fails the receiver with RecvError
        }
    }
}

impl MessageKind {
    fn wire_key(&self) -> String {
        match self {
            MessageKind::Unknown(s) => s.clone(),
            other => format!("{other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_request_times_out_when_unanswered() {
        let client = ControlClient::new(ControlClientConfig {
            url: "ws://127.0.0.1:1/unreachable".to_string(),
            ..Default::default()
        });

        // Without calling start(), nothing ever drains cmd_rx or resolves the waiter, so
        // send_request must return via its own timeout.
        let result = client
            .send_request(MessageKind::Ping, serde_json::Value::Null, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(ControlError::Timeout)));
    }

    #[test]
    fn is_authenticated_false_before_start() {
        let client = ControlClient::new(ControlClientConfig::default());
        assert!(!client.is_authenticated());
    }
}
