//! Data-plane client: an optional secondary streaming channel for high-volume telemetry.
//! Opportunistic by design — callers fall back to the control channel whenever this one
//! isn't connected or a send fails. Runs its own reconnect loop, independent of
//! [`super::client::ControlClient`], reusing the same backoff policy type.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;

/// Configuration for a [`DataPlaneClient`].
#[derive(Debug, Clone)]
pub struct DataPlaneConfig {
    /// WebSocket URL of the data-plane endpoint.
    pub url: String,
    /// Initial reconnect backoff delay.
    pub backoff_base: Duration,
    /// Reconnect backoff cap.
    pub backoff_max: Duration,
    /// Depth of the bounded outbound channel.
    pub outbound_capacity: usize,
}

impl Default for DataPlaneConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            outbound_capacity: 512,
        }
    }
}

/// The optional secondary telemetry channel.
#[derive(Clone)]
pub struct DataPlaneClient {
    config: Arc<DataPlaneConfig>,
    tx: mpsc::Sender<Vec<u8>>,
    rx: Arc<std::sync::Mutex<Option<mpsc::Receiver<Vec<u8>>>>>,
    connected: Arc<AtomicBool>,
}

impl DataPlaneClient {
    /// Builds a new client. `start` must be called exactly once.
    pub fn new(config: DataPlaneConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.outbound_capacity);
        Self {
            config: Arc::new(config),
            tx,
            rx: Arc::new(std::sync::Mutex::new(Some(rx))),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// True while the secondary channel is connected and able to accept sends.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Pushes a pre-serialized metrics frame. Opportunistic: returns an error immediately
    /// if not connected or the outbound channel is full, so the caller can fall back to the
    /// control channel without delay.
    pub fn send_metrics(&self, frame: Vec<u8>) -> Result<(), ()> {
        if !self.is_connected() {
            return Err(());
        }
        self.tx.try_send(frame).map_err(|_| ())
    }

    /// Runs the connect/reconnect loop until `cancel` fires.
    pub async fn start(self, cancel: CancellationToken) {
        if self.config.url.is_empty() {
            // No data-plane endpoint configured; this channel simply never connects. The
            // metrics ticker always falls back to the control channel in that case.
            cancel.cancelled().await;
            return;
        }

        let mut rx = self
            .rx
            .lock()
            .expect("rx mutex poisoned")
            .take()
            .expect("DataPlaneClient::start called more than once");
        let mut backoff = Backoff::new(self.config.backoff_base, self.config.backoff_max);

        while !cancel.is_cancelled() {
            match self.run_once(&mut rx, &cancel).await {
                Ok(()) => backoff.reset(),
                Err(e) => log::info!("data-plane channel disconnected: {e}"),
            }
            self.connected.store(false, Ordering::SeqCst);
            if cancel.is_cancelled() {
                break;
            }
            let delay = backoff.next_delay();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_once(
        &self,
        rx: &mut mpsc::Receiver<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.config.url).await?;
        let (mut write, mut read) = ws_stream.split();
        self.connected.store(true, Ordering::SeqCst);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                frame = rx.recv() => {
                    match frame {
                        Some(bytes) => {
                            if write.send(WsMessage::Binary(bytes.into())).await.is_err() {
                                return Ok(());
                            }
                        }
                        None => return Ok(()),
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                        Some(Err(e)) => return Err(e),
                        _ => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_metrics_fails_fast_when_disconnected() {
        let client = DataPlaneClient::new(DataPlaneConfig::default());
        assert!(client.send_metrics(vec![1, 2, 3]).is_err());
    }
}
