//! Push channel transport
//!
//! Optional event socket that nudges the delta loop when the server observes
//! changes, so polling can back off to a long interval. The transport is a
//! websocket with a ping/pong heartbeat; every received event simply asks
//! the delta loop to run immediately.
//!
//! Reconnects use exponential backoff capped at 60 s with ±10% jitter. The
//! bearer token is attached at connect time, so the connection rotates on
//! token refresh as a side effect of reconnecting.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use onemount_core::domain::RemoteError;
use onemount_core::ports::{ITokenProvider, PushHealth};

/// Reconnect backoff ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Missed heartbeats before the channel reports `Degraded`.
const DEGRADED_AFTER_MISSES: u32 = 2;

/// Missed heartbeats before the transport gives up and reconnects.
const RECONNECT_AFTER_MISSES: u32 = 4;

/// Push channel configuration.
#[derive(Debug, Clone)]
pub struct PushChannelConfig {
    /// Websocket endpoint for the subscribed resource
    pub socket_url: String,
    /// Heartbeat cadence (server-negotiated; this is the opening offer)
    pub heartbeat_interval: Duration,
}

impl Default for PushChannelConfig {
    fn default() -> Self {
        Self {
            socket_url: String::new(),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Live push channel handle.
///
/// Dropping the handle tears the transport down; the task notices the
/// closed nudge channel on its next event and exits.
pub struct PushChannel {
    nudges: mpsc::Receiver<()>,
    health: watch::Receiver<PushHealth>,
    task: JoinHandle<()>,
}

impl PushChannel {
    /// Opens the channel and spawns the transport task.
    pub fn connect(config: PushChannelConfig, tokens: Arc<dyn ITokenProvider>) -> Self {
        let (nudge_tx, nudge_rx) = mpsc::channel(8);
        let (health_tx, health_rx) = watch::channel(PushHealth::Failed);

        let task = tokio::spawn(transport_loop(config, tokens, nudge_tx, health_tx));

        Self {
            nudges: nudge_rx,
            health: health_rx,
            task,
        }
    }

    /// Waits for the next server nudge. Returns `None` once the transport
    /// has exited permanently.
    pub async fn next_nudge(&mut self) -> Option<()> {
        self.nudges.recv().await
    }

    /// Current transport health.
    pub fn health(&self) -> PushHealth {
        *self.health.borrow()
    }

    /// A watch receiver for health telemetry.
    pub fn health_watch(&self) -> watch::Receiver<PushHealth> {
        self.health.clone()
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Heartbeat bookkeeping, kept pure for testability.
#[derive(Debug)]
pub(crate) struct HeartbeatMonitor {
    outstanding: u32,
}

impl HeartbeatMonitor {
    pub(crate) fn new() -> Self {
        Self { outstanding: 0 }
    }

    /// A pong (or any server frame) arrived.
    pub(crate) fn record_activity(&mut self) {
        self.outstanding = 0;
    }

    /// A heartbeat tick fired; returns the resulting health, or `None` when
    /// the transport should reconnect.
    pub(crate) fn tick(&mut self) -> Option<PushHealth> {
        self.outstanding += 1;
        if self.outstanding >= RECONNECT_AFTER_MISSES {
            None
        } else if self.outstanding >= DEGRADED_AFTER_MISSES {
            Some(PushHealth::Degraded)
        } else {
            Some(PushHealth::Healthy)
        }
    }
}

/// Backoff for reconnect attempt `attempt` (0-based): 1 s doubling, capped
/// at 60 s, ±10% deterministic jitter.
pub(crate) fn reconnect_backoff(attempt: u32) -> Duration {
    let base_ms = 1000u64.saturating_mul(2u64.saturating_pow(attempt.min(16)));
    let capped = base_ms.min(MAX_BACKOFF.as_millis() as u64);

    let mut hasher = DefaultHasher::new();
    attempt.hash(&mut hasher);
    let jitter_permille = (hasher.finish() % 201) as i64 - 100;
    let jittered = capped as i64 + capped as i64 * jitter_permille / 1000;
    Duration::from_millis(jittered.max(0) as u64)
}

async fn transport_loop(
    config: PushChannelConfig,
    tokens: Arc<dyn ITokenProvider>,
    nudges: mpsc::Sender<()>,
    health: watch::Sender<PushHealth>,
) {
    let mut attempt: u32 = 0;

    loop {
        if nudges.is_closed() {
            return;
        }

        match run_connection(&config, &tokens, &nudges, &health).await {
            Ok(()) => return, // clean shutdown
            Err(err) => {
                let _ = health.send(PushHealth::Failed);
                let delay = reconnect_backoff(attempt);
                warn!(
                    error = %err,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "push channel lost, reconnecting"
                );
                attempt = attempt.saturating_add(1);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Runs one websocket connection until it fails or the channel is dropped.
async fn run_connection(
    config: &PushChannelConfig,
    tokens: &Arc<dyn ITokenProvider>,
    nudges: &mpsc::Sender<()>,
    health: &watch::Sender<PushHealth>,
) -> Result<(), RemoteError> {
    let token = tokens.bearer().await?;
    let mut request = config
        .socket_url
        .as_str()
        .into_client_request()
        .map_err(|e| RemoteError::Malformed(format!("bad socket url: {e}")))?;
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {token}")
            .parse()
            .map_err(|_| RemoteError::Internal("unencodable bearer token".to_string()))?,
    );

    let (stream, _) = connect_async(request)
        .await
        .map_err(|e| RemoteError::NetworkUnreachable(format!("websocket connect: {e}")))?;
    let (mut sink, mut source) = stream.split();

    info!(url = %config.socket_url, "push channel connected");
    let _ = health.send(PushHealth::Healthy);

    let mut monitor = HeartbeatMonitor::new();
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            frame = source.next() => {
                match frame {
                    Some(Ok(Message::Ping(payload))) => {
                        monitor.record_activity();
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        monitor.record_activity();
                        let _ = health.send(PushHealth::Healthy);
                    }
                    Some(Ok(Message::Text(_) | Message::Binary(_))) => {
                        monitor.record_activity();
                        debug!("push notification received, nudging delta loop");
                        if nudges.try_send(()).is_err() && nudges.is_closed() {
                            return Ok(());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(RemoteError::NetworkUnreachable(
                            "push channel closed by server".to_string(),
                        ));
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        return Err(RemoteError::NetworkUnreachable(format!(
                            "push channel read: {e}"
                        )));
                    }
                }
            }
            _ = heartbeat.tick() => {
                match monitor.tick() {
                    Some(state) => {
                        let _ = health.send(state);
                        if sink.send(Message::Ping(Vec::new())).await.is_err() {
                            return Err(RemoteError::NetworkUnreachable(
                                "push channel ping failed".to_string(),
                            ));
                        }
                    }
                    None => {
                        return Err(RemoteError::Timeout(
                            "push channel heartbeats exhausted".to_string(),
                        ));
                    }
                }
            }
            _ = nudges.closed() => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(());
            }
        }
    }
}
