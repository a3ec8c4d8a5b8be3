//! Stream connection loop with reconnect and backoff.

use crate::error::{WsError, WsResult};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Resolves the stream URL for each connection attempt.
///
/// Listen-key streams need a fresh key per attempt; market streams use a
/// fixed URL.
#[async_trait]
pub trait UrlProvider: Send + Sync {
    async fn url(&self) -> WsResult<String>;
}

/// Fixed stream URL.
pub struct StaticUrl(pub String);

#[async_trait]
impl UrlProvider for StaticUrl {
    async fn url(&self) -> WsResult<String> {
        Ok(self.0.clone())
    }
}

/// Per-stream configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Stream name for logging.
    pub name: String,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Log degraded mode once the stream has been down this long.
    pub degraded_after_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: "stream".into(),
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 60_000,
            degraded_after_ms: 30_000,
        }
    }
}

#[derive(Debug, Default)]
struct StreamState {
    connected: bool,
    last_frame_at: Option<Instant>,
    disconnected_at: Option<Instant>,
}

/// Shared view of a stream's health.
#[derive(Clone)]
pub struct StreamHandle {
    state: Arc<RwLock<StreamState>>,
    reconnects: Arc<AtomicU64>,
}

impl StreamHandle {
    fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(StreamState::default())),
            reconnects: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().connected
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Milliseconds since the last received frame, if any.
    pub fn last_frame_age_ms(&self) -> Option<u64> {
        self.state
            .read()
            .last_frame_at
            .map(|t| t.elapsed().as_millis() as u64)
    }
}

/// Run a stream until shutdown, forwarding text frames to `frame_tx`.
///
/// Returns a handle for health inspection; the loop itself is spawned by
/// the caller. Backoff doubles per failed attempt (with up to 20% jitter)
/// and resets after a successful connection.
pub fn spawn_stream(
    config: StreamConfig,
    url_provider: Arc<dyn UrlProvider>,
    frame_tx: mpsc::Sender<String>,
    shutdown: CancellationToken,
) -> (StreamHandle, tokio::task::JoinHandle<()>) {
    let handle = StreamHandle::new();
    let task_handle = handle.clone();
    let join = tokio::spawn(async move {
        run_stream(config, url_provider, frame_tx, shutdown, task_handle).await;
    });
    (handle, join)
}

/// The connection loop. Public for callers that want to drive it directly.
pub async fn run_stream(
    config: StreamConfig,
    url_provider: Arc<dyn UrlProvider>,
    frame_tx: mpsc::Sender<String>,
    shutdown: CancellationToken,
    handle: StreamHandle,
) {
    let mut delay = Duration::from_millis(config.reconnect_base_delay_ms);
    let mut degraded_logged = false;

    loop {
        if shutdown.is_cancelled() {
            info!(stream = %config.name, "Shutdown requested, stream exiting");
            return;
        }

        let url = match url_provider.url().await {
            Ok(url) => url,
            Err(e) => {
                warn!(stream = %config.name, error = %e, "URL resolution failed");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = next_delay(delay, config.reconnect_max_delay_ms);
                continue;
            }
        };

        match connect_once(&config, &url, &frame_tx, &shutdown, &handle).await {
            Ok(()) => {
                // Clean close (shutdown or peer close): reset backoff.
                delay = Duration::from_millis(config.reconnect_base_delay_ms);
            }
            Err(WsError::ReceiverDropped) => {
                info!(stream = %config.name, "Consumer gone, stream exiting");
                return;
            }
            Err(e) => {
                warn!(stream = %config.name, error = %e, "Stream error");
            }
        }

        if shutdown.is_cancelled() {
            return;
        }

        {
            let mut state = handle.state.write();
            state.connected = false;
            if state.disconnected_at.is_none() {
                state.disconnected_at = Some(Instant::now());
            }
            let down_for = state
                .disconnected_at
                .map(|t| t.elapsed())
                .unwrap_or_default();
            if !degraded_logged && down_for >= Duration::from_millis(config.degraded_after_ms) {
                error!(
                    stream = %config.name,
                    down_secs = down_for.as_secs(),
                    "Stream degraded: relying on resting orders until reconnect"
                );
                degraded_logged = true;
            }
        }

        handle.reconnects.fetch_add(1, Ordering::Relaxed);
        let jittered = jitter(delay);
        debug!(
            stream = %config.name,
            delay_ms = jittered.as_millis() as u64,
            "Reconnecting"
        );
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(jittered) => {}
        }
        delay = next_delay(delay, config.reconnect_max_delay_ms);
        if handle.is_connected() {
            degraded_logged = false;
        }
    }
}

fn next_delay(current: Duration, max_ms: u64) -> Duration {
    (current * 2).min(Duration::from_millis(max_ms))
}

fn jitter(delay: Duration) -> Duration {
    let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 5 + 1);
    delay + Duration::from_millis(jitter_ms)
}

async fn connect_once(
    config: &StreamConfig,
    url: &str,
    frame_tx: &mpsc::Sender<String>,
    shutdown: &CancellationToken,
    handle: &StreamHandle,
) -> WsResult<()> {
    debug!(stream = %config.name, url, "Connecting");
    let (ws, _) = connect_async(url)
        .await
        .map_err(|e| WsError::Connection(e.to_string()))?;
    info!(stream = %config.name, "Connected");

    {
        let mut state = handle.state.write();
        state.connected = true;
        state.disconnected_at = None;
    }

    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle.state.write().last_frame_at = Some(Instant::now());
                        if frame_tx.send(text.to_string()).await.is_err() {
                            return Err(WsError::ReceiverDropped);
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if write.send(Message::Pong(payload)).await.is_err() {
                            return Err(WsError::Closed);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(WsError::Closed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(WsError::Connection(e.to_string()));
                    }
                }
            }
        }
    }
}
