//! Liquidation intake pipeline.
//!
//! Consumes raw forced-order frames, normalizes and persists each event,
//! feeds the window aggregator, and hands batches to the evaluator.
//! Optional buffering coalesces micro-bursts so the evaluator sees the
//! window sum once per burst instead of once per event.

use crate::parser::parse_force_order_frame;
use crate::window::WindowAggregator;
use cascade_core::LiquidationEvent;
use cascade_store::Store;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Intake configuration.
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    /// Coalesce events for this long before forwarding; 0 disables
    /// buffering and forwards each event as a batch of one.
    pub buffer_window_ms: u64,
    pub max_batch: usize,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            buffer_window_ms: 0,
            max_batch: 64,
        }
    }
}

/// Intake counters for health reporting.
#[derive(Debug, Default)]
pub struct IntakeStats {
    pub events_seen: AtomicU64,
    pub events_dropped: AtomicU64,
}

/// Spawn the intake task.
///
/// `frame_rx` carries raw frames from the forced-order stream;
/// `batch_tx` delivers normalized event batches to the evaluator.
pub fn spawn_intake(
    config: IntakeConfig,
    store: Arc<dyn Store>,
    windows: Arc<WindowAggregator>,
    mut frame_rx: mpsc::Receiver<String>,
    batch_tx: mpsc::Sender<Vec<LiquidationEvent>>,
    shutdown: CancellationToken,
) -> (Arc<IntakeStats>, JoinHandle<()>) {
    let stats = Arc::new(IntakeStats::default());
    let task_stats = stats.clone();

    let join = tokio::spawn(async move {
        let mut pending: Vec<LiquidationEvent> = Vec::new();
        let buffering = config.buffer_window_ms > 0;
        let flush_every = Duration::from_millis(config.buffer_window_ms.max(1));
        let mut flush_tick = tokio::time::interval(flush_every);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            buffering,
            buffer_window_ms = config.buffer_window_ms,
            "Liquidation intake started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    if !pending.is_empty() {
                        flush(&batch_tx, &mut pending, &task_stats).await;
                    }
                    info!("Liquidation intake draining complete");
                    return;
                }
                _ = flush_tick.tick(), if buffering && !pending.is_empty() => {
                    flush(&batch_tx, &mut pending, &task_stats).await;
                }
                frame = frame_rx.recv() => {
                    let Some(frame) = frame else {
                        if !pending.is_empty() {
                            flush(&batch_tx, &mut pending, &task_stats).await;
                        }
                        info!("Frame channel closed, intake exiting");
                        return;
                    };
                    let received_ms = chrono::Utc::now().timestamp_millis();
                    let events = match parse_force_order_frame(&frame, received_ms) {
                        Ok(events) => events,
                        Err(e) => {
                            warn!(error = %e, "Dropping unparseable forced-order frame");
                            continue;
                        }
                    };
                    for event in events {
                        task_stats.events_seen.fetch_add(1, Ordering::Relaxed);
                        match store.insert_liquidation(&event) {
                            Ok(true) => {}
                            Ok(false) => {
                                debug!(event_id = %event.event_id, "Duplicate liquidation skipped");
                                continue;
                            }
                            Err(e) => {
                                // Keep feeding the evaluator; the store row
                                // is recoverable from the stream history.
                                warn!(error = %e, "Failed to persist liquidation");
                            }
                        }
                        windows.record(&event);
                        pending.push(event);
                        if !buffering || pending.len() >= config.max_batch {
                            flush(&batch_tx, &mut pending, &task_stats).await;
                        }
                    }
                }
            }
        }
    });

    (stats, join)
}

async fn flush(
    batch_tx: &mpsc::Sender<Vec<LiquidationEvent>>,
    pending: &mut Vec<LiquidationEvent>,
    stats: &IntakeStats,
) {
    if pending.is_empty() {
        return;
    }
    let batch = std::mem::take(pending);
    let len = batch.len();
    if let Err(e) = batch_tx.try_send(batch) {
        match e {
            mpsc::error::TrySendError::Full(batch) => {
                stats
                    .events_dropped
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                warn!(dropped = batch.len(), "Evaluator backlog full, dropping batch");
            }
            mpsc::error::TrySendError::Closed(_) => {
                debug!(len, "Evaluator channel closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_store::SqliteStore;

    fn frame(symbol: &str, side: &str, qty: &str, price: &str, t: i64) -> String {
        format!(
            r#"{{"e":"forceOrder","E":{t},"o":{{"s":"{symbol}","S":"{side}","q":"{qty}","p":"{price}","T":{t}}}}}"#
        )
    }

    #[tokio::test]
    async fn test_intake_persists_and_forwards() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let windows = Arc::new(WindowAggregator::new(60_000));
        let (frame_tx, frame_rx) = mpsc::channel(16);
        let (batch_tx, mut batch_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();

        let (stats, _join) = spawn_intake(
            IntakeConfig::default(),
            store.clone(),
            windows.clone(),
            frame_rx,
            batch_tx,
            shutdown.clone(),
        );

        frame_tx
            .send(frame("BTCUSDT", "BUY", "2", "60000", 1_700_000_000_000))
            .await
            .unwrap();

        let batch = batch_rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].symbol.as_str(), "BTCUSDT");
        assert_eq!(stats.events_seen.load(Ordering::Relaxed), 1);

        // Persisted and visible to the store.
        use cascade_store::Store as _;
        assert_eq!(store.recent_liquidations(10).unwrap().len(), 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_intake_skips_duplicates() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let windows = Arc::new(WindowAggregator::new(60_000));
        let (frame_tx, frame_rx) = mpsc::channel(16);
        let (batch_tx, mut batch_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();

        let (_stats, _join) = spawn_intake(
            IntakeConfig::default(),
            store,
            windows,
            frame_rx,
            batch_tx,
            shutdown.clone(),
        );

        let f = frame("BTCUSDT", "BUY", "2", "60000", 1_700_000_000_000);
        frame_tx.send(f.clone()).await.unwrap();
        frame_tx.send(f).await.unwrap();

        let first = batch_rx.recv().await.unwrap();
        assert_eq!(first.len(), 1);
        // Second frame is a duplicate; nothing further arrives.
        let second = tokio::time::timeout(Duration::from_millis(100), batch_rx.recv()).await;
        assert!(second.is_err());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_buffering_coalesces() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let windows = Arc::new(WindowAggregator::new(60_000));
        let (frame_tx, frame_rx) = mpsc::channel(16);
        let (batch_tx, mut batch_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();

        let (_stats, _join) = spawn_intake(
            IntakeConfig {
                buffer_window_ms: 80,
                max_batch: 64,
            },
            store,
            windows,
            frame_rx,
            batch_tx,
            shutdown.clone(),
        );

        frame_tx
            .send(frame("BTCUSDT", "BUY", "1", "60000", 1_700_000_000_000))
            .await
            .unwrap();
        frame_tx
            .send(frame("BTCUSDT", "BUY", "1", "60000", 1_700_000_000_001))
            .await
            .unwrap();

        let batch = batch_rx.recv().await.unwrap();
        assert_eq!(batch.len(), 2, "burst should be coalesced into one batch");
        shutdown.cancel();
    }
}
