//! Per-symbol evaluation workers.
//!
//! A dispatcher fans event batches out to one worker per symbol, so events
//! for the same symbol evaluate in arrival order while different symbols
//! evaluate in parallel.

use crate::evaluator::{EvalOutcome, TradeEvaluator};
use cascade_core::{LiquidationEvent, Symbol};
use cascade_telemetry::EngineCounters;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const WORKER_QUEUE: usize = 256;

/// Spawn the dispatcher plus its per-symbol workers.
pub fn spawn_evaluator_workers(
    evaluator: Arc<TradeEvaluator>,
    counters: Arc<EngineCounters>,
    mut batch_rx: mpsc::Receiver<Vec<LiquidationEvent>>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut workers: HashMap<Symbol, mpsc::Sender<LiquidationEvent>> = HashMap::new();
        info!("Evaluator dispatcher started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    // Dropping the senders lets each worker drain and exit.
                    workers.clear();
                    info!("Evaluator dispatcher exiting");
                    return;
                }
                batch = batch_rx.recv() => {
                    let Some(batch) = batch else {
                        workers.clear();
                        info!("Intake channel closed, evaluator dispatcher exiting");
                        return;
                    };
                    for event in batch {
                        EngineCounters::incr(&counters.liquidations_seen);
                        let tx = workers
                            .entry(event.symbol.clone())
                            .or_insert_with(|| {
                                spawn_symbol_worker(
                                    event.symbol.clone(),
                                    evaluator.clone(),
                                    counters.clone(),
                                )
                            });
                        if let Err(e) = tx.try_send(event) {
                            match e {
                                mpsc::error::TrySendError::Full(event) => {
                                    warn!(
                                        symbol = %event.symbol,
                                        "Symbol worker backlog full, dropping event"
                                    );
                                }
                                mpsc::error::TrySendError::Closed(event) => {
                                    // Worker died; replace it next event.
                                    warn!(symbol = %event.symbol, "Symbol worker gone");
                                    workers.remove(&event.symbol);
                                }
                            }
                        }
                    }
                }
            }
        }
    })
}

fn spawn_symbol_worker(
    symbol: Symbol,
    evaluator: Arc<TradeEvaluator>,
    counters: Arc<EngineCounters>,
) -> mpsc::Sender<LiquidationEvent> {
    let (tx, mut rx) = mpsc::channel::<LiquidationEvent>(WORKER_QUEUE);
    tokio::spawn(async move {
        debug!(%symbol, "Symbol worker started");
        while let Some(event) = rx.recv().await {
            match evaluator.evaluate(&event).await {
                Ok(outcome) => {
                    if matches!(
                        outcome,
                        EvalOutcome::Placed { .. } | EvalOutcome::Simulated { .. }
                    ) {
                        EngineCounters::incr(&counters.entries_submitted);
                    }
                    debug!(%symbol, ?outcome, "Evaluation complete");
                }
                Err(e) => warn!(%symbol, error = %e, "Evaluation failed"),
            }
        }
        debug!(%symbol, "Symbol worker exiting");
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatcher_exits_on_channel_close() {
        use crate::config::EvaluatorConfig;
        use crate::exposure::ExposureTracker;
        use cascade_feed::WindowAggregator;
        use cascade_store::SqliteStore;

        // Minimal evaluator over empty config; no symbol is configured, so
        // events are ignored, which is enough to exercise the dispatcher.
        struct NoopVenue;
        use async_trait::async_trait;
        use cascade_core::{MarginType, SymbolSpec};
        use cascade_governor::Priority;
        use cascade_venue::{
            AccountInfo, DepthSnapshot, NewOrder, OpenOrder, OrderAck, PositionRisk, VenueClient,
            VenueError, VenueResult,
        };

        #[async_trait]
        impl VenueClient for NoopVenue {
            async fn exchange_info(&self) -> VenueResult<Vec<SymbolSpec>> {
                Ok(vec![])
            }
            async fn symbol_spec(&self, _s: &Symbol) -> VenueResult<SymbolSpec> {
                Err(VenueError::PositionNotFound)
            }
            async fn depth(
                &self,
                _s: &Symbol,
                _l: u32,
                _p: Priority,
            ) -> VenueResult<DepthSnapshot> {
                Err(VenueError::PositionNotFound)
            }
            async fn place_order(&self, _o: &NewOrder, _p: Priority) -> VenueResult<OrderAck> {
                Err(VenueError::PositionNotFound)
            }
            async fn place_batch(
                &self,
                _o: &[NewOrder],
                _p: Priority,
            ) -> VenueResult<Vec<VenueResult<OrderAck>>> {
                Ok(vec![])
            }
            async fn cancel_order(&self, _s: &Symbol, _i: &str, _p: Priority) -> VenueResult<()> {
                Ok(())
            }
            async fn cancel_all_open(&self, _s: &Symbol) -> VenueResult<()> {
                Ok(())
            }
            async fn open_orders(&self, _s: Option<&Symbol>) -> VenueResult<Vec<OpenOrder>> {
                Ok(vec![])
            }
            async fn account(&self) -> VenueResult<AccountInfo> {
                Err(VenueError::PositionNotFound)
            }
            async fn position_risk(&self) -> VenueResult<Vec<PositionRisk>> {
                Ok(vec![])
            }
            async fn set_leverage(&self, _s: &Symbol, _l: u32) -> VenueResult<()> {
                Ok(())
            }
            async fn set_margin_type(&self, _s: &Symbol, _m: MarginType) -> VenueResult<()> {
                Ok(())
            }
            async fn set_position_mode(&self, _h: bool) -> VenueResult<()> {
                Ok(())
            }
            async fn get_position_mode(&self) -> VenueResult<bool> {
                Ok(false)
            }
            async fn set_multi_assets_mode(&self, _e: bool) -> VenueResult<()> {
                Ok(())
            }
            async fn get_multi_assets_mode(&self) -> VenueResult<bool> {
                Ok(false)
            }
            async fn listen_key_create(&self) -> VenueResult<String> {
                Ok("k".into())
            }
            async fn listen_key_keepalive(&self) -> VenueResult<()> {
                Ok(())
            }
            async fn listen_key_delete(&self) -> VenueResult<()> {
                Ok(())
            }
        }

        let evaluator = Arc::new(TradeEvaluator::new(
            EvaluatorConfig::default(),
            Arc::new(NoopVenue),
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            Arc::new(WindowAggregator::new(60_000)),
            Arc::new(ExposureTracker::new()),
        ));

        let (batch_tx, batch_rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        let join = spawn_evaluator_workers(
            evaluator,
            Arc::new(EngineCounters::default()),
            batch_rx,
            shutdown,
        );

        drop(batch_tx);
        join.await.unwrap();
    }
}
