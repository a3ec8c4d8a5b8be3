//! Mark-price fast path.
//!
//! Watches the mark-price stream; when the mark prints through a tranche's
//! TP level, the resting TP is canceled and the tranche closed at market
//! instead of waiting for the limit to fill. Never touches SL orders.

use crate::breaker::CircuitBreaker;
use crate::protection::ProtectionWork;
use crate::tranche::TrancheBook;
use cascade_core::{PositionSide, Price, Symbol};
use cascade_feed::parser::parse_mark_price_frame;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fast-path configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub enabled: bool,
    /// Trigger slack: a LONG fires at `mark >= tp * (1 - epsilon)`.
    pub epsilon: Decimal,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            epsilon: Decimal::ZERO,
        }
    }
}

/// Fast-path price monitor.
pub struct PriceMonitor {
    config: MonitorConfig,
    book: Arc<TrancheBook>,
    breaker: Arc<CircuitBreaker>,
    work_tx: mpsc::Sender<ProtectionWork>,
    /// Tranches with an in-flight close (shared with the protection actor).
    inflight: Arc<Mutex<HashSet<(Symbol, PositionSide, u64)>>>,
    /// Latest mark per symbol.
    marks: DashMap<Symbol, Price>,
}

impl PriceMonitor {
    pub fn new(
        config: MonitorConfig,
        book: Arc<TrancheBook>,
        breaker: Arc<CircuitBreaker>,
        work_tx: mpsc::Sender<ProtectionWork>,
        inflight: Arc<Mutex<HashSet<(Symbol, PositionSide, u64)>>>,
    ) -> Self {
        Self {
            config,
            book,
            breaker,
            work_tx,
            inflight,
            marks: DashMap::new(),
        }
    }

    pub fn latest_mark(&self, symbol: &Symbol) -> Option<Price> {
        self.marks.get(symbol).map(|r| *r)
    }

    /// Process one mark-price tick.
    pub fn on_mark(&self, symbol: &Symbol, mark: Price) {
        self.marks.insert(symbol.clone(), mark);
        if !self.config.enabled {
            return;
        }
        // Drop inflight markers whose tranche is already gone (the fill
        // removed it) so the set stays bounded.
        {
            let mut inflight = self.inflight.lock();
            inflight.retain(|(s, side, id)| s != symbol || self.book.get(s, *side, *id).is_some());
        }
        for position_side in [PositionSide::Long, PositionSide::Short, PositionSide::Both] {
            for tranche in self.book.snapshot(symbol, position_side) {
                let Some(tp_price) = tranche.tp_price else {
                    continue;
                };
                if !self.overshoots(position_side, mark, tp_price) {
                    continue;
                }
                let key = (symbol.clone(), position_side, tranche.id);
                {
                    let mut inflight = self.inflight.lock();
                    if inflight.contains(&key) {
                        continue;
                    }
                    if !self.breaker.allows(symbol, position_side, tranche.id) {
                        continue;
                    }
                    // Mark before sending so a 1s-cadence stream cannot
                    // double-fire while the close is in flight.
                    inflight.insert(key.clone());
                }
                info!(
                    %symbol,
                    %position_side,
                    tranche_id = tranche.id,
                    mark = %mark,
                    tp = %tp_price,
                    "Mark overshot TP, triggering fast-path close"
                );
                let work = ProtectionWork::FastPathClose {
                    symbol: symbol.clone(),
                    position_side,
                    tranche_id: tranche.id,
                    mark,
                };
                if let Err(e) = self.work_tx.try_send(work) {
                    warn!(error = %e, "Fast-path work channel full, will retry next tick");
                    self.inflight.lock().remove(&key);
                }
            }
        }
    }

    fn overshoots(&self, position_side: PositionSide, mark: Price, tp: Price) -> bool {
        let eps = self.config.epsilon;
        match position_side {
            PositionSide::Short => {
                mark.inner() <= tp.inner() * (Decimal::ONE + eps)
            }
            _ => mark.inner() >= tp.inner() * (Decimal::ONE - eps),
        }
    }
}

/// Spawn the monitor loop over raw mark-price frames.
pub fn spawn_price_monitor(
    monitor: Arc<PriceMonitor>,
    mut frame_rx: mpsc::Receiver<String>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Price monitor started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Price monitor exiting");
                    return;
                }
                frame = frame_rx.recv() => {
                    let Some(frame) = frame else {
                        info!("Mark-price channel closed, monitor exiting");
                        return;
                    };
                    match parse_mark_price_frame(&frame) {
                        Ok(ticks) => {
                            for tick in ticks {
                                monitor.on_mark(&tick.symbol, tick.price);
                            }
                        }
                        Err(e) => debug!(error = %e, "Unparseable mark-price frame"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::tranche::TrancheConfig;
    use cascade_core::Qty;
    use cascade_store::SqliteStore;
    use rust_decimal_macros::dec;

    fn setup(enabled: bool) -> (Arc<TrancheBook>, Arc<PriceMonitor>, mpsc::Receiver<ProtectionWork>) {
        let book = Arc::new(TrancheBook::new(
            TrancheConfig::default(),
            Arc::new(SqliteStore::open_in_memory().unwrap()),
        ));
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
        let (work_tx, work_rx) = mpsc::channel(16);
        let monitor = Arc::new(PriceMonitor::new(
            MonitorConfig {
                enabled,
                epsilon: Decimal::ZERO,
            },
            book.clone(),
            breaker,
            work_tx,
            Arc::new(Mutex::new(HashSet::new())),
        ));
        (book, monitor, work_rx)
    }

    fn btc() -> Symbol {
        Symbol::new("BTCUSDT")
    }

    fn open_long_with_tp(book: &TrancheBook, tp: Decimal) {
        book.apply_entry_fill(&btc(), PositionSide::Long, Qty::new(dec!(0.02)), Price::new(dec!(59940)))
            .unwrap();
        book.set_protection(
            &btc(),
            PositionSide::Long,
            0,
            Some("201".into()),
            Some("202".into()),
            Some(Price::new(tp)),
            Some(Price::new(dec!(59340.6))),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_overshoot_triggers_close() {
        let (book, monitor, mut work_rx) = setup(true);
        open_long_with_tp(&book, dec!(61138.8));

        // Scenario: mark prints 61200 through the 61138.8 TP.
        monitor.on_mark(&btc(), Price::new(dec!(61200)));
        let work = work_rx.try_recv().unwrap();
        let ProtectionWork::FastPathClose {
            symbol, tranche_id, ..
        } = work
        else {
            panic!("expected fast-path close");
        };
        assert_eq!(symbol, btc());
        assert_eq!(tranche_id, 0);
    }

    #[tokio::test]
    async fn test_below_tp_does_not_trigger() {
        let (book, monitor, mut work_rx) = setup(true);
        open_long_with_tp(&book, dec!(61138.8));
        monitor.on_mark(&btc(), Price::new(dec!(61000)));
        assert!(work_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_double_fire_while_inflight() {
        let (book, monitor, mut work_rx) = setup(true);
        open_long_with_tp(&book, dec!(61138.8));
        monitor.on_mark(&btc(), Price::new(dec!(61200)));
        monitor.on_mark(&btc(), Price::new(dec!(61300)));
        assert!(work_rx.try_recv().is_ok());
        assert!(work_rx.try_recv().is_err(), "second tick must not re-fire");
    }

    #[tokio::test]
    async fn test_disabled_monitor_only_tracks_marks() {
        let (book, monitor, mut work_rx) = setup(false);
        open_long_with_tp(&book, dec!(61138.8));
        monitor.on_mark(&btc(), Price::new(dec!(61200)));
        assert!(work_rx.try_recv().is_err());
        assert_eq!(monitor.latest_mark(&btc()).unwrap().inner(), dec!(61200));
    }

    #[tokio::test]
    async fn test_short_overshoot_direction() {
        let (book, monitor, mut work_rx) = setup(true);
        book.apply_entry_fill(&btc(), PositionSide::Short, Qty::new(dec!(1)), Price::new(dec!(60000)))
            .unwrap();
        book.set_protection(
            &btc(),
            PositionSide::Short,
            0,
            Some("301".into()),
            None,
            Some(Price::new(dec!(58800))),
            None,
        )
        .unwrap();

        // Mark above the short TP: no trigger.
        monitor.on_mark(&btc(), Price::new(dec!(59000)));
        assert!(work_rx.try_recv().is_err());
        // Mark at/below TP: trigger.
        monitor.on_mark(&btc(), Price::new(dec!(58750)));
        assert!(work_rx.try_recv().is_ok());
    }
}
