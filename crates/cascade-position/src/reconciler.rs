//! Periodic consistency sweep against venue truth.
//!
//! The last-resort oracle: every other component may assume the reconciler
//! eventually repairs drift between the tranche book, the store, and the
//! venue (positions, protection legs, stale orders).

use crate::protection::ProtectionWork;
use crate::tranche::TrancheBook;
use cascade_core::{OrderKind, PositionSide, Price, Qty, Symbol, SymbolSettings};
use cascade_governor::Priority;
use cascade_store::Store;
use cascade_telemetry::EngineCounters;
use cascade_venue::VenueClient;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    /// Unfilled entry orders older than this are canceled.
    pub order_ttl: Duration,
    /// Open orders referenced by nothing and older than this are canceled.
    pub stale_order_age: Duration,
    /// I2 tolerance for tranche-sum vs venue position.
    pub qty_tolerance: Decimal,
    pub hedge_mode: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            order_ttl: Duration::from_secs(60),
            stale_order_age: Duration::from_secs(180),
            qty_tolerance: Decimal::ZERO,
            hedge_mode: true,
        }
    }
}

/// Counts of what a sweep touched, for logging and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub phantom_tranches_removed: usize,
    pub recovery_tranches_created: usize,
    pub tranches_trimmed: usize,
    pub protections_repaired: usize,
    pub stale_entries_canceled: usize,
    pub orphan_orders_canceled: usize,
}

pub struct Reconciler {
    config: ReconcilerConfig,
    venue: Arc<dyn VenueClient>,
    store: Arc<dyn Store>,
    book: Arc<TrancheBook>,
    symbols: HashMap<Symbol, SymbolSettings>,
    counters: Arc<EngineCounters>,
    protection_tx: mpsc::Sender<ProtectionWork>,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        venue: Arc<dyn VenueClient>,
        store: Arc<dyn Store>,
        book: Arc<TrancheBook>,
        symbols: HashMap<Symbol, SymbolSettings>,
        counters: Arc<EngineCounters>,
        protection_tx: mpsc::Sender<ProtectionWork>,
    ) -> Self {
        Self {
            config,
            venue,
            store,
            book,
            symbols,
            counters,
            protection_tx,
        }
    }

    /// Run one full sweep.
    pub async fn run_once(&self) -> crate::error::PositionResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        // Venue truth.
        let positions = self.venue.position_risk().await?;
        let mut venue_positions: HashMap<(Symbol, PositionSide), (Qty, Price)> = HashMap::new();
        for pos in &positions {
            if pos.position_amt.is_zero() {
                continue;
            }
            let side = if self.config.hedge_mode {
                pos.resolved_side()
            } else {
                PositionSide::Both
            };
            venue_positions.insert(
                (Symbol::new(&pos.symbol), side),
                (pos.abs_qty(), Price::new(pos.mark_price)),
            );
        }

        // I2: tranche sums vs venue quantities.
        let mut keys: HashSet<(Symbol, PositionSide)> = self.book.keys().into_iter().collect();
        keys.extend(venue_positions.keys().cloned());
        for (symbol, position_side) in keys {
            let book_qty = self.book.total_qty(&symbol, position_side);
            let (venue_qty, mark) = venue_positions
                .get(&(symbol.clone(), position_side))
                .copied()
                .unwrap_or((Qty::ZERO, Price::ZERO));
            let drift = venue_qty.inner() - book_qty.inner();

            if venue_qty.is_zero() && book_qty.is_positive() {
                // Phantom tranches: the venue has no position behind them.
                warn!(%symbol, %position_side, book_qty = %book_qty, "Phantom tranches, removing");
                for tranche in self.book.snapshot(&symbol, position_side) {
                    if let Some(removed) = self.book.remove(&symbol, position_side, tranche.id)? {
                        report.phantom_tranches_removed += 1;
                        let _ = self
                            .protection_tx
                            .send(ProtectionWork::CancelPair {
                                symbol: symbol.clone(),
                                tp_order_id: removed.tp_order_id,
                                sl_order_id: removed.sl_order_id,
                            })
                            .await;
                    }
                }
                continue;
            }

            if drift > self.config.qty_tolerance {
                // Venue holds more than the book: adopt the orphan slice.
                let tranche =
                    self.book
                        .adopt_recovery(&symbol, position_side, Qty::new(drift), mark)?;
                report.recovery_tranches_created += 1;
                let _ = self
                    .protection_tx
                    .send(ProtectionWork::Rebuild {
                        symbol: symbol.clone(),
                        position_side,
                        tranche_id: tranche.id,
                        main_order_id: None,
                    })
                    .await;
            } else if -drift > self.config.qty_tolerance {
                // Book holds more than the venue: trim newest-first.
                let mut excess = Qty::new(-drift);
                let mut tranches = self.book.snapshot(&symbol, position_side);
                tranches.reverse();
                for tranche in tranches {
                    if !excess.is_positive() {
                        break;
                    }
                    let take = if tranche.quantity.inner() <= excess.inner() {
                        tranche.quantity
                    } else {
                        excess
                    };
                    excess = excess.saturating_sub(take);
                    match self.book.reduce(&symbol, position_side, tranche.id, take)? {
                        crate::tranche::ReduceEffect::Closed { tranche } => {
                            report.tranches_trimmed += 1;
                            let _ = self
                                .protection_tx
                                .send(ProtectionWork::CancelPair {
                                    symbol: symbol.clone(),
                                    tp_order_id: tranche.tp_order_id,
                                    sl_order_id: tranche.sl_order_id,
                                })
                                .await;
                        }
                        crate::tranche::ReduceEffect::Reduced { tranche } => {
                            report.tranches_trimmed += 1;
                            let _ = self
                                .protection_tx
                                .send(ProtectionWork::Rebuild {
                                    symbol: symbol.clone(),
                                    position_side,
                                    tranche_id: tranche.id,
                                    main_order_id: None,
                                })
                                .await;
                        }
                    }
                }
                warn!(%symbol, %position_side, drift = %drift, "Trimmed tranches to venue position");
            }
        }

        // Missing or flagged protection.
        for (symbol, position_side) in self.book.keys() {
            let Some(settings) = self.symbols.get(&symbol) else {
                continue;
            };
            for tranche in self.book.snapshot(&symbol, position_side) {
                let tp_missing = settings.take_profit_enabled && tranche.tp_order_id.is_none();
                let sl_missing = settings.stop_loss_enabled && tranche.sl_order_id.is_none();
                if tranche.unprotected || tp_missing || sl_missing {
                    debug!(
                        %symbol,
                        tranche_id = tranche.id,
                        unprotected = tranche.unprotected,
                        tp_missing,
                        sl_missing,
                        "Repairing protection"
                    );
                    report.protections_repaired += 1;
                    let _ = self
                        .protection_tx
                        .send(ProtectionWork::Rebuild {
                            symbol: symbol.clone(),
                            position_side,
                            tranche_id: tranche.id,
                            main_order_id: None,
                        })
                        .await;
                }
            }
        }

        // Stale and orphaned open orders.
        let now_ms = chrono::Utc::now().timestamp_millis();
        let open_orders = self.venue.open_orders(None).await?;
        let mut referenced: HashSet<String> = HashSet::new();
        for (symbol, position_side) in self.book.keys() {
            for tranche in self.book.snapshot(&symbol, position_side) {
                referenced.extend(tranche.tp_order_id.clone());
                referenced.extend(tranche.sl_order_id.clone());
            }
        }

        for open in &open_orders {
            let order_id = open.order_id.to_string();
            let symbol = Symbol::new(&open.symbol);
            let age_ms = now_ms - open.time;

            let record = self.store.get_order(&order_id)?;
            let is_entry = record
                .as_ref()
                .map(|r| r.kind == OrderKind::Entry)
                .unwrap_or(false);

            if is_entry {
                let unfilled = record
                    .as_ref()
                    .map(|r| r.executed_qty.is_zero())
                    .unwrap_or(true);
                if unfilled && age_ms > self.config.order_ttl.as_millis() as i64 {
                    info!(%symbol, order_id, age_ms, "Canceling stale entry order");
                    if self
                        .venue
                        .cancel_order(&symbol, &order_id, Priority::Low)
                        .await
                        .is_ok()
                    {
                        report.stale_entries_canceled += 1;
                    }
                    // Companion legs of a dead entry go too.
                    if let Some(rel) = self.store.find_companions(&order_id)? {
                        let _ = self
                            .protection_tx
                            .send(ProtectionWork::CancelPair {
                                symbol: symbol.clone(),
                                tp_order_id: rel.tp_order_id,
                                sl_order_id: rel.sl_order_id,
                            })
                            .await;
                    }
                }
                continue;
            }

            if !referenced.contains(&order_id)
                && age_ms > self.config.stale_order_age.as_millis() as i64
            {
                info!(%symbol, order_id, age_ms, "Canceling orphaned order");
                if self
                    .venue
                    .cancel_order(&symbol, &order_id, Priority::Low)
                    .await
                    .is_ok()
                {
                    report.orphan_orders_canceled += 1;
                }
            }
        }

        if report != ReconcileReport::default() {
            let repairs = report.phantom_tranches_removed
                + report.recovery_tranches_created
                + report.tranches_trimmed
                + report.protections_repaired
                + report.stale_entries_canceled
                + report.orphan_orders_canceled;
            EngineCounters::add(&self.counters.reconcile_repairs, repairs as u64);
            info!(?report, "Reconcile sweep applied repairs");
        } else {
            debug!("Reconcile sweep clean");
        }
        Ok(report)
    }
}

/// Spawn the periodic sweep; `poke_rx` forces an immediate pass (account
/// drift, listen-key gaps).
pub fn spawn_reconciler(
    reconciler: Arc<Reconciler>,
    mut poke_rx: mpsc::Receiver<()>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(reconciler.config.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = reconciler.config.interval.as_secs(), "Reconciler started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Reconciler exiting");
                    return;
                }
                _ = tick.tick() => {}
                poke = poke_rx.recv() => {
                    if poke.is_none() {
                        info!("Poke channel closed, reconciler exiting");
                        return;
                    }
                    debug!("Reconcile poked");
                }
            }
            if let Err(e) = reconciler.run_once().await {
                warn!(error = %e, "Reconcile sweep failed");
            }
        }
    })
}
