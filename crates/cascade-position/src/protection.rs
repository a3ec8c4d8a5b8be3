//! Protection management: one TP and one SL per tranche.
//!
//! All protection mutation flows through a single work channel consumed by
//! one actor task, so operations for a given (symbol, position_side) are
//! serialized without the partitioner and the protection manager ever
//! calling into each other synchronously.

use crate::breaker::CircuitBreaker;
use crate::error::PositionResult;
use crate::tranche::{EntryFillEffect, ReduceEffect, Tranche, TrancheBook};
use cascade_core::{
    OrderKind, OrderRecord, OrderStatus, PositionSide, Price, Qty, Symbol, SymbolSettings,
    TimeInForce,
};
use cascade_feed::OrderUpdate;
use cascade_governor::Priority;
use cascade_store::{OrderRelationship, Store};
use cascade_telemetry::EngineCounters;
use cascade_venue::{NewOrder, OrderType, VenueClient, VenueError};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Protection manager configuration.
#[derive(Debug, Clone)]
pub struct ProtectionConfig {
    /// Use the batch endpoint when placing both legs.
    pub batch_enabled: bool,
    pub max_rebuild_attempts: u32,
    pub rebuild_backoff_ms: u64,
    /// Refuse new protection when a symbol/side already carries this many
    /// live stop orders (venue-side limit).
    pub max_stop_orders_per_symbol_side: usize,
    pub tp_time_in_force: TimeInForce,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            batch_enabled: true,
            max_rebuild_attempts: 3,
            rebuild_backoff_ms: 500,
            max_stop_orders_per_symbol_side: 8,
            tp_time_in_force: TimeInForce::Gtc,
        }
    }
}

/// Work items consumed by the protection actor.
#[derive(Debug)]
pub enum ProtectionWork {
    /// (Re)build both legs for a tranche against its current quantity and
    /// average entry.
    Rebuild {
        symbol: Symbol,
        position_side: PositionSide,
        tranche_id: u64,
        /// Entry order that triggered this rebuild, for the relationship
        /// table. None for resizes and reconciler repairs.
        main_order_id: Option<String>,
    },
    /// A TP or SL order filled.
    ProtectionFill { update: OrderUpdate, kind: OrderKind },
    /// Mark price overshot the TP: cancel the resting TP and market-reduce.
    FastPathClose {
        symbol: Symbol,
        position_side: PositionSide,
        tranche_id: u64,
        mark: Price,
    },
    /// Cancel a detached TP/SL pair (merged-away or phantom tranche).
    CancelPair {
        symbol: Symbol,
        tp_order_id: Option<String>,
        sl_order_id: Option<String>,
    },
    /// Dashboard command: flatten a whole position at market.
    ClosePosition {
        symbol: Symbol,
        position_side: PositionSide,
    },
}

pub struct ProtectionManager {
    config: ProtectionConfig,
    venue: Arc<dyn VenueClient>,
    store: Arc<dyn Store>,
    book: Arc<TrancheBook>,
    breaker: Arc<CircuitBreaker>,
    symbols: HashMap<Symbol, SymbolSettings>,
    counters: Arc<EngineCounters>,
    /// Tranches with an in-flight fast-path close; shared with the monitor
    /// to suppress duplicate triggers.
    inflight_closes: Arc<Mutex<HashSet<(Symbol, PositionSide, u64)>>>,
}

impl ProtectionManager {
    pub fn new(
        config: ProtectionConfig,
        venue: Arc<dyn VenueClient>,
        store: Arc<dyn Store>,
        book: Arc<TrancheBook>,
        breaker: Arc<CircuitBreaker>,
        symbols: HashMap<Symbol, SymbolSettings>,
        counters: Arc<EngineCounters>,
    ) -> Self {
        Self {
            config,
            venue,
            store,
            book,
            breaker,
            symbols,
            counters,
            inflight_closes: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn inflight_closes(&self) -> Arc<Mutex<HashSet<(Symbol, PositionSide, u64)>>> {
        self.inflight_closes.clone()
    }

    /// TP/SL trigger prices for a tranche, rounded away from entry so the
    /// realized protection is never looser than configured.
    pub fn protection_prices(
        settings: &SymbolSettings,
        position_side: PositionSide,
        avg_entry: Price,
        tick: Price,
    ) -> (Option<Price>, Option<Price>) {
        let tp = settings.take_profit_enabled.then(|| {
            let raw = match position_side {
                PositionSide::Short => avg_entry.offset_pct(-settings.take_profit_pct),
                _ => avg_entry.offset_pct(settings.take_profit_pct),
            };
            match position_side {
                PositionSide::Short => raw.floor_to_tick(tick),
                _ => raw.ceil_to_tick(tick),
            }
        });
        let sl = settings.stop_loss_enabled.then(|| {
            let raw = match position_side {
                PositionSide::Short => avg_entry.offset_pct(settings.stop_loss_pct),
                _ => avg_entry.offset_pct(-settings.stop_loss_pct),
            };
            match position_side {
                PositionSide::Short => raw.ceil_to_tick(tick),
                _ => raw.floor_to_tick(tick),
            }
        });
        (tp, sl)
    }

    /// Dispatch one work item.
    pub async fn handle(&self, work: ProtectionWork) {
        match work {
            ProtectionWork::Rebuild {
                symbol,
                position_side,
                tranche_id,
                main_order_id,
            } => {
                if let Err(e) = self
                    .rebuild(&symbol, position_side, tranche_id, main_order_id)
                    .await
                {
                    warn!(%symbol, %position_side, tranche_id, error = %e, "Rebuild failed");
                }
            }
            ProtectionWork::ProtectionFill { update, kind } => {
                if let Err(e) = self.on_protection_fill(&update, kind).await {
                    warn!(order_id = %update.order_id, error = %e, "Protection fill handling failed");
                }
            }
            ProtectionWork::FastPathClose {
                symbol,
                position_side,
                tranche_id,
                mark,
            } => {
                if let Err(e) = self
                    .fast_path_close(&symbol, position_side, tranche_id, mark)
                    .await
                {
                    warn!(%symbol, tranche_id, error = %e, "Fast-path close failed");
                }
            }
            ProtectionWork::CancelPair {
                symbol,
                tp_order_id,
                sl_order_id,
            } => {
                self.cancel_pair(&symbol, tp_order_id.as_deref(), sl_order_id.as_deref())
                    .await;
            }
            ProtectionWork::ClosePosition {
                symbol,
                position_side,
            } => {
                if let Err(e) = self.close_position(&symbol, position_side).await {
                    warn!(%symbol, %position_side, error = %e, "Close position failed");
                }
            }
        }
    }

    /// Derive the work items for an entry-fill effect.
    pub fn work_for_entry_effect(effect: &EntryFillEffect, main_order_id: &str) -> Vec<ProtectionWork> {
        match effect {
            EntryFillEffect::Absorbed { tranche } | EntryFillEffect::Created { tranche } => {
                vec![ProtectionWork::Rebuild {
                    symbol: tranche.symbol.clone(),
                    position_side: tranche.position_side,
                    tranche_id: tranche.id,
                    main_order_id: Some(main_order_id.to_string()),
                }]
            }
            EntryFillEffect::MergedAndCreated {
                merged_into,
                removed,
                created,
            } => vec![
                ProtectionWork::CancelPair {
                    symbol: removed.symbol.clone(),
                    tp_order_id: removed.tp_order_id.clone(),
                    sl_order_id: removed.sl_order_id.clone(),
                },
                ProtectionWork::Rebuild {
                    symbol: merged_into.symbol.clone(),
                    position_side: merged_into.position_side,
                    tranche_id: merged_into.id,
                    main_order_id: None,
                },
                ProtectionWork::Rebuild {
                    symbol: created.symbol.clone(),
                    position_side: created.position_side,
                    tranche_id: created.id,
                    main_order_id: Some(main_order_id.to_string()),
                },
            ],
        }
    }

    async fn rebuild(
        &self,
        symbol: &Symbol,
        position_side: PositionSide,
        tranche_id: u64,
        main_order_id: Option<String>,
    ) -> PositionResult<()> {
        if !self.breaker.allows(symbol, position_side, tranche_id) {
            debug!(%symbol, tranche_id, "Rebuild skipped: circuit open");
            return Ok(());
        }
        let Some(tranche) = self.book.get(symbol, position_side, tranche_id) else {
            debug!(%symbol, tranche_id, "Rebuild skipped: tranche gone");
            return Ok(());
        };
        let Some(settings) = self.symbols.get(symbol).cloned() else {
            return Ok(());
        };
        if !settings.take_profit_enabled && !settings.stop_loss_enabled {
            return Ok(());
        }

        // Venue-side stop-order cap.
        if let Ok(open) = self.venue.open_orders(Some(symbol)).await {
            let own: HashSet<&str> = [
                tranche.tp_order_id.as_deref(),
                tranche.sl_order_id.as_deref(),
            ]
            .into_iter()
            .flatten()
            .collect();
            let stop_count = open
                .iter()
                .filter(|o| o.is_stop_order())
                .filter(|o| position_side == PositionSide::Both || o.position_side == position_side)
                .filter(|o| !own.contains(o.order_id.to_string().as_str()))
                .count();
            if stop_count + 2 > self.config.max_stop_orders_per_symbol_side {
                warn!(
                    %symbol,
                    %position_side,
                    stop_count,
                    max = self.config.max_stop_orders_per_symbol_side,
                    "Stop-order cap reached, leaving tranche unprotected"
                );
                self.book.mark_unprotected(symbol, position_side, tranche_id);
                return Ok(());
            }
        }

        let spec = self.venue.symbol_spec(symbol).await?;
        let (tp_price, sl_price) = Self::protection_prices(
            &settings,
            position_side,
            tranche.avg_entry_price,
            spec.tick_size,
        );

        // Step 1: snapshot and cancel the old legs.
        self.cancel_pair(
            symbol,
            tranche.tp_order_id.as_deref(),
            tranche.sl_order_id.as_deref(),
        )
        .await;

        // Step 2-3: place the new legs, bounded retries.
        let qty = tranche.quantity.floor_to_step(spec.step_size);
        let reduce_side = position_side.reduce_side();
        let mut tp_order = tp_price.map(|price| NewOrder {
            symbol: symbol.clone(),
            side: reduce_side,
            position_side,
            order_type: OrderType::Limit,
            qty,
            price: Some(price),
            stop_price: None,
            time_in_force: Some(self.config.tp_time_in_force),
            reduce_only: true,
            working_type: None,
            price_protect: false,
            client_id: None,
        });
        let mut sl_order = sl_price.map(|price| NewOrder {
            symbol: symbol.clone(),
            side: reduce_side,
            position_side,
            order_type: OrderType::StopMarket,
            qty,
            price: None,
            stop_price: Some(price),
            time_in_force: None,
            reduce_only: true,
            working_type: Some(settings.working_type),
            price_protect: settings.price_protect,
            client_id: None,
        });

        let mut tp_id: Option<String> = None;
        let mut sl_id: Option<String> = None;
        let mut attempt = 0;
        loop {
            let outcome = self
                .place_legs(tp_order.as_ref(), sl_order.as_ref())
                .await;
            if let Some(id) = outcome.tp_id {
                tp_id = Some(id);
                tp_order = None;
            }
            if let Some(id) = outcome.sl_id {
                sl_id = Some(id);
                sl_order = None;
            }
            if tp_order.is_none() && sl_order.is_none() {
                break;
            }
            attempt += 1;
            if attempt >= self.config.max_rebuild_attempts {
                error!(
                    %symbol,
                    %position_side,
                    tranche_id,
                    attempts = attempt,
                    "Protection placement failed repeatedly, tranche unprotected"
                );
                EngineCounters::incr(&self.counters.protection_failures);
                self.breaker.record_failure(symbol, position_side, tranche_id);
                // Record whatever leg did go out, then flag the tranche
                // (the flag must survive the bookkeeping update).
                self.commit_protection(
                    &tranche, qty, tp_id, sl_id, tp_price, sl_price, main_order_id,
                )?;
                self.book.mark_unprotected(symbol, position_side, tranche_id);
                return Ok(());
            }
            let backoff = Duration::from_millis(self.config.rebuild_backoff_ms * (1 << attempt.min(4)));
            tokio::time::sleep(backoff).await;
        }

        // Step 4: atomically swap the order ids on the tranche.
        EngineCounters::incr(&self.counters.protection_rebuilds);
        self.breaker.record_success(symbol, position_side, tranche_id);
        self.commit_protection(&tranche, qty, tp_id, sl_id, tp_price, sl_price, main_order_id)?;
        info!(
            %symbol,
            %position_side,
            tranche_id,
            tp = ?tp_price.map(|p| p.to_string()),
            sl = ?sl_price.map(|p| p.to_string()),
            qty = %qty,
            "Protection rebuilt"
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn commit_protection(
        &self,
        tranche: &Tranche,
        qty: Qty,
        tp_id: Option<String>,
        sl_id: Option<String>,
        tp_price: Option<Price>,
        sl_price: Option<Price>,
        main_order_id: Option<String>,
    ) -> PositionResult<()> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let symbol = &tranche.symbol;

        self.book.set_protection(
            symbol,
            tranche.position_side,
            tranche.id,
            tp_id.clone(),
            sl_id.clone(),
            tp_price,
            sl_price,
        )?;

        for (id, kind, price, stop) in [
            (&tp_id, OrderKind::Tp, tp_price, None),
            (&sl_id, OrderKind::Sl, None, sl_price),
        ] {
            if let Some(id) = id {
                self.store.upsert_order(&OrderRecord {
                    order_id: id.clone(),
                    client_id: None,
                    symbol: symbol.clone(),
                    position_side: tranche.position_side,
                    side: tranche.position_side.reduce_side(),
                    kind,
                    qty,
                    price,
                    stop_price: stop,
                    status: OrderStatus::New,
                    tranche_id: Some(tranche.id),
                    parent_order_id: main_order_id.clone(),
                    placed_at_ms: now_ms,
                    final_at_ms: None,
                    executed_qty: Qty::ZERO,
                    avg_fill_price: None,
                    time_in_force: self.config.tp_time_in_force,
                })?;
            }
        }

        // Relationship row: prefer the triggering entry order; fall back to
        // the row that referenced the previous legs.
        let main = match main_order_id {
            Some(main) => Some(main),
            None => {
                let prev = tranche
                    .tp_order_id
                    .as_deref()
                    .or(tranche.sl_order_id.as_deref());
                match prev {
                    Some(prev_id) => self
                        .store
                        .find_companions(prev_id)?
                        .map(|rel| rel.main_order_id),
                    None => None,
                }
            }
        };
        if let Some(main) = main {
            self.store.insert_relationship(&OrderRelationship {
                main_order_id: main,
                tp_order_id: tp_id,
                sl_order_id: sl_id,
                tranche_id: tranche.id,
                created_at_ms: now_ms,
            })?;
        }
        Ok(())
    }

    async fn place_legs(
        &self,
        tp: Option<&NewOrder>,
        sl: Option<&NewOrder>,
    ) -> PlacedLegs {
        let mut placed = PlacedLegs::default();
        let orders: Vec<&NewOrder> = [tp, sl].into_iter().flatten().collect();
        if orders.is_empty() {
            return placed;
        }

        if self.config.batch_enabled && orders.len() == 2 {
            let owned: Vec<NewOrder> = orders.iter().map(|&o| o.clone()).collect();
            match self.venue.place_batch(&owned, Priority::Normal).await {
                Ok(results) => {
                    let mut iter = results.into_iter();
                    if tp.is_some() {
                        placed.tp_id = Self::leg_result("TP", iter.next());
                    }
                    if sl.is_some() {
                        placed.sl_id = Self::leg_result("SL", iter.next());
                    }
                }
                Err(e) => warn!(error = %e, "Batch protection placement failed"),
            }
            return placed;
        }

        if let Some(tp) = tp {
            match self.venue.place_order(tp, Priority::Normal).await {
                Ok(ack) => placed.tp_id = Some(ack.order_id_str()),
                Err(e) => warn!(error = %e, "TP placement failed"),
            }
        }
        if let Some(sl) = sl {
            match self.venue.place_order(sl, Priority::Normal).await {
                Ok(ack) => placed.sl_id = Some(ack.order_id_str()),
                Err(e) => warn!(error = %e, "SL placement failed"),
            }
        }
        placed
    }

    fn leg_result(
        leg: &str,
        result: Option<Result<cascade_venue::OrderAck, VenueError>>,
    ) -> Option<String> {
        match result {
            Some(Ok(ack)) => Some(ack.order_id_str()),
            Some(Err(e)) => {
                warn!(leg, error = %e, "Protection leg rejected");
                None
            }
            None => None,
        }
    }

    /// Cancel both legs; cancels of already-terminal orders are no-ops.
    async fn cancel_pair(&self, symbol: &Symbol, tp: Option<&str>, sl: Option<&str>) {
        for (leg, id) in [("TP", tp), ("SL", sl)] {
            if let Some(id) = id {
                match self.venue.cancel_order(symbol, id, Priority::Normal).await {
                    Ok(()) => debug!(%symbol, leg, id, "Canceled protection leg"),
                    Err(e) => warn!(%symbol, leg, id, error = %e, "Cancel failed"),
                }
            }
        }
    }

    /// A TP or SL filled: cancel the paired leg, then reduce the tranche.
    async fn on_protection_fill(&self, update: &OrderUpdate, kind: OrderKind) -> PositionResult<()> {
        let Some(tranche) = self.book.find_by_order(&update.order_id) else {
            debug!(order_id = %update.order_id, "Protection fill for unknown tranche");
            return Ok(());
        };
        let symbol = tranche.symbol.clone();
        let position_side = tranche.position_side;

        // Cancel the companion before the tranche disappears.
        let companion = match kind {
            OrderKind::Tp => tranche.sl_order_id.as_deref(),
            _ => tranche.tp_order_id.as_deref(),
        };
        if let Some(companion_id) = companion {
            match kind {
                OrderKind::Tp => self.cancel_pair(&symbol, None, Some(companion_id)).await,
                _ => self.cancel_pair(&symbol, Some(companion_id), None).await,
            }
        }

        match self
            .book
            .reduce(&symbol, position_side, tranche.id, update.filled_qty)?
        {
            ReduceEffect::Closed { tranche } => {
                info!(
                    %symbol,
                    %position_side,
                    tranche_id = tranche.id,
                    kind = %kind,
                    pnl = %update.realized_pnl,
                    "Tranche closed by protection fill"
                );
                self.breaker.forget(&symbol, position_side, tranche.id);
                self.inflight_closes
                    .lock()
                    .remove(&(symbol.clone(), position_side, tranche.id));
            }
            ReduceEffect::Reduced { tranche } => {
                // Rare: resize protection to the remaining quantity.
                self.rebuild(&symbol, position_side, tranche.id, None).await?;
                debug!(
                    %symbol,
                    tranche_id = tranche.id,
                    remaining = %tranche.quantity,
                    "Protection resized after partial fill"
                );
            }
        }
        Ok(())
    }

    /// Mark overshot the TP: cancel the resting TP, then market-reduce.
    async fn fast_path_close(
        &self,
        symbol: &Symbol,
        position_side: PositionSide,
        tranche_id: u64,
        mark: Price,
    ) -> PositionResult<()> {
        let release_inflight = || {
            self.inflight_closes
                .lock()
                .remove(&(symbol.clone(), position_side, tranche_id));
        };

        if !self.breaker.allows(symbol, position_side, tranche_id) {
            release_inflight();
            return Ok(());
        }
        let Some(tranche) = self.book.get(symbol, position_side, tranche_id) else {
            release_inflight();
            return Ok(());
        };

        warn!(
            %symbol,
            %position_side,
            tranche_id,
            mark = %mark,
            tp = ?tranche.tp_price.map(|p| p.to_string()),
            "Instant profit capture: closing tranche at market"
        );

        // Cancel the resting TP first; "already filled" is success, and if
        // the TP did fill, the fill event will clean up behind us.
        if let Some(tp_id) = tranche.tp_order_id.as_deref() {
            if let Err(e) = self.venue.cancel_order(symbol, tp_id, Priority::Critical).await {
                warn!(%symbol, tp_id, error = %e, "Fast-path TP cancel failed");
            }
        }

        let spec = self.venue.symbol_spec(symbol).await?;
        let qty = tranche.quantity.floor_to_step(spec.step_size);
        let order = NewOrder {
            symbol: symbol.clone(),
            side: position_side.reduce_side(),
            position_side,
            order_type: OrderType::Market,
            qty,
            price: None,
            stop_price: None,
            time_in_force: None,
            reduce_only: true,
            working_type: None,
            price_protect: false,
            client_id: None,
        };

        match self.venue.place_order(&order, Priority::Critical).await {
            Ok(ack) => {
                self.store.upsert_order(&OrderRecord {
                    order_id: ack.order_id_str(),
                    client_id: None,
                    symbol: symbol.clone(),
                    position_side,
                    side: order.side,
                    kind: OrderKind::Close,
                    qty,
                    price: None,
                    stop_price: None,
                    status: ack.status,
                    tranche_id: Some(tranche_id),
                    parent_order_id: None,
                    placed_at_ms: chrono::Utc::now().timestamp_millis(),
                    final_at_ms: None,
                    executed_qty: Qty::ZERO,
                    avg_fill_price: None,
                    time_in_force: TimeInForce::Gtc,
                })?;
                EngineCounters::incr(&self.counters.fast_path_closes);
                self.breaker.record_success(symbol, position_side, tranche_id);
                // Inflight marker stays until the fill removes the tranche.
                Ok(())
            }
            Err(VenueError::ReduceOnlyRejected)
            | Err(VenueError::InvalidParam { code: -1106, .. })
            | Err(VenueError::PositionNotFound) => {
                // Position is already gone: drop the tranche and its legs.
                warn!(%symbol, tranche_id, "Position gone, dropping tranche");
                self.cancel_pair(
                    symbol,
                    tranche.tp_order_id.as_deref(),
                    tranche.sl_order_id.as_deref(),
                )
                .await;
                self.book.remove(symbol, position_side, tranche_id)?;
                self.breaker.forget(symbol, position_side, tranche_id);
                release_inflight();
                Ok(())
            }
            Err(e) => {
                self.breaker.record_failure(symbol, position_side, tranche_id);
                release_inflight();
                Err(e.into())
            }
        }
    }

    /// Flatten a whole (symbol, position_side) at market.
    async fn close_position(
        &self,
        symbol: &Symbol,
        position_side: PositionSide,
    ) -> PositionResult<()> {
        let tranches = self.book.snapshot(symbol, position_side);
        if tranches.is_empty() {
            return Ok(());
        }
        let total: Qty = tranches
            .iter()
            .fold(Qty::ZERO, |acc, t| acc + t.quantity);
        info!(%symbol, %position_side, qty = %total, "Closing position at market");

        for t in &tranches {
            self.cancel_pair(symbol, t.tp_order_id.as_deref(), t.sl_order_id.as_deref())
                .await;
        }

        let spec = self.venue.symbol_spec(symbol).await?;
        let order = NewOrder {
            symbol: symbol.clone(),
            side: position_side.reduce_side(),
            position_side,
            order_type: OrderType::Market,
            qty: total.floor_to_step(spec.step_size),
            price: None,
            stop_price: None,
            time_in_force: None,
            reduce_only: true,
            working_type: None,
            price_protect: false,
            client_id: None,
        };
        let ack = self.venue.place_order(&order, Priority::Critical).await?;
        self.store.upsert_order(&OrderRecord {
            order_id: ack.order_id_str(),
            client_id: None,
            symbol: symbol.clone(),
            position_side,
            side: order.side,
            kind: OrderKind::Close,
            qty: order.qty,
            price: None,
            stop_price: None,
            status: ack.status,
            tranche_id: None,
            parent_order_id: None,
            placed_at_ms: chrono::Utc::now().timestamp_millis(),
            final_at_ms: None,
            executed_qty: Qty::ZERO,
            avg_fill_price: None,
            time_in_force: TimeInForce::Gtc,
        })?;
        Ok(())
    }
}

#[derive(Default)]
struct PlacedLegs {
    tp_id: Option<String>,
    sl_id: Option<String>,
}

/// Spawn the single-consumer protection actor.
pub fn spawn_protection_manager(
    manager: Arc<ProtectionManager>,
    mut work_rx: mpsc::Receiver<ProtectionWork>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Protection manager started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    // Drain whatever is already queued before exiting.
                    while let Ok(work) = work_rx.try_recv() {
                        manager.handle(work).await;
                    }
                    info!("Protection manager drained and exiting");
                    return;
                }
                work = work_rx.recv() => {
                    match work {
                        Some(work) => manager.handle(work).await,
                        None => {
                            info!("Protection channel closed");
                            return;
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::{Price, Qty};
    use rust_decimal_macros::dec;

    fn settings() -> SymbolSettings {
        SymbolSettings {
            take_profit_pct: dec!(2),
            stop_loss_pct: dec!(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_long_protection_prices() {
        let tick = Price::new(dec!(0.1));
        let (tp, sl) = ProtectionManager::protection_prices(
            &settings(),
            PositionSide::Long,
            Price::new(dec!(59940)),
            tick,
        );
        // 59940 * 1.02 = 61138.8; 59940 * 0.99 = 59340.6
        assert_eq!(tp.unwrap().inner(), dec!(61138.8));
        assert_eq!(sl.unwrap().inner(), dec!(59340.6));
    }

    #[test]
    fn test_short_protection_prices_inverted() {
        let tick = Price::new(dec!(0.1));
        let (tp, sl) = ProtectionManager::protection_prices(
            &settings(),
            PositionSide::Short,
            Price::new(dec!(60000)),
            tick,
        );
        // Short: TP below entry, SL above entry.
        assert_eq!(tp.unwrap().inner(), dec!(58800.0));
        assert_eq!(sl.unwrap().inner(), dec!(60600.0));
        assert!(tp.unwrap() < Price::new(dec!(60000)));
        assert!(sl.unwrap() > Price::new(dec!(60000)));
    }

    #[test]
    fn test_rounding_away_from_entry() {
        // Tick 1.0 forces visible rounding. Entry 100, tp 2% = 102 exact;
        // entry 100.3: tp 102.306 -> ceil 103 (long), sl 99.297 -> floor 99.
        let tick = Price::new(dec!(1));
        let (tp, sl) = ProtectionManager::protection_prices(
            &settings(),
            PositionSide::Long,
            Price::new(dec!(100.3)),
            tick,
        );
        assert_eq!(tp.unwrap().inner(), dec!(103));
        assert_eq!(sl.unwrap().inner(), dec!(99));

        let (tp, sl) = ProtectionManager::protection_prices(
            &settings(),
            PositionSide::Short,
            Price::new(dec!(100.3)),
            tick,
        );
        // Short TP 98.294 -> floor 98; SL 101.303 -> ceil 102.
        assert_eq!(tp.unwrap().inner(), dec!(98));
        assert_eq!(sl.unwrap().inner(), dec!(102));
    }

    #[test]
    fn test_disabled_legs_are_none() {
        let mut s = settings();
        s.take_profit_enabled = false;
        let (tp, sl) = ProtectionManager::protection_prices(
            &s,
            PositionSide::Long,
            Price::new(dec!(100)),
            Price::new(dec!(0.1)),
        );
        assert!(tp.is_none());
        assert!(sl.is_some());
    }

    #[test]
    fn test_work_for_entry_effects() {
        let tranche = Tranche {
            id: 3,
            symbol: Symbol::new("BTCUSDT"),
            position_side: PositionSide::Long,
            avg_entry_price: Price::new(dec!(60000)),
            quantity: Qty::new(dec!(1)),
            tp_order_id: Some("t".into()),
            sl_order_id: Some("s".into()),
            tp_price: None,
            sl_price: None,
            unprotected: false,
            created_at_ms: 0,
            updated_at_ms: 0,
        };
        let work = ProtectionManager::work_for_entry_effect(
            &EntryFillEffect::Absorbed {
                tranche: tranche.clone(),
            },
            "100",
        );
        assert_eq!(work.len(), 1);
        assert!(matches!(
            &work[0],
            ProtectionWork::Rebuild { tranche_id: 3, .. }
        ));

        let mut removed = tranche.clone();
        removed.id = 1;
        let mut created = tranche.clone();
        created.id = 4;
        let work = ProtectionManager::work_for_entry_effect(
            &EntryFillEffect::MergedAndCreated {
                merged_into: tranche,
                removed,
                created,
            },
            "100",
        );
        assert_eq!(work.len(), 3);
        assert!(matches!(&work[0], ProtectionWork::CancelPair { .. }));
    }
}
