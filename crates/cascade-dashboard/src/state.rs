//! The projection provider.

use crate::types::{EngineHealth, PositionDetail, PositionSummary, StreamHealth, TrancheView};
use cascade_core::{LiquidationEvent, OrderRecord, PositionSide, Symbol};
use cascade_governor::RateGovernor;
use cascade_position::{PriceMonitor, ProtectionWork, Tranche, TrancheBook};
use cascade_store::{Store, StoreResult};
use cascade_telemetry::EngineCounters;
use cascade_ws::StreamHandle;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Read-only query surface over the live engine.
pub struct EngineProjections {
    store: Arc<dyn Store>,
    book: Arc<TrancheBook>,
    monitor: Arc<PriceMonitor>,
    governor: Arc<RateGovernor>,
    counters: Arc<EngineCounters>,
    streams: Vec<(String, StreamHandle)>,
    protection_tx: mpsc::Sender<ProtectionWork>,
}

impl EngineProjections {
    pub fn new(
        store: Arc<dyn Store>,
        book: Arc<TrancheBook>,
        monitor: Arc<PriceMonitor>,
        governor: Arc<RateGovernor>,
        counters: Arc<EngineCounters>,
        streams: Vec<(String, StreamHandle)>,
        protection_tx: mpsc::Sender<ProtectionWork>,
    ) -> Self {
        Self {
            store,
            book,
            monitor,
            governor,
            counters,
            streams,
            protection_tx,
        }
    }

    fn tranche_view(tranche: &Tranche) -> TrancheView {
        TrancheView {
            tranche_id: tranche.id,
            avg_entry_price: tranche.avg_entry_price.inner(),
            quantity: tranche.quantity.inner(),
            notional: tranche.notional(),
            tp_order_id: tranche.tp_order_id.clone(),
            sl_order_id: tranche.sl_order_id.clone(),
            tp_price: tranche.tp_price.map(|p| p.inner()),
            sl_price: tranche.sl_price.map(|p| p.inner()),
            unprotected: tranche.unprotected,
            created_at_ms: tranche.created_at_ms,
        }
    }

    fn summarize(
        &self,
        symbol: &Symbol,
        position_side: PositionSide,
        tranches: &[Tranche],
    ) -> PositionSummary {
        let quantity: Decimal = tranches.iter().map(|t| t.quantity.inner()).sum();
        let notional: Decimal = tranches.iter().map(|t| t.notional()).sum();
        let avg_entry = if quantity.is_zero() {
            Decimal::ZERO
        } else {
            notional / quantity
        };
        let mark = self.monitor.latest_mark(symbol);
        let unrealized = mark.map(|m| {
            let raw = (m.inner() - avg_entry) * quantity;
            match position_side {
                PositionSide::Short => -raw,
                _ => raw,
            }
        });
        PositionSummary {
            symbol: symbol.clone(),
            position_side,
            quantity,
            avg_entry_price: avg_entry,
            notional,
            unrealized_pnl: unrealized,
            mark_price: mark.map(|m| m.inner()),
            tranche_count: tranches.len(),
        }
    }

    /// All open positions.
    pub fn list_positions(&self) -> Vec<PositionSummary> {
        self.book
            .keys()
            .into_iter()
            .map(|(symbol, side)| {
                let tranches = self.book.snapshot(&symbol, side);
                self.summarize(&symbol, side, &tranches)
            })
            .collect()
    }

    /// Drill-down on one position.
    pub fn position_detail(
        &self,
        symbol: &Symbol,
        position_side: PositionSide,
    ) -> StoreResult<PositionDetail> {
        let tranches = self.book.snapshot(symbol, position_side);
        let summary = self.summarize(symbol, position_side, &tranches);

        let mut companions: Vec<cascade_store::OrderRelationship> = Vec::new();
        let mut fill_order_ids = Vec::new();
        for tranche in &tranches {
            for id in [tranche.tp_order_id.as_ref(), tranche.sl_order_id.as_ref()]
                .into_iter()
                .flatten()
            {
                fill_order_ids.push(id.clone());
                if let Some(rel) = self.store.find_companions(id)? {
                    if !companions
                        .iter()
                        .any(|r| r.main_order_id == rel.main_order_id)
                    {
                        fill_order_ids.push(rel.main_order_id.clone());
                        companions.push(rel);
                    }
                }
            }
        }
        let recent_fills = self.store.recent_fills(&fill_order_ids, 50)?;

        Ok(PositionDetail {
            summary,
            tranches: tranches.iter().map(Self::tranche_view).collect(),
            companion_orders: companions,
            recent_fills,
        })
    }

    pub fn list_recent_liquidations(&self, limit: u32) -> StoreResult<Vec<LiquidationEvent>> {
        self.store.recent_liquidations(limit)
    }

    pub fn list_recent_trades(&self, limit: u32) -> StoreResult<Vec<OrderRecord>> {
        self.store.recent_orders(limit)
    }

    pub fn engine_health(&self) -> EngineHealth {
        let stats = self.governor.stats();
        let keys = self.book.keys();
        let live_tranches = keys
            .iter()
            .map(|(s, side)| self.book.snapshot(s, *side).len())
            .sum();
        EngineHealth {
            counters: self.counters.snapshot(),
            streams: self
                .streams
                .iter()
                .map(|(name, handle)| StreamHealth {
                    name: name.clone(),
                    connected: handle.is_connected(),
                    reconnects: handle.reconnect_count(),
                    last_frame_age_ms: handle.last_frame_age_ms(),
                })
                .collect(),
            rate_used_weight: stats.used_weight,
            rate_weight_limit: stats.weight_limit,
            rate_used_orders: stats.used_orders,
            rate_order_limit: stats.order_limit,
            rate_banned: stats.banned,
            open_positions: keys.len(),
            live_tranches,
        }
    }

    /// The dashboard's only write: flatten a position at market.
    pub async fn close_position(&self, symbol: Symbol, position_side: PositionSide) -> bool {
        info!(%symbol, %position_side, "Dashboard close_position requested");
        self.protection_tx
            .send(ProtectionWork::ClosePosition {
                symbol,
                position_side,
            })
            .await
            .is_ok()
    }
}
