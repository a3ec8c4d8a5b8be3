//! Projection DTOs.

use cascade_core::{PositionSide, Symbol};
use cascade_store::{FillRow, OrderRelationship};
use cascade_telemetry::CounterSnapshot;
use rust_decimal::Decimal;
use serde::Serialize;

/// One tranche as shown to the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct TrancheView {
    pub tranche_id: u64,
    pub avg_entry_price: Decimal,
    pub quantity: Decimal,
    pub notional: Decimal,
    pub tp_order_id: Option<String>,
    pub sl_order_id: Option<String>,
    pub tp_price: Option<Decimal>,
    pub sl_price: Option<Decimal>,
    pub unprotected: bool,
    pub created_at_ms: i64,
}

/// Aggregate view of one (symbol, position_side).
#[derive(Debug, Clone, Serialize)]
pub struct PositionSummary {
    pub symbol: Symbol,
    pub position_side: PositionSide,
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
    pub notional: Decimal,
    pub unrealized_pnl: Option<Decimal>,
    pub mark_price: Option<Decimal>,
    pub tranche_count: usize,
}

/// Full position drill-down.
#[derive(Debug, Clone, Serialize)]
pub struct PositionDetail {
    pub summary: PositionSummary,
    pub tranches: Vec<TrancheView>,
    pub companion_orders: Vec<OrderRelationship>,
    pub recent_fills: Vec<FillRow>,
}

/// Per-stream connectivity.
#[derive(Debug, Clone, Serialize)]
pub struct StreamHealth {
    pub name: String,
    pub connected: bool,
    pub reconnects: u64,
    pub last_frame_age_ms: Option<u64>,
}

/// Engine health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub counters: CounterSnapshot,
    pub streams: Vec<StreamHealth>,
    pub rate_used_weight: u32,
    pub rate_weight_limit: u32,
    pub rate_used_orders: u32,
    pub rate_order_limit: u32,
    pub rate_banned: bool,
    pub open_positions: usize,
    pub live_tranches: usize,
}

