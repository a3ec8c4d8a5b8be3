//! Persisted row types shared between the store and its consumers.

use cascade_core::{PositionSide, Price, Qty, Symbol};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A persisted tranche.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrancheRow {
    pub symbol: Symbol,
    pub position_side: PositionSide,
    pub tranche_id: u64,
    pub avg_entry_price: Price,
    pub quantity: Qty,
    pub tp_order_id: Option<String>,
    pub sl_order_id: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// The authoritative mapping between an entry order and its protection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRelationship {
    pub main_order_id: String,
    pub tp_order_id: Option<String>,
    pub sl_order_id: Option<String>,
    pub tranche_id: u64,
    pub created_at_ms: i64,
}

/// A single fill against an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillRow {
    pub order_id: String,
    /// Venue trade id; orders the fills within an order.
    pub seq: i64,
    pub qty: Qty,
    pub price: Price,
    pub time_ms: i64,
    pub commission: Decimal,
}
