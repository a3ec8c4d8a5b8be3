//! The `Store` abstraction.

use crate::error::StoreResult;
use crate::records::{FillRow, OrderRelationship, TrancheRow};
use cascade_core::{
    LiquidationEvent, OrderRecord, OrderStatus, PositionSide, Price, Qty, Side, Symbol,
};
use rust_decimal::Decimal;

/// Durable persistence operations used by the engine.
///
/// Implemented by [`SqliteStore`](crate::SqliteStore) in production; tests
/// may use an in-memory SQLite database or their own fake.
pub trait Store: Send + Sync {
    /// Insert a liquidation event. Idempotent on `event_id`; returns
    /// `false` when the event was already present.
    fn insert_liquidation(&self, event: &LiquidationEvent) -> StoreResult<bool>;

    /// Sum of `usdt_value` for `(symbol, side)` with `event_time >= since_ms`.
    fn sum_usdt_volume(&self, symbol: &Symbol, side: Side, since_ms: i64) -> StoreResult<Decimal>;

    /// Liquidations newer than `since_ms`, oldest first. Used to rebuild
    /// the window aggregator on startup.
    fn liquidations_since(&self, since_ms: i64) -> StoreResult<Vec<LiquidationEvent>>;

    fn recent_liquidations(&self, limit: u32) -> StoreResult<Vec<LiquidationEvent>>;

    fn upsert_order(&self, order: &OrderRecord) -> StoreResult<()>;

    fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        executed_qty: Qty,
        avg_fill_price: Option<Price>,
        final_at_ms: Option<i64>,
    ) -> StoreResult<()>;

    fn get_order(&self, order_id: &str) -> StoreResult<Option<OrderRecord>>;

    /// Non-terminal entry orders for a symbol.
    fn open_entry_orders(&self, symbol: &Symbol) -> StoreResult<Vec<OrderRecord>>;

    fn recent_orders(&self, limit: u32) -> StoreResult<Vec<OrderRecord>>;

    fn create_tranche(&self, tranche: &TrancheRow) -> StoreResult<()>;

    fn update_tranche(&self, tranche: &TrancheRow) -> StoreResult<()>;

    fn delete_tranche(
        &self,
        symbol: &Symbol,
        position_side: PositionSide,
        tranche_id: u64,
    ) -> StoreResult<()>;

    fn list_tranches(
        &self,
        symbol: &Symbol,
        position_side: PositionSide,
    ) -> StoreResult<Vec<TrancheRow>>;

    /// Every persisted tranche with quantity > 0, across all keys.
    fn list_all_tranches(&self) -> StoreResult<Vec<TrancheRow>>;

    fn insert_relationship(&self, rel: &OrderRelationship) -> StoreResult<()>;

    /// Find the relationship row that references `order_id` in any leg.
    fn find_companions(&self, order_id: &str) -> StoreResult<Option<OrderRelationship>>;

    fn insert_fill(&self, fill: &FillRow) -> StoreResult<()>;

    fn recent_fills(&self, order_ids: &[String], limit: u32) -> StoreResult<Vec<FillRow>>;
}
