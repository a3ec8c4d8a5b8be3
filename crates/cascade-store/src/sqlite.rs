//! SQLite-backed store implementation.

use crate::error::{StoreError, StoreResult};
use crate::records::{FillRow, OrderRelationship, TrancheRow};
use crate::schema::init_schema;
use crate::store::Store;
use cascade_core::{
    ClientOrderId, LiquidationEvent, OrderKind, OrderRecord, OrderStatus, PositionSide, Price,
    Qty, Side, Symbol, TimeInForce,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

const BUSY_RETRIES: u32 = 5;

/// SQLite store. A single pooled connection guarded by a mutex; every
/// operation is a short transaction, so writers never hold the lock long.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_millis(250))?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests and simulation runs.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run an operation, retrying on busy with short backoff.
    fn with_conn<T>(&self, f: impl Fn(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let mut delay = Duration::from_millis(10);
        for attempt in 0..=BUSY_RETRIES {
            let result = {
                let conn = self.conn.lock();
                f(&conn)
            };
            match result {
                Err(StoreError::Busy) if attempt < BUSY_RETRIES => {
                    debug!(attempt, "Store busy, retrying");
                    std::thread::sleep(delay);
                    delay *= 2;
                }
                other => return other,
            }
        }
        Err(StoreError::Busy)
    }
}

fn dec(s: &str) -> StoreResult<Decimal> {
    Decimal::from_str(s).map_err(|e| StoreError::Corrupt(format!("decimal {s:?}: {e}")))
}

fn parse_side(s: &str) -> StoreResult<Side> {
    match s {
        "BUY" => Ok(Side::Buy),
        "SELL" => Ok(Side::Sell),
        _ => Err(StoreError::Corrupt(format!("side {s:?}"))),
    }
}

fn parse_position_side(s: &str) -> StoreResult<PositionSide> {
    match s {
        "LONG" => Ok(PositionSide::Long),
        "SHORT" => Ok(PositionSide::Short),
        "BOTH" => Ok(PositionSide::Both),
        _ => Err(StoreError::Corrupt(format!("position side {s:?}"))),
    }
}

fn parse_status(s: &str) -> StoreResult<OrderStatus> {
    match s {
        "NEW" => Ok(OrderStatus::New),
        "PARTIALLY_FILLED" => Ok(OrderStatus::PartiallyFilled),
        "FILLED" => Ok(OrderStatus::Filled),
        "CANCELED" => Ok(OrderStatus::Canceled),
        "EXPIRED" => Ok(OrderStatus::Expired),
        "REJECTED" => Ok(OrderStatus::Rejected),
        "SIMULATED" => Ok(OrderStatus::Simulated),
        _ => Err(StoreError::Corrupt(format!("status {s:?}"))),
    }
}

fn parse_kind(s: &str) -> StoreResult<OrderKind> {
    match s {
        "ENTRY" => Ok(OrderKind::Entry),
        "TP" => Ok(OrderKind::Tp),
        "SL" => Ok(OrderKind::Sl),
        "CLOSE" => Ok(OrderKind::Close),
        _ => Err(StoreError::Corrupt(format!("kind {s:?}"))),
    }
}

fn parse_tif(s: &str) -> StoreResult<TimeInForce> {
    match s {
        "GTC" => Ok(TimeInForce::Gtc),
        "IOC" => Ok(TimeInForce::Ioc),
        "FOK" => Ok(TimeInForce::Fok),
        _ => Err(StoreError::Corrupt(format!("time in force {s:?}"))),
    }
}

fn liquidation_from_row(row: &Row) -> rusqlite::Result<(String, String, String, String, String, String, i64, i64)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn build_liquidation(
    raw: (String, String, String, String, String, String, i64, i64),
) -> StoreResult<LiquidationEvent> {
    let (event_id, symbol, side, qty, price, usdt_value, event_time, received_time) = raw;
    Ok(LiquidationEvent {
        event_id,
        symbol: Symbol::new(symbol),
        liquidated_side: parse_side(&side)?,
        qty: Qty::new(dec(&qty)?),
        price: Price::new(dec(&price)?),
        usdt_value: dec(&usdt_value)?,
        event_time_ms: event_time,
        received_time_ms: received_time,
    })
}

type OrderRaw = (
    String,
    Option<String>,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    Option<i64>,
    Option<String>,
    i64,
    Option<i64>,
    String,
    Option<String>,
    String,
);

fn order_from_row(row: &Row) -> rusqlite::Result<OrderRaw> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
        row.get(14)?,
        row.get(15)?,
        row.get(16)?,
    ))
}

fn build_order(raw: OrderRaw) -> StoreResult<OrderRecord> {
    let (
        order_id,
        client_id,
        symbol,
        position_side,
        kind,
        side,
        qty,
        price,
        stop_price,
        status,
        tranche_id,
        parent_order_id,
        placed_at,
        final_at,
        executed_qty,
        avg_fill_price,
        time_in_force,
    ) = raw;
    Ok(OrderRecord {
        order_id,
        client_id: client_id.map(ClientOrderId::from_string),
        symbol: Symbol::new(symbol),
        position_side: parse_position_side(&position_side)?,
        side: parse_side(&side)?,
        kind: parse_kind(&kind)?,
        qty: Qty::new(dec(&qty)?),
        price: price.as_deref().map(dec).transpose()?.map(Price::new),
        stop_price: stop_price.as_deref().map(dec).transpose()?.map(Price::new),
        status: parse_status(&status)?,
        tranche_id: tranche_id.map(|t| t as u64),
        parent_order_id,
        placed_at_ms: placed_at,
        final_at_ms: final_at,
        executed_qty: Qty::new(dec(&executed_qty)?),
        avg_fill_price: avg_fill_price.as_deref().map(dec).transpose()?.map(Price::new),
        time_in_force: parse_tif(&time_in_force)?,
    })
}

const ORDER_COLUMNS: &str = "order_id, client_id, symbol, position_side, kind, side, qty, price, \
                             stop_price, status, tranche_id, parent_order_id, placed_at, final_at, \
                             executed_qty, avg_fill_price, time_in_force";

type TrancheRaw = (String, String, i64, String, String, Option<String>, Option<String>, i64, i64);

fn tranche_from_row(row: &Row) -> rusqlite::Result<TrancheRaw> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn build_tranche(raw: TrancheRaw) -> StoreResult<TrancheRow> {
    let (symbol, position_side, tranche_id, avg_entry, quantity, tp, sl, created, updated) = raw;
    Ok(TrancheRow {
        symbol: Symbol::new(symbol),
        position_side: parse_position_side(&position_side)?,
        tranche_id: tranche_id as u64,
        avg_entry_price: Price::new(dec(&avg_entry)?),
        quantity: Qty::new(dec(&quantity)?),
        tp_order_id: tp,
        sl_order_id: sl,
        created_at_ms: created,
        updated_at_ms: updated,
    })
}

impl Store for SqliteStore {
    fn insert_liquidation(&self, event: &LiquidationEvent) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO liquidations
                 (event_id, symbol, side, qty, price, usdt_value, event_time, received_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    event.event_id,
                    event.symbol.as_str(),
                    event.liquidated_side.to_string(),
                    event.qty.to_string(),
                    event.price.to_string(),
                    event.usdt_value.to_string(),
                    event.event_time_ms,
                    event.received_time_ms,
                ],
            )?;
            Ok(inserted > 0)
        })
    }

    fn sum_usdt_volume(&self, symbol: &Symbol, side: Side, since_ms: i64) -> StoreResult<Decimal> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT usdt_value FROM liquidations
                 WHERE symbol = ?1 AND side = ?2 AND event_time >= ?3",
            )?;
            let rows = stmt.query_map(
                params![symbol.as_str(), side.to_string(), since_ms],
                |row| row.get::<_, String>(0),
            )?;
            let mut total = Decimal::ZERO;
            for value in rows {
                total += dec(&value?)?;
            }
            Ok(total)
        })
    }

    fn liquidations_since(&self, since_ms: i64) -> StoreResult<Vec<LiquidationEvent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT event_id, symbol, side, qty, price, usdt_value, event_time, received_time
                 FROM liquidations WHERE event_time >= ?1 ORDER BY event_time ASC",
            )?;
            let rows = stmt.query_map(params![since_ms], liquidation_from_row)?;
            rows.map(|r| build_liquidation(r?)).collect()
        })
    }

    fn recent_liquidations(&self, limit: u32) -> StoreResult<Vec<LiquidationEvent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT event_id, symbol, side, qty, price, usdt_value, event_time, received_time
                 FROM liquidations ORDER BY event_time DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], liquidation_from_row)?;
            rows.map(|r| build_liquidation(r?)).collect()
        })
    }

    fn upsert_order(&self, order: &OrderRecord) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO orders (order_id, client_id, symbol, position_side, kind, side, qty,
                                     price, stop_price, status, tranche_id, parent_order_id,
                                     placed_at, final_at, executed_qty, avg_fill_price, time_in_force)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                 ON CONFLICT(order_id) DO UPDATE SET
                     status = excluded.status,
                     tranche_id = excluded.tranche_id,
                     final_at = excluded.final_at,
                     executed_qty = excluded.executed_qty,
                     avg_fill_price = excluded.avg_fill_price",
                params![
                    order.order_id,
                    order.client_id.as_ref().map(|c| c.to_string()),
                    order.symbol.as_str(),
                    order.position_side.to_string(),
                    order.kind.to_string(),
                    order.side.to_string(),
                    order.qty.to_string(),
                    order.price.map(|p| p.to_string()),
                    order.stop_price.map(|p| p.to_string()),
                    order.status.to_string(),
                    order.tranche_id.map(|t| t as i64),
                    order.parent_order_id,
                    order.placed_at_ms,
                    order.final_at_ms,
                    order.executed_qty.to_string(),
                    order.avg_fill_price.map(|p| p.to_string()),
                    order.time_in_force.to_string(),
                ],
            )?;
            Ok(())
        })
    }

    fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        executed_qty: Qty,
        avg_fill_price: Option<Price>,
        final_at_ms: Option<i64>,
    ) -> StoreResult<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE orders SET status = ?2, executed_qty = ?3, avg_fill_price = ?4,
                                   final_at = COALESCE(?5, final_at)
                 WHERE order_id = ?1",
                params![
                    order_id,
                    status.to_string(),
                    executed_qty.to_string(),
                    avg_fill_price.map(|p| p.to_string()),
                    final_at_ms,
                ],
            )?;
            if updated == 0 {
                warn!(order_id, %status, "Status update for unknown order");
            }
            Ok(())
        })
    }

    fn get_order(&self, order_id: &str) -> StoreResult<Option<OrderRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {ORDER_COLUMNS} FROM orders WHERE order_id = ?1"
            ))?;
            let raw = stmt
                .query_row(params![order_id], order_from_row)
                .optional()?;
            raw.map(build_order).transpose()
        })
    }

    fn open_entry_orders(&self, symbol: &Symbol) -> StoreResult<Vec<OrderRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {ORDER_COLUMNS} FROM orders
                 WHERE symbol = ?1 AND kind = 'ENTRY'
                   AND status IN ('NEW', 'PARTIALLY_FILLED')
                 ORDER BY placed_at ASC"
            ))?;
            let rows = stmt.query_map(params![symbol.as_str()], order_from_row)?;
            rows.map(|r| build_order(r?)).collect()
        })
    }

    fn recent_orders(&self, limit: u32) -> StoreResult<Vec<OrderRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {ORDER_COLUMNS} FROM orders ORDER BY placed_at DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit], order_from_row)?;
            rows.map(|r| build_order(r?)).collect()
        })
    }

    fn create_tranche(&self, tranche: &TrancheRow) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tranches (symbol, position_side, tranche_id, avg_entry_price,
                                       quantity, tp_order_id, sl_order_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    tranche.symbol.as_str(),
                    tranche.position_side.to_string(),
                    tranche.tranche_id as i64,
                    tranche.avg_entry_price.to_string(),
                    tranche.quantity.to_string(),
                    tranche.tp_order_id,
                    tranche.sl_order_id,
                    tranche.created_at_ms,
                    tranche.updated_at_ms,
                ],
            )?;
            Ok(())
        })
    }

    fn update_tranche(&self, tranche: &TrancheRow) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tranches SET avg_entry_price = ?4, quantity = ?5,
                                     tp_order_id = ?6, sl_order_id = ?7, updated_at = ?8
                 WHERE symbol = ?1 AND position_side = ?2 AND tranche_id = ?3",
                params![
                    tranche.symbol.as_str(),
                    tranche.position_side.to_string(),
                    tranche.tranche_id as i64,
                    tranche.avg_entry_price.to_string(),
                    tranche.quantity.to_string(),
                    tranche.tp_order_id,
                    tranche.sl_order_id,
                    tranche.updated_at_ms,
                ],
            )?;
            Ok(())
        })
    }

    fn delete_tranche(
        &self,
        symbol: &Symbol,
        position_side: PositionSide,
        tranche_id: u64,
    ) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM tranches
                 WHERE symbol = ?1 AND position_side = ?2 AND tranche_id = ?3",
                params![symbol.as_str(), position_side.to_string(), tranche_id as i64],
            )?;
            Ok(())
        })
    }

    fn list_tranches(
        &self,
        symbol: &Symbol,
        position_side: PositionSide,
    ) -> StoreResult<Vec<TrancheRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT symbol, position_side, tranche_id, avg_entry_price, quantity,
                        tp_order_id, sl_order_id, created_at, updated_at
                 FROM tranches WHERE symbol = ?1 AND position_side = ?2
                 ORDER BY tranche_id ASC",
            )?;
            let rows = stmt.query_map(
                params![symbol.as_str(), position_side.to_string()],
                tranche_from_row,
            )?;
            rows.map(|r| build_tranche(r?)).collect()
        })
    }

    fn list_all_tranches(&self) -> StoreResult<Vec<TrancheRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT symbol, position_side, tranche_id, avg_entry_price, quantity,
                        tp_order_id, sl_order_id, created_at, updated_at
                 FROM tranches WHERE CAST(quantity AS REAL) > 0
                 ORDER BY symbol, position_side, tranche_id",
            )?;
            let rows = stmt.query_map([], tranche_from_row)?;
            rows.map(|r| build_tranche(r?)).collect()
        })
    }

    fn insert_relationship(&self, rel: &OrderRelationship) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO order_relationships
                 (main_order_id, tp_order_id, sl_order_id, tranche_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(main_order_id) DO UPDATE SET
                     tp_order_id = COALESCE(excluded.tp_order_id, tp_order_id),
                     sl_order_id = COALESCE(excluded.sl_order_id, sl_order_id)",
                params![
                    rel.main_order_id,
                    rel.tp_order_id,
                    rel.sl_order_id,
                    rel.tranche_id as i64,
                    rel.created_at_ms,
                ],
            )?;
            Ok(())
        })
    }

    fn find_companions(&self, order_id: &str) -> StoreResult<Option<OrderRelationship>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT main_order_id, tp_order_id, sl_order_id, tranche_id, created_at
                 FROM order_relationships
                 WHERE main_order_id = ?1 OR tp_order_id = ?1 OR sl_order_id = ?1",
            )?;
            let raw = stmt
                .query_row(params![order_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                })
                .optional()?;
            Ok(raw.map(|(main, tp, sl, tranche, created)| OrderRelationship {
                main_order_id: main,
                tp_order_id: tp,
                sl_order_id: sl,
                tranche_id: tranche as u64,
                created_at_ms: created,
            }))
        })
    }

    fn insert_fill(&self, fill: &FillRow) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO fills (order_id, seq, qty, price, time, commission)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    fill.order_id,
                    fill.seq,
                    fill.qty.to_string(),
                    fill.price.to_string(),
                    fill.time_ms,
                    fill.commission.to_string(),
                ],
            )?;
            Ok(())
        })
    }

    fn recent_fills(&self, order_ids: &[String], limit: u32) -> StoreResult<Vec<FillRow>> {
        if order_ids.is_empty() {
            return Ok(vec![]);
        }
        self.with_conn(|conn| {
            let placeholders = std::iter::repeat("?")
                .take(order_ids.len())
                .collect::<Vec<_>>()
                .join(",");
            let sql = format!(
                "SELECT order_id, seq, qty, price, time, commission FROM fills
                 WHERE order_id IN ({placeholders}) ORDER BY time DESC LIMIT {limit}"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params_from_iter(order_ids.iter()),
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )?;
            rows.map(|r| {
                let (order_id, seq, qty, price, time, commission) = r?;
                Ok(FillRow {
                    order_id,
                    seq,
                    qty: Qty::new(dec(&qty)?),
                    price: Price::new(dec(&price)?),
                    time_ms: time,
                    commission: dec(&commission)?,
                })
            })
            .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec as d;

    fn event(symbol: &str, side: Side, qty: &str, price: &str, time: i64) -> LiquidationEvent {
        LiquidationEvent::new(
            Symbol::new(symbol),
            side,
            Qty::new(Decimal::from_str(qty).unwrap()),
            Price::new(Decimal::from_str(price).unwrap()),
            time,
            time + 20,
        )
    }

    fn entry_order(order_id: &str, symbol: &str) -> OrderRecord {
        OrderRecord {
            order_id: order_id.into(),
            client_id: Some(ClientOrderId::new()),
            symbol: Symbol::new(symbol),
            position_side: PositionSide::Long,
            side: Side::Buy,
            kind: OrderKind::Entry,
            qty: Qty::new(d!(0.02)),
            price: Some(Price::new(d!(59940))),
            stop_price: None,
            status: OrderStatus::New,
            tranche_id: Some(0),
            parent_order_id: None,
            placed_at_ms: 1_700_000_000_000,
            final_at_ms: None,
            executed_qty: Qty::ZERO,
            avg_fill_price: None,
            time_in_force: TimeInForce::Gtc,
        }
    }

    #[test]
    fn test_insert_liquidation_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let e = event("BTCUSDT", Side::Buy, "2", "60000", 1_700_000_000_000);
        assert!(store.insert_liquidation(&e).unwrap());
        assert!(!store.insert_liquidation(&e).unwrap());
        assert_eq!(store.recent_liquidations(10).unwrap().len(), 1);
    }

    #[test]
    fn test_sum_usdt_volume_windowed() {
        let store = SqliteStore::open_in_memory().unwrap();
        let base = 1_700_000_000_000;
        store
            .insert_liquidation(&event("BTCUSDT", Side::Buy, "1", "60000", base))
            .unwrap();
        store
            .insert_liquidation(&event("BTCUSDT", Side::Buy, "1", "60000", base + 1000))
            .unwrap();
        // Different side and different symbol must not count.
        store
            .insert_liquidation(&event("BTCUSDT", Side::Sell, "1", "60000", base + 1000))
            .unwrap();
        store
            .insert_liquidation(&event("ETHUSDT", Side::Buy, "1", "3000", base + 1000))
            .unwrap();

        let sum = store
            .sum_usdt_volume(&Symbol::new("BTCUSDT"), Side::Buy, base)
            .unwrap();
        assert_eq!(sum, d!(120000));

        // Window excludes the first event.
        let sum = store
            .sum_usdt_volume(&Symbol::new("BTCUSDT"), Side::Buy, base + 500)
            .unwrap();
        assert_eq!(sum, d!(60000));
    }

    #[test]
    fn test_order_upsert_and_status_update() {
        let store = SqliteStore::open_in_memory().unwrap();
        let order = entry_order("101", "BTCUSDT");
        store.upsert_order(&order).unwrap();

        store
            .update_order_status(
                "101",
                OrderStatus::Filled,
                Qty::new(d!(0.02)),
                Some(Price::new(d!(60000))),
                Some(1_700_000_001_000),
            )
            .unwrap();

        let loaded = store.get_order("101").unwrap().unwrap();
        assert_eq!(loaded.status, OrderStatus::Filled);
        assert_eq!(loaded.executed_qty.inner(), d!(0.02));
        assert_eq!(loaded.avg_fill_price.unwrap().inner(), d!(60000));
        assert_eq!(loaded.final_at_ms, Some(1_700_000_001_000));
    }

    #[test]
    fn test_open_entry_orders_excludes_terminal() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_order(&entry_order("1", "BTCUSDT")).unwrap();
        let mut filled = entry_order("2", "BTCUSDT");
        filled.status = OrderStatus::Filled;
        store.upsert_order(&filled).unwrap();
        let mut tp = entry_order("3", "BTCUSDT");
        tp.kind = OrderKind::Tp;
        store.upsert_order(&tp).unwrap();

        let open = store.open_entry_orders(&Symbol::new("BTCUSDT")).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].order_id, "1");
    }

    #[test]
    fn test_tranche_crud() {
        let store = SqliteStore::open_in_memory().unwrap();
        let symbol = Symbol::new("BTCUSDT");
        let mut row = TrancheRow {
            symbol: symbol.clone(),
            position_side: PositionSide::Long,
            tranche_id: 0,
            avg_entry_price: Price::new(d!(60000)),
            quantity: Qty::new(d!(0.02)),
            tp_order_id: None,
            sl_order_id: None,
            created_at_ms: 1,
            updated_at_ms: 1,
        };
        store.create_tranche(&row).unwrap();

        row.tp_order_id = Some("201".into());
        row.sl_order_id = Some("202".into());
        row.quantity = Qty::new(d!(0.03));
        row.updated_at_ms = 2;
        store.update_tranche(&row).unwrap();

        let listed = store.list_tranches(&symbol, PositionSide::Long).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].tp_order_id.as_deref(), Some("201"));
        assert_eq!(listed[0].quantity.inner(), d!(0.03));

        store.delete_tranche(&symbol, PositionSide::Long, 0).unwrap();
        assert!(store.list_tranches(&symbol, PositionSide::Long).unwrap().is_empty());
    }

    #[test]
    fn test_relationship_companion_lookup() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rel = OrderRelationship {
            main_order_id: "100".into(),
            tp_order_id: Some("200".into()),
            sl_order_id: Some("300".into()),
            tranche_id: 0,
            created_at_ms: 1,
        };
        store.insert_relationship(&rel).unwrap();

        // Lookup by any leg finds the same row.
        for id in ["100", "200", "300"] {
            let found = store.find_companions(id).unwrap().unwrap();
            assert_eq!(found.main_order_id, "100");
            assert_eq!(found.tp_order_id.as_deref(), Some("200"));
        }
        assert!(store.find_companions("999").unwrap().is_none());
    }

    #[test]
    fn test_fills_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let fill = FillRow {
            order_id: "100".into(),
            seq: 1,
            qty: Qty::new(d!(0.02)),
            price: Price::new(d!(60000)),
            time_ms: 5,
            commission: d!(0.012),
        };
        store.insert_fill(&fill).unwrap();
        store.insert_fill(&fill).unwrap(); // idempotent on (order_id, seq)

        let fills = store.recent_fills(&["100".into()], 10).unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].commission, d!(0.012));
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cascade.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .insert_liquidation(&event("BTCUSDT", Side::Buy, "2", "60000", 1))
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.recent_liquidations(10).unwrap().len(), 1);
    }
}
