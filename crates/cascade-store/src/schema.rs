//! Table definitions and indexes.

use crate::error::StoreResult;
use rusqlite::Connection;

/// Create all tables and indexes if absent.
pub fn init_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS liquidations (
            event_id      TEXT PRIMARY KEY,
            symbol        TEXT NOT NULL,
            side          TEXT NOT NULL,
            qty           TEXT NOT NULL,
            price         TEXT NOT NULL,
            usdt_value    TEXT NOT NULL,
            event_time    INTEGER NOT NULL,
            received_time INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_liquidations_symbol_time
            ON liquidations (symbol, event_time);

        CREATE TABLE IF NOT EXISTS orders (
            order_id        TEXT PRIMARY KEY,
            client_id       TEXT,
            symbol          TEXT NOT NULL,
            position_side   TEXT NOT NULL,
            kind            TEXT NOT NULL,
            side            TEXT NOT NULL,
            qty             TEXT NOT NULL,
            price           TEXT,
            stop_price      TEXT,
            status          TEXT NOT NULL,
            tranche_id      INTEGER,
            parent_order_id TEXT,
            placed_at       INTEGER NOT NULL,
            final_at        INTEGER,
            executed_qty    TEXT NOT NULL,
            avg_fill_price  TEXT,
            time_in_force   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_orders_symbol_time
            ON orders (symbol, placed_at);
        CREATE INDEX IF NOT EXISTS idx_orders_parent
            ON orders (parent_order_id);
        CREATE INDEX IF NOT EXISTS idx_orders_status
            ON orders (status);

        CREATE TABLE IF NOT EXISTS order_relationships (
            main_order_id TEXT PRIMARY KEY,
            tp_order_id   TEXT,
            sl_order_id   TEXT,
            tranche_id    INTEGER NOT NULL,
            created_at    INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_relationships_tp
            ON order_relationships (tp_order_id);
        CREATE INDEX IF NOT EXISTS idx_relationships_sl
            ON order_relationships (sl_order_id);

        CREATE TABLE IF NOT EXISTS tranches (
            symbol          TEXT NOT NULL,
            position_side   TEXT NOT NULL,
            tranche_id      INTEGER NOT NULL,
            avg_entry_price TEXT NOT NULL,
            quantity        TEXT NOT NULL,
            tp_order_id     TEXT,
            sl_order_id     TEXT,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL,
            PRIMARY KEY (symbol, position_side, tranche_id)
        );

        CREATE TABLE IF NOT EXISTS fills (
            order_id   TEXT NOT NULL,
            seq        INTEGER NOT NULL,
            qty        TEXT NOT NULL,
            price      TEXT NOT NULL,
            time       INTEGER NOT NULL,
            commission TEXT NOT NULL,
            PRIMARY KEY (order_id, seq)
        );
        CREATE INDEX IF NOT EXISTS idx_fills_time ON fills (time);
        "#,
    )?;
    Ok(())
}
