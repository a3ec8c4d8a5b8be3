//! Frame parsers for venue streams.
//!
//! The venue delivers three stream shapes: the forced-order multi-stream
//! (single objects or combined-stream wrappers), the mark-price array
//! stream, and listen-key user-data events. All numeric fields arrive as
//! strings.

use crate::error::{FeedError, FeedResult};
use cascade_core::{
    ClientOrderId, LiquidationEvent, OrderStatus, PositionSide, Price, Qty, Side, Symbol,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
struct ForceOrderFrame {
    #[serde(rename = "o")]
    order: ForceOrderPayload,
}

#[derive(Debug, Deserialize)]
struct ForceOrderPayload {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: Side,
    #[serde(rename = "q")]
    qty: Decimal,
    #[serde(rename = "p")]
    price: Decimal,
    #[serde(rename = "T")]
    trade_time: i64,
}

/// Parse a forced-order frame into liquidation events.
///
/// Accepts a bare event object, a combined-stream wrapper (`{stream, data}`),
/// or an array of either.
pub fn parse_force_order_frame(raw: &str, received_ms: i64) -> FeedResult<Vec<LiquidationEvent>> {
    let value: Value = serde_json::from_str(raw).map_err(|e| FeedError::Parse(e.to_string()))?;
    let mut events = Vec::new();
    collect_force_orders(&value, received_ms, &mut events)?;
    Ok(events)
}

fn collect_force_orders(
    value: &Value,
    received_ms: i64,
    out: &mut Vec<LiquidationEvent>,
) -> FeedResult<()> {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_force_orders(item, received_ms, out)?;
            }
        }
        Value::Object(map) => {
            if let Some(data) = map.get("data") {
                return collect_force_orders(data, received_ms, out);
            }
            if map.get("e").and_then(Value::as_str) != Some("forceOrder") {
                return Ok(());
            }
            let frame: ForceOrderFrame = serde_json::from_value(value.clone())
                .map_err(|e| FeedError::Parse(format!("forceOrder: {e}")))?;
            out.push(LiquidationEvent::new(
                Symbol::new(frame.order.symbol),
                frame.order.side,
                Qty::new(frame.order.qty),
                Price::new(frame.order.price),
                frame.order.trade_time,
                received_ms,
            ));
        }
        _ => {}
    }
    Ok(())
}

/// One mark-price tick.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkPrice {
    pub symbol: Symbol,
    pub price: Price,
}

#[derive(Debug, Deserialize)]
struct MarkPricePayload {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: Decimal,
}

/// Parse a mark-price array frame.
pub fn parse_mark_price_frame(raw: &str) -> FeedResult<Vec<MarkPrice>> {
    let value: Value = serde_json::from_str(raw).map_err(|e| FeedError::Parse(e.to_string()))?;
    let mut ticks = Vec::new();
    collect_mark_prices(&value, &mut ticks)?;
    Ok(ticks)
}

fn collect_mark_prices(value: &Value, out: &mut Vec<MarkPrice>) -> FeedResult<()> {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_mark_prices(item, out)?;
            }
        }
        Value::Object(map) => {
            if let Some(data) = map.get("data") {
                return collect_mark_prices(data, out);
            }
            if map.get("e").and_then(Value::as_str) != Some("markPriceUpdate") {
                return Ok(());
            }
            let payload: MarkPricePayload = serde_json::from_value(value.clone())
                .map_err(|e| FeedError::Parse(format!("markPrice: {e}")))?;
            if payload.price.is_sign_positive() && !payload.price.is_zero() {
                out.push(MarkPrice {
                    symbol: Symbol::new(payload.symbol),
                    price: Price::new(payload.price),
                });
            }
        }
        _ => {}
    }
    Ok(())
}

/// A parsed `ORDER_TRADE_UPDATE`.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderUpdate {
    pub order_id: String,
    pub client_id: Option<ClientOrderId>,
    pub symbol: Symbol,
    pub side: Side,
    pub position_side: PositionSide,
    pub order_type: String,
    pub status: OrderStatus,
    pub filled_qty: Qty,
    pub last_fill_qty: Qty,
    pub avg_price: Price,
    pub last_price: Price,
    pub realized_pnl: Decimal,
    pub commission: Decimal,
    pub reduce_only: bool,
    pub trade_id: i64,
    pub event_time_ms: i64,
}

/// Decoded user-data event.
#[derive(Debug, Clone, PartialEq)]
pub enum UserEvent {
    Order(OrderUpdate),
    /// Balance/position drift notification; triggers a reconcile.
    AccountUpdate { event_time_ms: i64 },
    ListenKeyExpired,
    /// Recognized but irrelevant event type.
    Ignored,
}

#[derive(Debug, Deserialize)]
struct OrderTradeUpdateFrame {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "o")]
    order: OrderTradeUpdatePayload,
}

#[derive(Debug, Deserialize)]
struct OrderTradeUpdatePayload {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    client_order_id: Option<String>,
    #[serde(rename = "S")]
    side: Side,
    #[serde(rename = "o")]
    order_type: String,
    #[serde(rename = "X")]
    status: OrderStatus,
    #[serde(rename = "i")]
    order_id: i64,
    #[serde(rename = "l", default)]
    last_fill_qty: Decimal,
    #[serde(rename = "z", default)]
    filled_qty: Decimal,
    #[serde(rename = "L", default)]
    last_price: Decimal,
    #[serde(rename = "ap", default)]
    avg_price: Decimal,
    #[serde(rename = "n", default)]
    commission: Option<Decimal>,
    #[serde(rename = "t", default)]
    trade_id: i64,
    #[serde(rename = "R", default)]
    reduce_only: bool,
    #[serde(rename = "ps", default = "default_position_side")]
    position_side: PositionSide,
    #[serde(rename = "rp", default)]
    realized_pnl: Decimal,
}

fn default_position_side() -> PositionSide {
    PositionSide::Both
}

/// Parse a user-data frame.
pub fn parse_user_frame(raw: &str) -> FeedResult<UserEvent> {
    let value: Value = serde_json::from_str(raw).map_err(|e| FeedError::Parse(e.to_string()))?;
    let value = match value.get("data") {
        Some(data) => data.clone(),
        None => value,
    };
    let event_type = value.get("e").and_then(Value::as_str).unwrap_or_default();
    match event_type {
        "ORDER_TRADE_UPDATE" => {
            let frame: OrderTradeUpdateFrame = serde_json::from_value(value)
                .map_err(|e| FeedError::Parse(format!("ORDER_TRADE_UPDATE: {e}")))?;
            let o = frame.order;
            Ok(UserEvent::Order(OrderUpdate {
                order_id: o.order_id.to_string(),
                client_id: o.client_order_id.map(ClientOrderId::from_string),
                symbol: Symbol::new(o.symbol),
                side: o.side,
                position_side: o.position_side,
                order_type: o.order_type,
                status: o.status,
                filled_qty: Qty::new(o.filled_qty),
                last_fill_qty: Qty::new(o.last_fill_qty),
                avg_price: Price::new(o.avg_price),
                last_price: Price::new(o.last_price),
                realized_pnl: o.realized_pnl,
                commission: o.commission.unwrap_or_default(),
                reduce_only: o.reduce_only,
                trade_id: o.trade_id,
                event_time_ms: frame.event_time,
            }))
        }
        "ACCOUNT_UPDATE" => Ok(UserEvent::AccountUpdate {
            event_time_ms: value.get("E").and_then(Value::as_i64).unwrap_or_default(),
        }),
        "listenKeyExpired" => Ok(UserEvent::ListenKeyExpired),
        _ => Ok(UserEvent::Ignored),
    }
}
