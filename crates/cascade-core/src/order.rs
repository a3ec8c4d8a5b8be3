//! Order-related types: sides, kinds, statuses, records, fills.

use crate::{Price, Qty, Symbol};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Order side: buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Returns the opposite side.
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Position side opened by an entry on this side.
    pub fn opens(&self) -> PositionSide {
        match self {
            Self::Buy => PositionSide::Long,
            Self::Sell => PositionSide::Short,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Position side. `Both` is the one-way-mode value; hedge mode tracks
/// `Long` and `Short` independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
    Both,
}

impl PositionSide {
    /// The side of an order that reduces this position.
    ///
    /// Long positions are reduced by selling; shorts by buying.
    pub fn reduce_side(&self) -> Side {
        match self {
            Self::Long | Self::Both => Side::Sell,
            Self::Short => Side::Buy,
        }
    }

    /// The side of an order that increases this position.
    pub fn entry_side(&self) -> Side {
        self.reduce_side().opposite()
    }

    /// Signed return of `mark` relative to `entry`, in percent.
    /// Positive when the mark is favorable to this position side.
    pub fn signed_return_pct(&self, entry: Price, mark: Price) -> Decimal {
        if entry.is_zero() {
            return Decimal::ZERO;
        }
        let raw = (mark.inner() - entry.inner()) / entry.inner() * Decimal::from(100);
        match self {
            Self::Long | Self::Both => raw,
            Self::Short => -raw,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
            Self::Both => write!(f, "BOTH"),
        }
    }
}

/// What role an order plays in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderKind {
    /// Position-opening limit order.
    Entry,
    /// Take-profit limit, reduce-only.
    Tp,
    /// Stop-loss stop-market, reduce-only.
    Sl,
    /// Market reduce (fast-path or explicit close).
    Close,
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entry => write!(f, "ENTRY"),
            Self::Tp => write!(f, "TP"),
            Self::Sl => write!(f, "SL"),
            Self::Close => write!(f, "CLOSE"),
        }
    }
}

/// Venue order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
    /// Recorded but never submitted (simulate_only mode).
    Simulated,
}

impl OrderStatus {
    /// Terminal states cannot transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Expired | Self::Rejected
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::Expired => "EXPIRED",
            Self::Rejected => "REJECTED",
            Self::Simulated => "SIMULATED",
        };
        write!(f, "{s}")
    }
}

/// Time-in-force for entry orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    #[default]
    Gtc,
    Ioc,
    Fok,
}

impl fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gtc => write!(f, "GTC"),
            Self::Ioc => write!(f, "IOC"),
            Self::Fok => write!(f, "FOK"),
        }
    }
}

/// Trigger price basis for stop orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkingType {
    #[default]
    ContractPrice,
    MarkPrice,
}

impl fmt::Display for WorkingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContractPrice => write!(f, "CONTRACT_PRICE"),
            Self::MarkPrice => write!(f, "MARK_PRICE"),
        }
    }
}

/// Per-symbol margin mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarginType {
    #[default]
    Isolated,
    Cross,
}

impl fmt::Display for MarginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Isolated => write!(f, "ISOLATED"),
            Self::Cross => write!(f, "CROSSED"),
        }
    }
}

/// Contrarian mapping from liquidated side to entry side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    /// Counter-trade the liquidation (liquidation of longs opens a short).
    #[default]
    Opposite,
    /// Mirror the liquidation.
    Same,
}

impl TradeSide {
    /// Entry order side for a given forced-order side.
    ///
    /// A SELL forced order means longs were liquidated; the contrarian
    /// (`Opposite`) mapping opens a SHORT against the liquidated cohort,
    /// so the entry side equals the forced-order side.
    pub fn entry_side(&self, liquidated: Side) -> Side {
        match self {
            Self::Opposite => liquidated,
            Self::Same => liquidated.opposite(),
        }
    }
}

/// Client order ID for idempotency.
///
/// Every submitted order carries a unique client id so a retried submit
/// cannot create a second venue order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientOrderId(String);

impl ClientOrderId {
    /// Format: `csc_{timestamp_ms}_{uuid_short}`.
    pub fn new() -> Self {
        let ts = chrono::Utc::now().timestamp_millis();
        let uuid_short = &Uuid::new_v4().to_string()[..8];
        Self(format!("csc_{ts}_{uuid_short}"))
    }

    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientOrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ClientOrderId {
    fn from(s: String) -> Self {
        Self::from_string(s)
    }
}

/// Persisted order row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    /// Venue-assigned order id.
    pub order_id: String,
    pub client_id: Option<ClientOrderId>,
    pub symbol: Symbol,
    pub position_side: PositionSide,
    pub side: Side,
    pub kind: OrderKind,
    pub qty: Qty,
    /// Limit price; None for market and stop-market orders.
    pub price: Option<Price>,
    /// Trigger price; SL only.
    pub stop_price: Option<Price>,
    pub status: OrderStatus,
    pub tranche_id: Option<u64>,
    /// Entry order this TP/SL protects; None for entries.
    pub parent_order_id: Option<String>,
    pub placed_at_ms: i64,
    pub final_at_ms: Option<i64>,
    pub executed_qty: Qty,
    pub avg_fill_price: Option<Price>,
    pub time_in_force: TimeInForce,
}

/// A fill routed from the user-data stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    pub order_id: String,
    pub client_id: Option<ClientOrderId>,
    pub symbol: Symbol,
    pub side: Side,
    pub position_side: PositionSide,
    pub status: OrderStatus,
    /// Cumulative filled quantity.
    pub filled_qty: Qty,
    /// Quantity of this individual fill.
    pub last_fill_qty: Qty,
    pub avg_price: Price,
    pub realized_pnl: Decimal,
    pub commission: Decimal,
    pub reduce_only: bool,
    pub event_time_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }

    #[test]
    fn test_reduce_side() {
        assert_eq!(PositionSide::Long.reduce_side(), Side::Sell);
        assert_eq!(PositionSide::Short.reduce_side(), Side::Buy);
    }

    #[test]
    fn test_signed_return() {
        let entry = Price::new(dec!(60000));
        let mark = Price::new(dec!(56800));
        // -5.33..% for a long, +5.33..% for a short
        let long_ret = PositionSide::Long.signed_return_pct(entry, mark);
        assert!(long_ret < dec!(-5.3) && long_ret > dec!(-5.4));
        let short_ret = PositionSide::Short.signed_return_pct(entry, mark);
        assert!(short_ret > dec!(5.3) && short_ret < dec!(5.4));
    }

    #[test]
    fn test_trade_side_mapping() {
        // Forced BUY = shorts liquidated; contrarian entry opens LONG.
        assert_eq!(TradeSide::Opposite.entry_side(Side::Buy), Side::Buy);
        // Forced SELL = longs liquidated; contrarian entry opens SHORT.
        assert_eq!(TradeSide::Opposite.entry_side(Side::Sell), Side::Sell);
        assert_eq!(TradeSide::Same.entry_side(Side::Sell), Side::Buy);
    }

    #[test]
    fn test_status_terminal() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn test_client_order_id_unique() {
        assert_ne!(ClientOrderId::new(), ClientOrderId::new());
    }

    #[test]
    fn test_serde_roundtrip_enums() {
        let s: Side = serde_json::from_str("\"BUY\"").unwrap();
        assert_eq!(s, Side::Buy);
        let st: OrderStatus = serde_json::from_str("\"PARTIALLY_FILLED\"").unwrap();
        assert_eq!(st, OrderStatus::PartiallyFilled);
        let wt: WorkingType = serde_json::from_str("\"MARK_PRICE\"").unwrap();
        assert_eq!(wt, WorkingType::MarkPrice);
    }
}
