//! Wire models for venue REST responses.

use cascade_core::{OrderStatus, PositionSide, Price, Qty, Side, Symbol, SymbolSpec};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Venue error body.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    pub code: i32,
    pub msg: String,
}

/// Raw exchange-info payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeInfo {
    #[serde(default)]
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: String,
    #[serde(default)]
    pub price_precision: u32,
    #[serde(default)]
    pub quantity_precision: u32,
    #[serde(default)]
    pub filters: Vec<SymbolFilter>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "filterType")]
pub enum SymbolFilter {
    #[serde(rename = "PRICE_FILTER", rename_all = "camelCase")]
    Price {
        tick_size: Decimal,
        #[serde(default)]
        min_price: Option<Decimal>,
        #[serde(default)]
        max_price: Option<Decimal>,
    },
    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize {
        step_size: Decimal,
        min_qty: Decimal,
        max_qty: Decimal,
    },
    #[serde(rename = "MIN_NOTIONAL", rename_all = "camelCase")]
    MinNotional { notional: Decimal },
    #[serde(other)]
    Other,
}

impl SymbolInfo {
    /// Build a `SymbolSpec` from the filter list.
    /// Returns None when the lot-size filter is missing.
    pub fn to_spec(&self) -> Option<SymbolSpec> {
        let mut tick = None;
        let mut lot = None;
        let mut min_notional = Decimal::from(5);
        for f in &self.filters {
            match f {
                SymbolFilter::Price { tick_size, .. } => tick = Some(*tick_size),
                SymbolFilter::LotSize {
                    step_size,
                    min_qty,
                    max_qty,
                } => lot = Some((*step_size, *min_qty, *max_qty)),
                SymbolFilter::MinNotional { notional } => min_notional = *notional,
                SymbolFilter::Other => {}
            }
        }
        let (step_size, min_qty, max_qty) = lot?;
        Some(SymbolSpec {
            symbol: Symbol::new(&self.symbol),
            tick_size: Price::new(tick?),
            step_size: Qty::new(step_size),
            min_qty: Qty::new(min_qty),
            max_qty: Qty::new(max_qty),
            min_notional,
            price_precision: self.price_precision,
            quantity_precision: self.quantity_precision,
        })
    }
}

/// Top-of-book snapshot from the depth endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct DepthSnapshot {
    #[serde(default)]
    pub bids: Vec<(Decimal, Decimal)>,
    #[serde(default)]
    pub asks: Vec<(Decimal, Decimal)>,
}

impl DepthSnapshot {
    pub fn best_bid(&self) -> Option<Price> {
        self.bids.first().map(|&(p, _)| Price::new(p))
    }

    pub fn best_ask(&self) -> Option<Price> {
        self.asks.first().map(|&(p, _)| Price::new(p))
    }
}

/// Acknowledgement for a placed order.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub order_id: i64,
    #[serde(default)]
    pub client_order_id: Option<String>,
    pub status: OrderStatus,
    #[serde(default)]
    pub executed_qty: Option<Decimal>,
    #[serde(default)]
    pub avg_price: Option<Decimal>,
}

impl OrderAck {
    pub fn order_id_str(&self) -> String {
        self.order_id.to_string()
    }
}

/// One element of a batch-order response: either an ack or an error body.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BatchItem {
    Ack(OrderAck),
    Err(ErrorBody),
}

/// An open order as returned by the open-orders endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrder {
    pub order_id: i64,
    pub symbol: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: String,
    #[serde(default = "default_position_side")]
    pub position_side: PositionSide,
    pub status: OrderStatus,
    #[serde(default)]
    pub orig_qty: Option<Decimal>,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub stop_price: Option<Decimal>,
    #[serde(default)]
    pub time: i64,
}

fn default_position_side() -> PositionSide {
    PositionSide::Both
}

impl OpenOrder {
    /// Whether this is a protective stop/TP-style order.
    pub fn is_stop_order(&self) -> bool {
        matches!(
            self.order_type.as_str(),
            "TAKE_PROFIT_MARKET" | "STOP_MARKET" | "TAKE_PROFIT" | "STOP" | "TRAILING_STOP_MARKET"
        )
    }
}

/// A venue position row.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRisk {
    pub symbol: String,
    pub position_amt: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    #[serde(default = "default_position_side")]
    pub position_side: PositionSide,
    #[serde(default)]
    pub leverage: Option<String>,
}

impl PositionRisk {
    /// Resolved position side: in one-way mode the venue reports BOTH and
    /// the sign of the amount carries the direction.
    pub fn resolved_side(&self) -> PositionSide {
        match self.position_side {
            PositionSide::Both => {
                if self.position_amt.is_sign_negative() {
                    PositionSide::Short
                } else {
                    PositionSide::Long
                }
            }
            side => side,
        }
    }

    pub fn abs_qty(&self) -> Qty {
        Qty::new(self.position_amt.abs())
    }
}

/// Account summary.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub total_wallet_balance: Decimal,
    pub available_balance: Decimal,
    #[serde(default)]
    pub total_unrealized_profit: Option<Decimal>,
}

/// Listen-key creation response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenKey {
    pub listen_key: String,
}

/// Position-mode query response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionModeInfo {
    pub dual_side_position: bool,
}

/// Multi-assets-margin query response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiAssetsInfo {
    pub multi_assets_margin: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_spec_from_filters() {
        let json = r#"{
            "symbol": "BTCUSDT",
            "pricePrecision": 1,
            "quantityPrecision": 3,
            "filters": [
                {"filterType": "PRICE_FILTER", "tickSize": "0.10", "minPrice": "100", "maxPrice": "1000000"},
                {"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001", "maxQty": "1000"},
                {"filterType": "MIN_NOTIONAL", "notional": "5"},
                {"filterType": "PERCENT_PRICE", "multiplierUp": "1.05"}
            ]
        }"#;
        let info: SymbolInfo = serde_json::from_str(json).unwrap();
        let spec = info.to_spec().unwrap();
        assert_eq!(spec.tick_size.inner(), dec!(0.10));
        assert_eq!(spec.step_size.inner(), dec!(0.001));
        assert_eq!(spec.min_notional, dec!(5));
        assert_eq!(spec.price_precision, 1);
    }

    #[test]
    fn test_depth_best_prices() {
        let json = r#"{"bids": [["59999.5", "2.0"], ["59999.0", "1.0"]], "asks": [["60000.5", "0.4"]]}"#;
        let depth: DepthSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(depth.best_bid().unwrap().inner(), dec!(59999.5));
        assert_eq!(depth.best_ask().unwrap().inner(), dec!(60000.5));
    }

    #[test]
    fn test_position_risk_resolved_side() {
        let json = r#"{"symbol": "BTCUSDT", "positionAmt": "-0.5", "entryPrice": "60000",
                        "markPrice": "59000", "positionSide": "BOTH"}"#;
        let pos: PositionRisk = serde_json::from_str(json).unwrap();
        assert_eq!(pos.resolved_side(), PositionSide::Short);
        assert_eq!(pos.abs_qty().inner(), dec!(0.5));
    }

    #[test]
    fn test_batch_item_untagged() {
        let json = r#"[{"orderId": 123, "status": "NEW"}, {"code": -2022, "msg": "rejected"}]"#;
        let items: Vec<BatchItem> = serde_json::from_str(json).unwrap();
        assert!(matches!(items[0], BatchItem::Ack(_)));
        assert!(matches!(items[1], BatchItem::Err(_)));
    }

    #[test]
    fn test_open_order_stop_detection() {
        let json = r#"{"orderId": 5, "symbol": "BTCUSDT", "side": "SELL",
                        "type": "STOP_MARKET", "status": "NEW", "time": 0}"#;
        let o: OpenOrder = serde_json::from_str(json).unwrap();
        assert!(o.is_stop_order());
    }
}
