//! Endpoint weight table.
//!
//! Weights follow the venue's futures v1/v2 documentation: most per-symbol
//! forms cost 1, depth and kline weights depend on the requested limit, and
//! all-symbol forms cost 40-50.

use std::fmt;

/// An outbound REST endpoint, carrying the parameters that affect its weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Ping,
    ServerTime,
    ExchangeInfo,
    /// Order book; weight depends on `limit`.
    Depth { limit: u32 },
    /// Klines; weight depends on `limit`.
    Klines { limit: u32 },
    /// 24h ticker; 40x when no symbol is given.
    Ticker24h { all_symbols: bool },
    TickerPrice { all_symbols: bool },
    BookTicker { all_symbols: bool },
    PositionMode,
    MultiAssetsMargin,
    Order,
    BatchOrders,
    OpenOrders { all_symbols: bool },
    AllOpenOrders { all_symbols: bool },
    AllOrders,
    Leverage,
    MarginType,
    ForceOrders { all_symbols: bool },
    Account,
    Balance,
    PositionRisk,
    UserTrades,
    CommissionRate,
    Income,
    LeverageBracket,
    ListenKey,
}

impl Endpoint {
    /// Exact request weight for this call.
    pub fn weight(&self) -> u32 {
        match self {
            Self::Ping | Self::ServerTime | Self::ExchangeInfo => 1,
            Self::Depth { limit } => match limit {
                0..=50 => 2,
                51..=100 => 5,
                101..=500 => 10,
                _ => 20,
            },
            Self::Klines { limit } => match limit {
                0..=99 => 1,
                100..=499 => 2,
                500..=1000 => 5,
                _ => 10,
            },
            Self::Ticker24h { all_symbols } => {
                if *all_symbols {
                    40
                } else {
                    1
                }
            }
            Self::TickerPrice { all_symbols } | Self::BookTicker { all_symbols } => {
                if *all_symbols {
                    2
                } else {
                    1
                }
            }
            Self::PositionMode | Self::MultiAssetsMargin => 1,
            Self::Order => 1,
            Self::BatchOrders => 5,
            Self::OpenOrders { all_symbols } | Self::AllOpenOrders { all_symbols } => {
                if *all_symbols {
                    40
                } else {
                    1
                }
            }
            Self::AllOrders => 5,
            Self::Leverage | Self::MarginType => 1,
            Self::ForceOrders { all_symbols } => {
                if *all_symbols {
                    50
                } else {
                    20
                }
            }
            Self::Account | Self::Balance | Self::PositionRisk => 5,
            Self::UserTrades => 5,
            Self::CommissionRate => 20,
            Self::Income => 30,
            Self::LeverageBracket => 1,
            Self::ListenKey => 1,
        }
    }

    /// Whether this call consumes the per-minute order quota.
    pub fn counts_as_order(&self) -> bool {
        matches!(self, Self::Order | Self::BatchOrders)
    }

    /// Number of orders the call consumes (batch counts each slot).
    pub fn order_count(&self) -> u32 {
        match self {
            Self::Order => 1,
            Self::BatchOrders => 5,
            _ => 0,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = match self {
            Self::Ping => "/fapi/v1/ping",
            Self::ServerTime => "/fapi/v1/time",
            Self::ExchangeInfo => "/fapi/v1/exchangeInfo",
            Self::Depth { .. } => "/fapi/v1/depth",
            Self::Klines { .. } => "/fapi/v1/klines",
            Self::Ticker24h { .. } => "/fapi/v1/ticker/24hr",
            Self::TickerPrice { .. } => "/fapi/v1/ticker/price",
            Self::BookTicker { .. } => "/fapi/v1/ticker/bookTicker",
            Self::PositionMode => "/fapi/v1/positionSide/dual",
            Self::MultiAssetsMargin => "/fapi/v1/multiAssetsMargin",
            Self::Order => "/fapi/v1/order",
            Self::BatchOrders => "/fapi/v1/batchOrders",
            Self::OpenOrders { .. } => "/fapi/v1/openOrders",
            Self::AllOpenOrders { .. } => "/fapi/v1/allOpenOrders",
            Self::AllOrders => "/fapi/v1/allOrders",
            Self::Leverage => "/fapi/v1/leverage",
            Self::MarginType => "/fapi/v1/marginType",
            Self::ForceOrders { .. } => "/fapi/v1/forceOrders",
            Self::Account => "/fapi/v2/account",
            Self::Balance => "/fapi/v2/balance",
            Self::PositionRisk => "/fapi/v2/positionRisk",
            Self::UserTrades => "/fapi/v1/userTrades",
            Self::CommissionRate => "/fapi/v1/commissionRate",
            Self::Income => "/fapi/v1/income",
            Self::LeverageBracket => "/fapi/v1/leverageBracket",
            Self::ListenKey => "/fapi/v1/listenKey",
        };
        write!(f, "{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_weight_by_limit() {
        assert_eq!(Endpoint::Depth { limit: 5 }.weight(), 2);
        assert_eq!(Endpoint::Depth { limit: 100 }.weight(), 5);
        assert_eq!(Endpoint::Depth { limit: 500 }.weight(), 10);
        assert_eq!(Endpoint::Depth { limit: 1000 }.weight(), 20);
    }

    #[test]
    fn test_kline_weight_by_limit() {
        assert_eq!(Endpoint::Klines { limit: 50 }.weight(), 1);
        assert_eq!(Endpoint::Klines { limit: 200 }.weight(), 2);
        assert_eq!(Endpoint::Klines { limit: 700 }.weight(), 5);
        assert_eq!(Endpoint::Klines { limit: 1200 }.weight(), 10);
    }

    #[test]
    fn test_all_symbol_forms_heavy() {
        assert_eq!(Endpoint::OpenOrders { all_symbols: true }.weight(), 40);
        assert_eq!(Endpoint::OpenOrders { all_symbols: false }.weight(), 1);
        assert_eq!(Endpoint::ForceOrders { all_symbols: true }.weight(), 50);
        assert_eq!(Endpoint::Ticker24h { all_symbols: true }.weight(), 40);
    }

    #[test]
    fn test_order_endpoints_consume_order_quota() {
        assert!(Endpoint::Order.counts_as_order());
        assert_eq!(Endpoint::BatchOrders.order_count(), 5);
        assert!(!Endpoint::Account.counts_as_order());
    }
}
