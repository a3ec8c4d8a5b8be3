//! Admission gates.
//!
//! Applied in order after the volume threshold; each may veto the entry.

use cascade_core::Symbol;
use rust_decimal::Decimal;
use std::fmt;

/// Why an entry was vetoed.
#[derive(Debug, Clone, PartialEq)]
pub enum GateRejection {
    TotalExposure {
        current: Decimal,
        projected: Decimal,
        limit: Decimal,
    },
    OpenOrders {
        open: u32,
        limit: u32,
    },
    MinNotional {
        notional: Decimal,
        min_notional: Decimal,
    },
    PositionCap {
        current: Decimal,
        projected: Decimal,
        limit: Decimal,
    },
}

impl fmt::Display for GateRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TotalExposure {
                current,
                projected,
                limit,
            } => write!(
                f,
                "total exposure {current} + {projected} would exceed {limit}"
            ),
            Self::OpenOrders { open, limit } => {
                write!(f, "{open} open entry orders at limit {limit}")
            }
            Self::MinNotional {
                notional,
                min_notional,
            } => write!(f, "notional {notional} below minimum {min_notional}"),
            Self::PositionCap {
                current,
                projected,
                limit,
            } => write!(
                f,
                "position {current} + {projected} would exceed cap {limit}"
            ),
        }
    }
}

/// Exposure snapshot fed into the gates.
#[derive(Debug, Clone, Default)]
pub struct GateInputs {
    /// Σ |notional| over all tranches, every symbol and side.
    pub total_position_notional: Decimal,
    /// Σ notional over tranches for this (symbol, position_side).
    pub symbol_side_notional: Decimal,
    /// Live entry orders for this symbol.
    pub open_entry_orders: u32,
    /// Pending exposure across all symbols.
    pub total_pending: Decimal,
    /// Pending exposure for this symbol.
    pub symbol_pending: Decimal,
}

/// Run the admission gates in spec order.
pub fn check(
    symbol: &Symbol,
    inputs: &GateInputs,
    projected_notional: Decimal,
    min_notional: Decimal,
    max_total_exposure: Decimal,
    max_open_orders: u32,
    max_position_usdt: Decimal,
) -> Result<(), GateRejection> {
    let total = inputs.total_position_notional + inputs.total_pending;
    if total + projected_notional > max_total_exposure {
        return Err(GateRejection::TotalExposure {
            current: total,
            projected: projected_notional,
            limit: max_total_exposure,
        });
    }

    if inputs.open_entry_orders >= max_open_orders {
        return Err(GateRejection::OpenOrders {
            open: inputs.open_entry_orders,
            limit: max_open_orders,
        });
    }

    if projected_notional < min_notional {
        return Err(GateRejection::MinNotional {
            notional: projected_notional,
            min_notional,
        });
    }

    let symbol_total = inputs.symbol_side_notional + inputs.symbol_pending;
    if symbol_total + projected_notional > max_position_usdt {
        return Err(GateRejection::PositionCap {
            current: symbol_total,
            projected: projected_notional,
            limit: max_position_usdt,
        });
    }

    let _ = symbol;
    Ok(())
}
