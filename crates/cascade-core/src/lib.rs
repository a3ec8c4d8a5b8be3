//! Core domain types for the cascade trading engine.
//!
//! This crate provides the fundamental types used throughout the system:
//! - `Price`, `Qty`: precision-safe numeric types
//! - `Symbol`: venue symbol identifier
//! - `SymbolSpec`: per-symbol trading rules (tick, step, min-notional)
//! - `Side`, `PositionSide`, `OrderKind`, `OrderStatus`: trading enums
//! - `LiquidationEvent`, `OrderRecord`, `FillEvent`: engine records

pub mod decimal;
pub mod error;
pub mod liquidation;
pub mod order;
pub mod settings;
pub mod symbol;

pub use decimal::{Price, Qty};
pub use error::{CoreError, Result};
pub use liquidation::LiquidationEvent;
pub use order::{
    ClientOrderId, FillEvent, MarginType, OrderKind, OrderRecord, OrderStatus, PositionSide, Side,
    TimeInForce, TradeSide, WorkingType,
};
pub use settings::SymbolSettings;
pub use symbol::{Symbol, SymbolSpec};
