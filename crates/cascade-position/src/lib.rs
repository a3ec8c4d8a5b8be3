//! The position lifecycle engine.
//!
//! - `tranche`: the per-(symbol, position-side) tranche partitioner
//! - `protection`: TP/SL order lifecycle per tranche
//! - `breaker`: the shared circuit breaker guarding rebuilds and fast-path
//! - `monitor`: mark-price fast path (instant TP capture)
//! - `router`: user-data stream fill routing
//! - `reconciler`: periodic consistency sweep against venue truth

pub mod breaker;
pub mod error;
pub mod monitor;
pub mod protection;
pub mod reconciler;
pub mod router;
pub mod tranche;

pub use breaker::{BreakerConfig, CircuitBreaker};
pub use error::{PositionError, PositionResult};
pub use monitor::{spawn_price_monitor, MonitorConfig, PriceMonitor};
pub use protection::{
    spawn_protection_manager, ProtectionConfig, ProtectionManager, ProtectionWork,
};
pub use reconciler::{spawn_reconciler, Reconciler, ReconcilerConfig};
pub use router::{spawn_fill_router, RouterDeps};
pub use tranche::{
    EntryFillEffect, MergeOutcome, ReduceEffect, Tranche, TrancheBook, TrancheConfig,
    TranchePnlBasis,
};
