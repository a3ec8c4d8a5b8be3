//! Trade evaluation: turning liquidation events into entry orders.
//!
//! Each event runs through threshold and admission gates, gets an
//! orderbook-aware limit price, and is submitted at critical priority with
//! an idempotent client id. Events for the same symbol are serialized on a
//! per-symbol worker; symbols evaluate in parallel.

pub mod config;
pub mod error;
pub mod evaluator;
pub mod exposure;
pub mod gates;
pub mod pricing;
pub mod workers;

pub use config::EvaluatorConfig;
pub use error::{EvalError, EvalResult};
pub use evaluator::{EvalOutcome, TradeEvaluator};
pub use exposure::ExposureTracker;
pub use gates::GateRejection;
pub use workers::spawn_evaluator_workers;
