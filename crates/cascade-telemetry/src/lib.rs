//! Logging setup and in-process engine counters.

pub mod counters;
pub mod error;
pub mod logging;

pub use counters::{CounterSnapshot, EngineCounters};
pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
