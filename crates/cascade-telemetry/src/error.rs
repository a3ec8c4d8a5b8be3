//! Telemetry error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("logging init failed: {0}")]
    Init(String),
}

pub type TelemetryResult<T> = std::result::Result<T, TelemetryError>;
