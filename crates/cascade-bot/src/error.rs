//! Application errors and exit codes.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration invalid: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("venue error: {0}")]
    Venue(#[from] cascade_venue::VenueError),

    #[error("store error: {0}")]
    Store(#[from] cascade_store::StoreError),

    #[error("position engine error: {0}")]
    Position(#[from] cascade_position::PositionError),

    #[error("telemetry error: {0}")]
    Telemetry(#[from] cascade_telemetry::TelemetryError),

    #[error("hard-stop timeout reached with undrained work")]
    HardStopTimeout,
}

impl AppError {
    /// Operational exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::Auth(_) => 3,
            Self::HardStopTimeout => 4,
            _ => 1,
        }
    }
}

pub type AppResult<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(AppError::Config("x".into()).exit_code(), 2);
        assert_eq!(AppError::Auth("x".into()).exit_code(), 3);
        assert_eq!(AppError::HardStopTimeout.exit_code(), 4);
    }
}
