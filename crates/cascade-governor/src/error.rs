//! Error types for the rate governor.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GovernorError {
    /// Admission denied; retry after the suggested delay.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// All admissions halted until the venue unban time.
    #[error("IP banned for {remaining:?}")]
    Banned { remaining: Duration },

    /// Opt-in queue is full.
    #[error("admission queue full (priority {priority})")]
    QueueFull { priority: &'static str },
}

pub type GovernorResult<T> = std::result::Result<T, GovernorError>;
