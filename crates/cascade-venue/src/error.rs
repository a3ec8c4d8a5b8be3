//! Venue error taxonomy.
//!
//! Every REST failure maps into this closed set. Only `TransientNetwork`
//! and `RateLimited` are retried; the rest are handed to callers (and
//! ultimately the reconciler, which re-derives intent from venue truth).

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VenueError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("IP banned for {remaining:?}")]
    Banned { remaining: Duration },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid parameter (code {code}): {msg}")]
    InvalidParam { code: i32, msg: String },

    #[error("margin insufficient")]
    InsufficientBalance,

    #[error("reduce-only order rejected")]
    ReduceOnlyRejected,

    #[error("position not found")]
    PositionNotFound,

    #[error("order not found")]
    OrderNotFound,

    #[error("unknown venue error (code {code}): {msg}")]
    UnknownVenue { code: i32, msg: String },
}

impl VenueError {
    /// Map a venue error body to the closed set.
    pub fn from_code(code: i32, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        match code {
            -1106 | -4164 | -1111 | -1013 | -4003 => Self::InvalidParam { code, msg },
            -2019 => Self::InsufficientBalance,
            -2022 => Self::ReduceOnlyRejected,
            -2013 | -2011 => Self::OrderNotFound,
            -4061 | -2020 => Self::PositionNotFound,
            -2014 | -2015 | -1022 => Self::Auth(msg),
            _ => Self::UnknownVenue { code, msg },
        }
    }

    /// Whether the caller may retry this error blindly.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_) | Self::RateLimited { .. })
    }

    /// Whether this error references lot/tick/notional rules, which
    /// invalidates the cached symbol spec.
    pub fn invalidates_spec(&self) -> bool {
        matches!(self, Self::InvalidParam { code, .. } if matches!(code, -1111 | -1013 | -4164))
    }
}

pub type VenueResult<T> = std::result::Result<T, VenueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping() {
        assert!(matches!(
            VenueError::from_code(-2022, "ReduceOnly Order is rejected"),
            VenueError::ReduceOnlyRejected
        ));
        assert!(matches!(
            VenueError::from_code(-2019, "Margin is insufficient"),
            VenueError::InsufficientBalance
        ));
        assert!(matches!(
            VenueError::from_code(-2013, "Order does not exist"),
            VenueError::OrderNotFound
        ));
        assert!(matches!(
            VenueError::from_code(-4164, "Order's notional must be no smaller"),
            VenueError::InvalidParam { code: -4164, .. }
        ));
        assert!(matches!(
            VenueError::from_code(-2014, "API-key format invalid"),
            VenueError::Auth(_)
        ));
        assert!(matches!(
            VenueError::from_code(-9999, "?"),
            VenueError::UnknownVenue { .. }
        ));
    }

    #[test]
    fn test_retryable_split() {
        assert!(VenueError::TransientNetwork("timeout".into()).is_retryable());
        assert!(VenueError::RateLimited {
            retry_after: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(!VenueError::ReduceOnlyRejected.is_retryable());
        assert!(!VenueError::Auth("bad key".into()).is_retryable());
    }

    #[test]
    fn test_spec_invalidation() {
        assert!(VenueError::from_code(-4164, "notional").invalidates_spec());
        assert!(VenueError::from_code(-1111, "precision").invalidates_spec());
        assert!(!VenueError::ReduceOnlyRejected.invalidates_spec());
    }
}
