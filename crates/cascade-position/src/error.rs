//! Position engine error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("venue error: {0}")]
    Venue(#[from] cascade_venue::VenueError),

    #[error("store error: {0}")]
    Store(#[from] cascade_store::StoreError),

    #[error("unknown tranche {tranche_id} for {symbol} {position_side}")]
    UnknownTranche {
        symbol: String,
        position_side: String,
        tranche_id: u64,
    },

    #[error("tranche {0} is circuit-broken")]
    CircuitOpen(u64),
}

pub type PositionResult<T> = std::result::Result<T, PositionError>;
