//! Evaluator error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("venue error: {0}")]
    Venue(#[from] cascade_venue::VenueError),

    #[error("store error: {0}")]
    Store(#[from] cascade_store::StoreError),

    #[error("no usable price for {0}")]
    NoPrice(String),
}

pub type EvalResult<T> = std::result::Result<T, EvalError>;
