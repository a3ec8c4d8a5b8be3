//! Feed error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("frame parse error: {0}")]
    Parse(String),

    #[error("store error: {0}")]
    Store(#[from] cascade_store::StoreError),

    #[error("downstream channel closed")]
    ChannelClosed,
}

pub type FeedResult<T> = std::result::Result<T, FeedError>;
