//! Websocket error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("stream closed by peer")]
    Closed,

    #[error("failed to resolve stream url: {0}")]
    UrlProvider(String),

    #[error("receiver dropped, stopping stream")]
    ReceiverDropped,
}

pub type WsResult<T> = std::result::Result<T, WsError>;
