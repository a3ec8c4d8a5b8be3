//! Reconnecting websocket consumers for venue streams.
//!
//! Each stream (forced orders, mark price, user data) runs as one task that
//! owns its socket, forwards text frames onto an internal channel, and
//! reconnects with jittered exponential backoff on any failure.

pub mod connection;
pub mod error;

pub use connection::{run_stream, spawn_stream, StaticUrl, StreamConfig, StreamHandle, UrlProvider};
pub use error::{WsError, WsResult};
