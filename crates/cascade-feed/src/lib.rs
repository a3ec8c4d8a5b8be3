//! Liquidation intake and market-stream parsing.
//!
//! - `parser`: typed decoding of the forced-order, mark-price, and
//!   user-data stream frames
//! - `window`: per-(symbol, side) rolling USDT-volume sums
//! - `intake`: the stream-to-evaluator pipeline with burst buffering

pub mod error;
pub mod intake;
pub mod parser;
pub mod window;

pub use error::{FeedError, FeedResult};
pub use intake::{spawn_intake, IntakeConfig, IntakeStats};
pub use parser::{parse_force_order_frame, parse_mark_price_frame, parse_user_frame, MarkPrice, OrderUpdate, UserEvent};
pub use window::WindowAggregator;
