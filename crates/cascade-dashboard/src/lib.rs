//! Read-only projections of engine state.
//!
//! The HTTP dashboard is an external collaborator; this crate only exposes
//! the typed queries it consumes, plus the single write it is allowed:
//! `close_position`, which enqueues a market reduce through the protection
//! manager.

pub mod state;
pub mod types;

pub use state::EngineProjections;
pub use types::{
    EngineHealth, PositionDetail, PositionSummary, StreamHealth, TrancheView,
};
