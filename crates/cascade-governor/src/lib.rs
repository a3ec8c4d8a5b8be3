//! Rate governor: admission control for outbound venue requests.
//!
//! Tracks two sliding one-minute windows (request weight and order count),
//! computes exact per-endpoint weights, reserves a slice of capacity for
//! critical requests, and absorbs 429/418 responses. Purely an admission
//! controller; it never performs I/O itself.

pub mod error;
pub mod governor;
pub mod weights;

pub use error::{GovernorError, GovernorResult};
pub use governor::{AdmitDecision, GovernorConfig, GovernorMode, GovernorStats, Priority, RateGovernor};
pub use weights::Endpoint;
