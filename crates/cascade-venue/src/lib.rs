//! Signed REST client for the futures venue.
//!
//! Every authenticated request carries an HMAC-SHA256 signature over the
//! canonical query string plus `timestamp` and `recvWindow`. All calls are
//! admitted through the rate governor first; quota headers on every
//! response are fed back to it. Errors map to a closed set with an explicit
//! retryable/fatal split.

pub mod client;
pub mod error;
pub mod signer;
pub mod spec_cache;
pub mod types;

pub use client::{HttpVenueClient, NewOrder, OrderType, VenueClient, VenueClientConfig};
pub use error::{VenueError, VenueResult};
pub use spec_cache::SpecCache;
pub use types::{AccountInfo, DepthSnapshot, OpenOrder, OrderAck, PositionRisk};
