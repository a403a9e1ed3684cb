//! Port Interfaces
//!
//! Contracts between the subscription core and the systems around it,
//! following the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - `WatchlistRepository`: `watchlist` rows
//! - `SubscriptionLogRepository`: append-only `subscription_log`
//! - `RunMarkerStore`: last end-of-day run date
//! - `FeedTransport`: fire-and-forget upstream subscribe/unsubscribe

mod feed_transport;
mod run_marker;
mod subscription_log;
mod watchlist_repository;

pub use feed_transport::{FeedTransport, NoOpFeedTransport};
pub use run_marker::RunMarkerStore;
pub use subscription_log::SubscriptionLogRepository;
pub use watchlist_repository::WatchlistRepository;

use crate::domain::errors::SubscriptionError;

/// Errors from persistence adapters.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Storage I/O failed.
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data could not be (de)serialized.
    #[error("stored data is malformed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A unique constraint was violated.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<PersistenceError> for SubscriptionError {
    fn from(err: PersistenceError) -> Self {
        Self::Persistence(err.to_string())
    }
}
