//! Persistence Adapters
//!
//! Implementations of the repository and marker-store ports.

pub mod file_marker;
pub mod in_memory;

pub use file_marker::FileRunMarkerStore;
pub use in_memory::{InMemoryRunMarkerStore, InMemorySubscriptionLog, InMemoryWatchlistRepository};
