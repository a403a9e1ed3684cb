//! Application Layer - Use cases and port definitions.
//!
//! Services here serialize every mutation through the ledger lock and talk
//! to storage and the feed only through ports.

/// Port interfaces for storage and the upstream feed.
pub mod ports;

/// Watchlist orchestration and session scheduling.
pub mod services;
