//! Domain Layer - Subscription bookkeeping and instrument types.
//!
//! Pure, synchronous types with no I/O. Everything here is driven by the
//! application services behind a single mutation lock.

/// Error taxonomy.
pub mod errors;

/// Instrument catalog, records and subscription keys.
pub mod instrument;

/// Subscription ledger with tiering and eviction.
pub mod ledger;

/// Fixed connection pool and load balancing.
pub mod pool;

/// ATM strike and strike window computation.
pub mod strikes;

/// Watchlist entries and chain expansion.
pub mod watchlist;
