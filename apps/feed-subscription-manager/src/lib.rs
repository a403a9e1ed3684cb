#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Feed Subscription Manager - Two-Tier Market Data Subscriptions
//!
//! Streams live ticks for a capacity-constrained instrument universe over a
//! small fixed pool of upstream WebSocket connections, while users add and
//! remove underlyings from personal watchlists without the pool ever
//! exceeding the provider's subscription ceiling.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: pure bookkeeping
//!   - `instrument`: catalog and subscription keys
//!   - `strikes`: ATM and strike windows
//!   - `pool`: connection slots and load balancing
//!   - `ledger`: tiers, capacity and eviction
//!   - `watchlist`: entries and chain expansion
//!
//! - **Application**: use cases and port definitions
//!   - `ports`: watchlist/log repositories, run marker, feed transport
//!   - `services`: `WatchlistService`, `SessionScheduler`
//!
//! - **Infrastructure**: adapters
//!   - `feed`: WebSocket clients, reconnect policy, command transport
//!   - `broadcast`: tick fan-out
//!   - `persistence`: in-memory and file adapters
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//! user add/remove ──► WatchlistService ──► SubscriptionLedger ──► ConnectionPool
//!                            │                                        │
//!                            └──► FeedTransport ──► FeedClient[0..N] ◄┘
//!                                                        │
//!                                  upstream ticks ──► TickHub ──► price cache
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Subscription bookkeeping with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::errors::SubscriptionError;
pub use domain::instrument::{InstrumentRecord, InstrumentRegistry, SubscriptionKey};
pub use domain::ledger::{SubscriptionChanges, SubscriptionLedger, Tier};
pub use domain::pool::{ConnectionEvent, ConnectionId, ConnectionPool};
pub use domain::strikes::{AtmEngine, StrikeWindow, StrikeWindowConfig};
pub use domain::watchlist::{InstrumentType, WatchlistEntry};

// Services
pub use application::services::{AddWatchlistRequest, SessionScheduler, WatchlistService};

// Infrastructure config
pub use infrastructure::config::{ConfigError, ServiceConfig};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
