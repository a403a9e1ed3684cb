//! Subscription Errors
//!
//! Error taxonomy shared by the registry, ATM engine, connection pool,
//! ledger and watchlist orchestration.

use chrono::NaiveDate;

/// Errors returned by subscription operations.
///
/// Connection-level failures are recovered internally and only surface as
/// `ConnectionUnavailable` when no usable connection is left.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// Global or per-connection ceiling hit and eviction could not make room.
    #[error("capacity exceeded: {active} of {capacity} subscriptions in use")]
    CapacityExceeded {
        /// Active subscriptions at the time of rejection.
        active: usize,
        /// Ceiling that was hit.
        capacity: usize,
    },

    /// Watchlist entry already exists for this user.
    #[error("watchlist already contains {underlying} ({expiry:?}) for user {user_id}")]
    DuplicateEntry {
        /// User owning the entry.
        user_id: String,
        /// Underlying symbol.
        underlying: String,
        /// Expiry, if any.
        expiry: Option<NaiveDate>,
    },

    /// Unknown subscription or watchlist entry.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of thing that was looked up.
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// No connected slot with headroom.
    #[error("no feed connection available")]
    ConnectionUnavailable,

    /// Registry miss or malformed strike window request.
    #[error("invalid instrument {symbol}: {reason}")]
    InvalidInstrument {
        /// Symbol that was requested.
        symbol: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Repository failure.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl SubscriptionError {
    /// Build an `InvalidInstrument` error.
    pub fn invalid(symbol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInstrument {
            symbol: symbol.into(),
            reason: reason.into(),
        }
    }

    /// Stable label used for metrics and audit reasons.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::DuplicateEntry { .. } => "duplicate_entry",
            Self::NotFound { .. } => "not_found",
            Self::ConnectionUnavailable => "connection_unavailable",
            Self::InvalidInstrument { .. } => "invalid_instrument",
            Self::Persistence(_) => "persistence",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_message_includes_counts() {
        let err = SubscriptionError::CapacityExceeded {
            active: 25_000,
            capacity: 25_000,
        };
        assert_eq!(
            err.to_string(),
            "capacity exceeded: 25000 of 25000 subscriptions in use"
        );
        assert_eq!(err.kind(), "capacity_exceeded");
    }

    #[test]
    fn invalid_helper() {
        let err = SubscriptionError::invalid("XYZ", "unknown underlying");
        assert_eq!(err.to_string(), "invalid instrument XYZ: unknown underlying");
    }
}
