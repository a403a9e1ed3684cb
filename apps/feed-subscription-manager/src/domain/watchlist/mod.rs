//! Watchlist Types
//!
//! Per-user watchlist entries and the expansion of an entry into the
//! subscription keys it streams.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::instrument::{OptionRight, SubscriptionKey};
use crate::domain::strikes::{OptionClass, StrikeWindow};

/// How a watchlist entry expands into instruments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstrumentType {
    /// Index option chain (wide strike window).
    IndexOption,
    /// Single-stock option chain (narrow strike window).
    StockOption,
    /// Single futures contract.
    Future,
    /// Cash equity or index spot.
    Equity,
}

impl InstrumentType {
    /// Option class for chain types.
    #[must_use]
    pub const fn option_class(self) -> Option<OptionClass> {
        match self {
            Self::IndexOption => Some(OptionClass::Index),
            Self::StockOption => Some(OptionClass::Stock),
            Self::Future | Self::Equity => None,
        }
    }

    /// Whether an expiry is required.
    #[must_use]
    pub const fn requires_expiry(self) -> bool {
        !matches!(self, Self::Equity)
    }
}

/// One `watchlist` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchlistEntry {
    /// Owning user.
    pub user_id: String,
    /// Underlying symbol.
    pub underlying: String,
    /// Expiry; `None` for equities.
    pub expiry: Option<NaiveDate>,
    /// Classification.
    pub instrument_type: InstrumentType,
    /// When the entry was added.
    pub added_at: DateTime<Utc>,
    /// Insertion sequence; also the subscription group id.
    pub added_order: u64,
    /// Strike window the chain was built from, kept so the chain can be
    /// rebuilt after a restart without a fresh price.
    pub window: Option<StrikeWindow>,
}

impl WatchlistEntry {
    /// Whether this entry is the `(user, underlying, expiry)` triple.
    #[must_use]
    pub fn matches(&self, user_id: &str, underlying: &str, expiry: Option<NaiveDate>) -> bool {
        self.user_id == user_id && self.underlying == underlying && self.expiry == expiry
    }
}

/// Expand an underlying into subscription keys.
///
/// Option types produce a call and a put per strike, in strike order.
/// Futures and equities produce one key. Option types without a window or
/// expiry produce nothing.
#[must_use]
pub fn chain_keys(
    underlying: &str,
    expiry: Option<NaiveDate>,
    instrument_type: InstrumentType,
    window: Option<&StrikeWindow>,
) -> Vec<SubscriptionKey> {
    match (instrument_type, expiry, window) {
        (InstrumentType::IndexOption | InstrumentType::StockOption, Some(expiry), Some(window)) => window
            .strikes
            .iter()
            .flat_map(|strike| {
                [OptionRight::Call, OptionRight::Put]
                    .map(|right| SubscriptionKey::option(underlying, expiry, *strike, right))
            })
            .collect(),
        (InstrumentType::Future, Some(expiry), _) => vec![SubscriptionKey::future(underlying, expiry)],
        (InstrumentType::Equity, _, _) => vec![SubscriptionKey::spot(underlying)],
        _ => Vec::new(),
    }
}
