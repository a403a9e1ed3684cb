//! Instrument Types
//!
//! Catalog rows and the composite key every subscription map is keyed by.

mod registry;

use std::fmt;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub use registry::{InstrumentRegistry, LoadReport, RegistryError};

// =============================================================================
// Instrument Kind
// =============================================================================

/// What an instrument row represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    /// Cash equity.
    Equity,
    /// Index spot value (not tradeable, streamable).
    Index,
    /// Futures contract.
    Future,
    /// Options contract.
    Option,
}

impl InstrumentKind {
    /// Whether this kind is a derivative (carries an expiry).
    #[must_use]
    pub const fn is_derivative(self) -> bool {
        matches!(self, Self::Future | Self::Option)
    }
}

/// Call or put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OptionRight {
    /// Call option.
    #[serde(rename = "CE")]
    Call,
    /// Put option.
    #[serde(rename = "PE")]
    Put,
}

impl OptionRight {
    /// Exchange suffix for the right.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Call => "CE",
            Self::Put => "PE",
        }
    }
}

// =============================================================================
// Instrument Record
// =============================================================================

/// Immutable catalog row, owned by the [`InstrumentRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstrumentRecord {
    /// Upstream feed token used in subscribe/unsubscribe frames.
    pub instrument_token: u64,
    /// Exchange trading symbol (e.g. `NIFTY26OCT24500CE`).
    pub tradingsymbol: String,
    /// Underlying name the record belongs to.
    pub underlying: String,
    /// Exchange code.
    pub exchange: String,
    /// Exchange segment.
    pub segment: String,
    /// Instrument kind.
    pub kind: InstrumentKind,
    /// Expiry for derivatives.
    pub expiry: Option<NaiveDate>,
    /// Strike for options.
    pub strike: Option<Decimal>,
    /// Call/put for options.
    pub option_right: Option<OptionRight>,
    /// Contract lot size.
    pub lot_size: u32,
    /// Strike step declared on the row, if any.
    pub strike_step: Option<Decimal>,
}

impl InstrumentRecord {
    /// The subscription key that streams this record.
    #[must_use]
    pub fn subscription_key(&self) -> SubscriptionKey {
        match (self.kind, self.expiry, self.strike, self.option_right) {
            (InstrumentKind::Option, Some(expiry), Some(strike), Some(right)) => {
                SubscriptionKey::option(&self.underlying, expiry, strike, right)
            }
            (InstrumentKind::Future, Some(expiry), _, _) => {
                SubscriptionKey::future(&self.underlying, expiry)
            }
            _ => SubscriptionKey::spot(&self.tradingsymbol),
        }
    }
}

// =============================================================================
// Subscription Key
// =============================================================================

/// Value type uniquely identifying one streamable instrument.
///
/// Options are keyed by `(underlying, expiry, strike, right)`, futures by
/// `(underlying, expiry)` and spot instruments by trading symbol alone.
/// Strikes are normalized so `24500` and `24500.00` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    symbol: String,
    expiry: Option<NaiveDate>,
    strike: Option<Decimal>,
    right: Option<OptionRight>,
}

impl SubscriptionKey {
    /// Key for an equity or index spot instrument.
    pub fn spot(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            expiry: None,
            strike: None,
            right: None,
        }
    }

    /// Key for a futures contract.
    pub fn future(underlying: impl Into<String>, expiry: NaiveDate) -> Self {
        Self {
            symbol: underlying.into(),
            expiry: Some(expiry),
            strike: None,
            right: None,
        }
    }

    /// Key for an options contract.
    pub fn option(
        underlying: impl Into<String>,
        expiry: NaiveDate,
        strike: Decimal,
        right: OptionRight,
    ) -> Self {
        Self {
            symbol: underlying.into(),
            expiry: Some(expiry),
            strike: Some(strike.normalize()),
            right: Some(right),
        }
    }

    /// Symbol or underlying.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Expiry, for derivatives.
    #[must_use]
    pub const fn expiry(&self) -> Option<NaiveDate> {
        self.expiry
    }

    /// Strike, for options.
    #[must_use]
    pub const fn strike(&self) -> Option<Decimal> {
        self.strike
    }

    /// Right, for options.
    #[must_use]
    pub const fn right(&self) -> Option<OptionRight> {
        self.right
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.symbol)?;
        if let Some(expiry) = self.expiry {
            write!(f, " {expiry}")?;
        }
        match (self.strike, self.right) {
            (Some(strike), Some(right)) => write!(f, " {strike} {}", right.as_str()),
            _ if self.expiry.is_some() => f.write_str(" FUT"),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rust_decimal_macros::dec;

    use super::*;

    fn expiry() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 29).unwrap()
    }

    #[test]
    fn strike_scale_does_not_change_identity() {
        let a = SubscriptionKey::option("NIFTY", expiry(), dec!(24500), OptionRight::Call);
        let b = SubscriptionKey::option("NIFTY", expiry(), dec!(24500.00), OptionRight::Call);
        assert_eq!(a, b);

        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn call_and_put_are_distinct() {
        let call = SubscriptionKey::option("NIFTY", expiry(), dec!(24500), OptionRight::Call);
        let put = SubscriptionKey::option("NIFTY", expiry(), dec!(24500), OptionRight::Put);
        assert_ne!(call, put);
    }

    #[test]
    fn display_formats() {
        assert_eq!(SubscriptionKey::spot("RELIANCE").to_string(), "RELIANCE");
        assert_eq!(
            SubscriptionKey::future("NIFTY", expiry()).to_string(),
            "NIFTY 2026-10-29 FUT"
        );
        assert_eq!(
            SubscriptionKey::option("NIFTY", expiry(), dec!(24500), OptionRight::Put).to_string(),
            "NIFTY 2026-10-29 24500 PE"
        );
    }

    #[test]
    fn record_key_follows_kind() {
        let record = InstrumentRecord {
            instrument_token: 1,
            tradingsymbol: "NIFTY26OCTFUT".to_string(),
            underlying: "NIFTY".to_string(),
            exchange: "NFO".to_string(),
            segment: "NFO-FUT".to_string(),
            kind: InstrumentKind::Future,
            expiry: Some(expiry()),
            strike: None,
            option_right: None,
            lot_size: 75,
            strike_step: None,
        };
        assert_eq!(
            record.subscription_key(),
            SubscriptionKey::future("NIFTY", expiry())
        );
    }
}
