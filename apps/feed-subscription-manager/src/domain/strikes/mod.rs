//! ATM / Strike Window Engine
//!
//! Computes the at-the-money strike and the symmetric strike window for an
//! option chain, memoized per `(underlying, expiry)`.
//!
//! # Stability
//!
//! A cached window is only recomputed when it is missing or expired, when the
//! price has moved at least one strike step from the price the window was
//! computed at, when the window radius changes, or when the caller forces
//! it. Ticks never trigger a recompute on their own, so the subscribed strike
//! set stays stable while the underlying drifts inside a step.
//!
//! # Rounding
//!
//! `atm = round(ltp / step) * step` with midpoint-away-from-zero rounding.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::domain::errors::SubscriptionError;
use crate::domain::instrument::InstrumentRegistry;

// =============================================================================
// Configuration
// =============================================================================

/// Window sizing for the two option classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrikeWindowConfig {
    /// Strikes above and below ATM for index options.
    pub index_radius: usize,
    /// Strikes above and below ATM for single-stock options.
    pub stock_radius: usize,
    /// Time-to-live for cached windows.
    pub cache_ttl: Duration,
}

impl Default for StrikeWindowConfig {
    fn default() -> Self {
        Self {
            index_radius: 50,
            stock_radius: 12,
            cache_ttl: Duration::from_secs(300),
        }
    }
}

/// Option class, which selects the window radius.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionClass {
    /// Index options (wide window).
    Index,
    /// Single-stock options (narrow window).
    Stock,
}

// =============================================================================
// Window & Cache Entry
// =============================================================================

/// ATM strike, step and the generated strike list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrikeWindow {
    /// At-the-money strike.
    pub atm: Decimal,
    /// Strike step.
    pub step: Decimal,
    /// Strikes in ascending order, ATM included.
    pub strikes: Vec<Decimal>,
}

impl StrikeWindow {
    /// Compute a window around `last_price`.
    ///
    /// Strikes that would be zero or negative are dropped.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInstrument` when the price or step is not positive.
    pub fn compute(
        symbol: &str,
        last_price: Decimal,
        step: Decimal,
        radius: usize,
    ) -> Result<Self, SubscriptionError> {
        if step <= Decimal::ZERO {
            return Err(SubscriptionError::invalid(symbol, "strike step must be positive"));
        }
        if last_price <= Decimal::ZERO {
            return Err(SubscriptionError::invalid(symbol, "last price must be positive"));
        }

        let atm = (last_price / step)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            * step;
        let atm = atm.normalize();

        let radius = i64::try_from(radius).unwrap_or(i64::MAX);
        let strikes = (-radius..=radius)
            .map(|offset| (atm + step * Decimal::from(offset)).normalize())
            .filter(|strike| *strike > Decimal::ZERO)
            .collect();

        Ok(Self {
            atm,
            step: step.normalize(),
            strikes,
        })
    }
}

/// Memoized window for one `(underlying, expiry)`.
///
/// Always replaced whole; never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AtmCacheEntry {
    /// Underlying symbol.
    pub underlying: String,
    /// Option expiry.
    pub expiry: NaiveDate,
    /// Price the window was computed from.
    pub basis_price: Decimal,
    /// Window radius used.
    pub radius: usize,
    /// Computed window.
    pub window: StrikeWindow,
    /// When the window was computed.
    pub computed_at: DateTime<Utc>,
}

/// Request for [`AtmEngine::strike_window`].
#[derive(Debug, Clone)]
pub struct StrikeWindowRequest<'a> {
    /// Underlying symbol.
    pub underlying: &'a str,
    /// Option expiry.
    pub expiry: NaiveDate,
    /// Latest underlying price.
    pub last_price: Decimal,
    /// Option class.
    pub class: OptionClass,
    /// Recompute even if the cached window is still valid.
    pub force: bool,
}

// =============================================================================
// Engine
// =============================================================================

type CacheKey = (String, NaiveDate);

/// Strike window calculator with a TTL cache.
///
/// Readers clone an `Arc` out of the map under a short read lock; a
/// recompute builds the new entry first and swaps it in under the write
/// lock. The cache is not guarded by the subscription mutation lock.
#[derive(Debug)]
pub struct AtmEngine {
    registry: Arc<InstrumentRegistry>,
    config: StrikeWindowConfig,
    cache: RwLock<HashMap<CacheKey, Arc<AtmCacheEntry>>>,
}

impl AtmEngine {
    /// Create an engine over the given registry.
    #[must_use]
    pub fn new(registry: Arc<InstrumentRegistry>, config: StrikeWindowConfig) -> Self {
        Self {
            registry,
            config,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Window radius for an option class.
    #[must_use]
    pub const fn radius(&self, class: OptionClass) -> usize {
        match class {
            OptionClass::Index => self.config.index_radius,
            OptionClass::Stock => self.config.stock_radius,
        }
    }

    /// Strike window for an underlying/expiry, served from cache when valid.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInstrument` for unknown underlyings, underlyings with
    /// no strike step, or non-positive prices.
    pub fn strike_window(
        &self,
        request: &StrikeWindowRequest<'_>,
    ) -> Result<Arc<AtmCacheEntry>, SubscriptionError> {
        self.strike_window_at(request, Utc::now())
    }

    /// [`strike_window`](Self::strike_window) with an explicit clock.
    ///
    /// # Errors
    ///
    /// Same as [`strike_window`](Self::strike_window).
    pub fn strike_window_at(
        &self,
        request: &StrikeWindowRequest<'_>,
        now: DateTime<Utc>,
    ) -> Result<Arc<AtmCacheEntry>, SubscriptionError> {
        let radius = self.radius(request.class);
        let key = (request.underlying.to_string(), request.expiry);

        if !request.force
            && let Some(entry) = self.cache.read().get(&key)
            && !self.is_stale(entry, request.last_price, radius, now)
        {
            return Ok(Arc::clone(entry));
        }

        let step = self.registry.strike_step(request.underlying).ok_or_else(|| {
            SubscriptionError::invalid(request.underlying, "no strike step in registry")
        })?;
        let window = StrikeWindow::compute(request.underlying, request.last_price, step, radius)?;

        let entry = Arc::new(AtmCacheEntry {
            underlying: request.underlying.to_string(),
            expiry: request.expiry,
            basis_price: request.last_price,
            radius,
            window,
            computed_at: now,
        });

        tracing::debug!(
            underlying = request.underlying,
            expiry = %request.expiry,
            atm = %entry.window.atm,
            strikes = entry.window.strikes.len(),
            "ATM window recomputed"
        );

        self.cache.write().insert(key, Arc::clone(&entry));
        Ok(entry)
    }

    /// Whether a request at `new_price` would recompute the cached window.
    #[must_use]
    pub fn should_recompute(
        &self,
        underlying: &str,
        expiry: NaiveDate,
        new_price: Decimal,
        class: OptionClass,
        now: DateTime<Utc>,
    ) -> bool {
        let key = (underlying.to_string(), expiry);
        self.cache.read().get(&key).is_none_or(|entry| {
            self.is_stale(entry, new_price, self.radius(class), now)
        })
    }

    /// Cached entry, if any (ignores TTL).
    #[must_use]
    pub fn cached(&self, underlying: &str, expiry: NaiveDate) -> Option<Arc<AtmCacheEntry>> {
        self.cache
            .read()
            .get(&(underlying.to_string(), expiry))
            .cloned()
    }

    /// Drop every cached window for an underlying.
    ///
    /// Returns the number of entries removed.
    pub fn invalidate(&self, underlying: &str) -> usize {
        let mut cache = self.cache.write();
        let before = cache.len();
        cache.retain(|(u, _), _| u != underlying);
        before - cache.len()
    }

    /// Drop all cached windows.
    pub fn clear(&self) {
        self.cache.write().clear();
    }

    fn is_stale(
        &self,
        entry: &AtmCacheEntry,
        new_price: Decimal,
        radius: usize,
        now: DateTime<Utc>,
    ) -> bool {
        let age = now.signed_duration_since(entry.computed_at);
        let ttl = chrono::Duration::from_std(self.config.cache_ttl).unwrap_or(chrono::Duration::MAX);

        age >= ttl
            || entry.radius != radius
            || (new_price - entry.basis_price).abs() >= entry.window.step
    }
}
