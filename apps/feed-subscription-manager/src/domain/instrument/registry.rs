//! Instrument Registry
//!
//! Loads the instrument catalog once and answers lookups without locking.
//!
//! # Catalog Format
//!
//! One JSON object per line:
//!
//! ```text
//! {"instrument_token":256265,"tradingsymbol":"NIFTY 50","name":"NIFTY","exchange":"NSE","segment":"INDICES","instrument_type":"EQ"}
//! {"instrument_token":1001,"tradingsymbol":"NIFTY26OCT24500CE","name":"NIFTY","exchange":"NFO","segment":"NFO-OPT","instrument_type":"CE","expiry":"2026-10-29","strike":"24500","lot_size":75}
//! ```
//!
//! Malformed rows are skipped and counted. A catalog that yields no rows at
//! all is a fatal error.

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;

use super::{InstrumentKind, InstrumentRecord, OptionRight, SubscriptionKey};

// =============================================================================
// Errors & Reports
// =============================================================================

/// Fatal catalog load errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Catalog could not be read.
    #[error("failed to read instrument catalog: {0}")]
    Io(#[from] std::io::Error),

    /// Catalog contained no usable rows.
    #[error("instrument catalog is empty ({skipped} malformed rows skipped)")]
    Empty {
        /// Rows that were rejected.
        skipped: usize,
    },
}

/// Outcome of a catalog load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Rows accepted into the registry.
    pub loaded: usize,
    /// Malformed or duplicate rows skipped.
    pub skipped: usize,
}

// =============================================================================
// Catalog Row
// =============================================================================

#[derive(Debug, Deserialize)]
struct CatalogRow {
    instrument_token: u64,
    tradingsymbol: String,
    #[serde(default)]
    name: Option<String>,
    exchange: String,
    #[serde(default)]
    segment: String,
    instrument_type: String,
    #[serde(default)]
    expiry: Option<NaiveDate>,
    #[serde(default)]
    strike: Option<Decimal>,
    #[serde(default)]
    lot_size: Option<u32>,
    #[serde(default)]
    strike_step: Option<Decimal>,
}

impl TryFrom<CatalogRow> for InstrumentRecord {
    type Error = String;

    fn try_from(row: CatalogRow) -> Result<Self, Self::Error> {
        let (kind, option_right) = match row.instrument_type.to_uppercase().as_str() {
            "EQ" if row.segment.eq_ignore_ascii_case("INDICES") => (InstrumentKind::Index, None),
            "EQ" => (InstrumentKind::Equity, None),
            "INDEX" => (InstrumentKind::Index, None),
            "FUT" => (InstrumentKind::Future, None),
            "CE" => (InstrumentKind::Option, Some(OptionRight::Call)),
            "PE" => (InstrumentKind::Option, Some(OptionRight::Put)),
            other => return Err(format!("unknown instrument_type {other:?}")),
        };

        let name = row.name.filter(|n| !n.trim().is_empty());
        let underlying = match kind {
            InstrumentKind::Equity => row.tradingsymbol.clone(),
            InstrumentKind::Index => name.unwrap_or_else(|| row.tradingsymbol.clone()),
            InstrumentKind::Future | InstrumentKind::Option => {
                name.ok_or_else(|| "derivative without underlying name".to_string())?
            }
        };

        if kind.is_derivative() && row.expiry.is_none() {
            return Err("derivative without expiry".to_string());
        }

        let strike = match kind {
            InstrumentKind::Option => match row.strike {
                Some(strike) if strike > Decimal::ZERO => Some(strike.normalize()),
                _ => return Err("option without positive strike".to_string()),
            },
            _ => None,
        };

        Ok(Self {
            instrument_token: row.instrument_token,
            tradingsymbol: row.tradingsymbol,
            underlying,
            exchange: row.exchange,
            segment: row.segment,
            kind,
            expiry: if kind.is_derivative() { row.expiry } else { None },
            strike,
            option_right,
            lot_size: row.lot_size.unwrap_or(1).max(1),
            strike_step: row.strike_step.filter(|s| *s > Decimal::ZERO),
        })
    }
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Debug, Default)]
struct UnderlyingInfo {
    records: Vec<usize>,
    expiries: Vec<NaiveDate>,
    strike_step: Option<Decimal>,
    fno_eligible: bool,
    is_index: bool,
}

/// Read-only instrument catalog.
///
/// Built once at startup and shared as `Arc<InstrumentRegistry>`. Nothing
/// mutates it after construction, so concurrent reads need no lock.
#[derive(Debug)]
pub struct InstrumentRegistry {
    records: Vec<InstrumentRecord>,
    by_key: HashMap<SubscriptionKey, usize>,
    by_tradingsymbol: HashMap<String, usize>,
    underlyings: HashMap<String, UnderlyingInfo>,
}

impl InstrumentRegistry {
    /// Load a JSON Lines catalog from disk.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` if the file cannot be read or yields no rows.
    pub fn from_path(path: impl AsRef<Path>) -> Result<(Self, LoadReport), RegistryError> {
        let file = File::open(path.as_ref())?;
        Self::load(BufReader::new(file))
    }

    /// Parse a JSON Lines catalog.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` on read failure or when no row is usable.
    pub fn load<R: BufRead>(reader: R) -> Result<(Self, LoadReport), RegistryError> {
        let mut records = Vec::new();
        let mut skipped = 0usize;

        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let parsed = serde_json::from_str::<CatalogRow>(&line)
                .map_err(|e| e.to_string())
                .and_then(InstrumentRecord::try_from);

            match parsed {
                Ok(record) => records.push(record),
                Err(reason) => {
                    skipped += 1;
                    tracing::debug!(line = line_no + 1, %reason, "Skipping catalog row");
                }
            }
        }

        let registry = Self::build(records, &mut skipped);
        if registry.is_empty() {
            return Err(RegistryError::Empty { skipped });
        }

        let report = LoadReport {
            loaded: registry.len(),
            skipped,
        };
        tracing::info!(
            loaded = report.loaded,
            skipped = report.skipped,
            underlyings = registry.underlyings.len(),
            "Instrument catalog loaded"
        );
        Ok((registry, report))
    }

    /// Build a registry from already-parsed records.
    ///
    /// Duplicate keys keep the first record.
    #[must_use]
    pub fn from_records(records: Vec<InstrumentRecord>) -> Self {
        let mut skipped = 0;
        Self::build(records, &mut skipped)
    }

    fn build(candidates: Vec<InstrumentRecord>, skipped: &mut usize) -> Self {
        let mut records = Vec::with_capacity(candidates.len());
        let mut by_key = HashMap::with_capacity(candidates.len());
        let mut by_tradingsymbol = HashMap::with_capacity(candidates.len());

        for record in candidates {
            let key = record.subscription_key();
            if by_key.contains_key(&key) {
                *skipped += 1;
                continue;
            }
            let idx = records.len();
            by_key.insert(key, idx);
            by_tradingsymbol
                .entry(record.tradingsymbol.clone())
                .or_insert(idx);
            records.push(record);
        }

        let mut underlyings: HashMap<String, UnderlyingInfo> = HashMap::new();
        let mut strikes: HashMap<(String, NaiveDate), BTreeSet<Decimal>> = HashMap::new();

        for (idx, record) in records.iter().enumerate() {
            let info = underlyings.entry(record.underlying.clone()).or_default();
            info.records.push(idx);
            info.fno_eligible |= record.kind.is_derivative();
            info.is_index |= record.kind == InstrumentKind::Index;

            if let Some(step) = record.strike_step {
                info.strike_step = Some(info.strike_step.map_or(step, |s| s.min(step)));
            }
            if let Some(expiry) = record.expiry {
                info.expiries.push(expiry);
            }
            if let (Some(expiry), Some(strike)) = (record.expiry, record.strike) {
                strikes
                    .entry((record.underlying.clone(), expiry))
                    .or_default()
                    .insert(strike);
            }
        }

        let mut derived: HashMap<String, Decimal> = HashMap::new();
        for ((underlying, _), set) in &strikes {
            let gap = set
                .iter()
                .zip(set.iter().skip(1))
                .map(|(a, b)| *b - *a)
                .filter(|g| *g > Decimal::ZERO)
                .min();
            if let Some(gap) = gap {
                derived
                    .entry(underlying.clone())
                    .and_modify(|g| *g = (*g).min(gap))
                    .or_insert(gap);
            }
        }

        for (name, info) in &mut underlyings {
            info.expiries.sort_unstable();
            info.expiries.dedup();
            if info.strike_step.is_none() {
                info.strike_step = derived.get(name).copied();
            }
        }

        Self {
            records,
            by_key,
            by_tradingsymbol,
            underlyings,
        }
    }

    /// All records for an underlying.
    #[must_use]
    pub fn lookup(&self, underlying: &str) -> Vec<&InstrumentRecord> {
        self.underlyings
            .get(underlying)
            .map(|info| info.records.iter().map(|&i| &self.records[i]).collect())
            .unwrap_or_default()
    }

    /// Record streamed by a subscription key.
    #[must_use]
    pub fn resolve(&self, key: &SubscriptionKey) -> Option<&InstrumentRecord> {
        self.by_key.get(key).map(|&i| &self.records[i])
    }

    /// Record by exchange trading symbol.
    #[must_use]
    pub fn by_tradingsymbol(&self, tradingsymbol: &str) -> Option<&InstrumentRecord> {
        self.by_tradingsymbol
            .get(tradingsymbol)
            .map(|&i| &self.records[i])
    }

    /// Strike step for an underlying's options.
    #[must_use]
    pub fn strike_step(&self, underlying: &str) -> Option<Decimal> {
        self.underlyings.get(underlying).and_then(|i| i.strike_step)
    }

    /// Whether the underlying has futures or options listed.
    #[must_use]
    pub fn is_fno_eligible(&self, underlying: &str) -> bool {
        self.underlyings
            .get(underlying)
            .is_some_and(|i| i.fno_eligible)
    }

    /// Whether the underlying is an index.
    #[must_use]
    pub fn is_index(&self, underlying: &str) -> bool {
        self.underlyings.get(underlying).is_some_and(|i| i.is_index)
    }

    /// Sorted unique expiries for an underlying.
    #[must_use]
    pub fn expiries(&self, underlying: &str) -> Vec<NaiveDate> {
        self.underlyings
            .get(underlying)
            .map(|i| i.expiries.clone())
            .unwrap_or_default()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the registry holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use rust_decimal_macros::dec;

    use super::*;

    const CATALOG: &str = r#"
{"instrument_token":256265,"tradingsymbol":"NIFTY 50","name":"NIFTY","exchange":"NSE","segment":"INDICES","instrument_type":"EQ"}
{"instrument_token":738561,"tradingsymbol":"RELIANCE","name":"RELIANCE INDUSTRIES","exchange":"NSE","segment":"NSE","instrument_type":"EQ"}
{"instrument_token":5001,"tradingsymbol":"RELIANCE26OCT2640CE","name":"RELIANCE","exchange":"NFO","segment":"NFO-OPT","instrument_type":"CE","expiry":"2026-10-29","strike":"2640","lot_size":500}
{"instrument_token":5002,"tradingsymbol":"RELIANCE26OCT2650CE","name":"RELIANCE","exchange":"NFO","segment":"NFO-OPT","instrument_type":"CE","expiry":"2026-10-29","strike":"2650","lot_size":500}
{"instrument_token":5003,"tradingsymbol":"RELIANCE26OCT2660PE","name":"RELIANCE","exchange":"NFO","segment":"NFO-OPT","instrument_type":"PE","expiry":"2026-10-29","strike":"2660","lot_size":500}
{"instrument_token":5004,"tradingsymbol":"RELIANCE26NOVFUT","name":"RELIANCE","exchange":"NFO","segment":"NFO-FUT","instrument_type":"FUT","expiry":"2026-11-26","lot_size":500}
{"instrument_token":6001,"tradingsymbol":"NIFTY26OCT24500CE","name":"NIFTY","exchange":"NFO","segment":"NFO-OPT","instrument_type":"CE","expiry":"2026-10-29","strike":"24500","strike_step":"50"}
not json at all
{"instrument_token":7001,"tradingsymbol":"BROKEN","name":"BROKEN","exchange":"NFO","segment":"NFO-OPT","instrument_type":"CE","strike":"100"}
{"instrument_token":7002,"tradingsymbol":"WEIRD","exchange":"NSE","instrument_type":"XX"}
"#;

    fn registry() -> (InstrumentRegistry, LoadReport) {
        InstrumentRegistry::load(Cursor::new(CATALOG)).unwrap()
    }

    #[test]
    fn malformed_rows_are_counted_not_fatal() {
        let (_, report) = registry();
        assert_eq!(report.loaded, 7);
        assert_eq!(report.skipped, 3);
    }

    #[test]
    fn empty_catalog_is_fatal() {
        let err = InstrumentRegistry::load(Cursor::new("garbage\n\n")).unwrap_err();
        assert!(matches!(err, RegistryError::Empty { skipped: 1 }));
    }

    #[test]
    fn lookup_by_underlying() {
        let (registry, _) = registry();
        assert_eq!(registry.lookup("RELIANCE").len(), 5);
        assert!(registry.lookup("UNKNOWN").is_empty());
    }

    #[test]
    fn strike_step_derived_from_gaps() {
        let (registry, _) = registry();
        assert_eq!(registry.strike_step("RELIANCE"), Some(dec!(10)));
    }

    #[test]
    fn explicit_strike_step_wins() {
        let (registry, _) = registry();
        assert_eq!(registry.strike_step("NIFTY"), Some(dec!(50)));
    }

    #[test]
    fn expiries_sorted_unique() {
        let (registry, _) = registry();
        assert_eq!(
            registry.expiries("RELIANCE"),
            vec![
                NaiveDate::from_ymd_opt(2026, 10, 29).unwrap(),
                NaiveDate::from_ymd_opt(2026, 11, 26).unwrap(),
            ]
        );
    }

    #[test]
    fn eligibility_and_index_flags() {
        let (registry, _) = registry();
        assert!(registry.is_fno_eligible("RELIANCE"));
        assert!(registry.is_index("NIFTY"));
        assert!(!registry.is_index("RELIANCE"));
    }

    #[test]
    fn resolve_option_key() {
        let (registry, _) = registry();
        let key = SubscriptionKey::option(
            "RELIANCE",
            NaiveDate::from_ymd_opt(2026, 10, 29).unwrap(),
            dec!(2650.0),
            OptionRight::Call,
        );
        assert_eq!(registry.resolve(&key).unwrap().instrument_token, 5002);
        assert_eq!(
            registry.by_tradingsymbol("NIFTY 50").unwrap().kind,
            InstrumentKind::Index
        );
    }
}
