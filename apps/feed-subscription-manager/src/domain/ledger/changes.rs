//! Side effects produced by ledger mutations.
//!
//! The ledger never talks to the network or the audit store. Each mutation
//! records what has to happen upstream and what has to be logged, and the
//! caller drains it once the mutation lock is about to be released.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::GroupId;
use crate::domain::pool::ConnectionId;

// =============================================================================
// Subscription Changes
// =============================================================================

/// Per-connection upstream subscribe/unsubscribe tokens.
///
/// Opposite operations on the same connection and token cancel out, so a
/// key that is subscribed and released inside one batch produces no
/// upstream traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionChanges {
    /// Tokens to subscribe, by connection.
    pub subscribe: BTreeMap<ConnectionId, BTreeSet<u64>>,
    /// Tokens to unsubscribe, by connection.
    pub unsubscribe: BTreeMap<ConnectionId, BTreeSet<u64>>,
}

impl SubscriptionChanges {
    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }

    /// Record that a token must be subscribed on a connection.
    pub fn record_subscribe(&mut self, connection: ConnectionId, token: u64) {
        if !take(&mut self.unsubscribe, connection, token) {
            self.subscribe.entry(connection).or_default().insert(token);
        }
    }

    /// Record that a token must be unsubscribed on a connection.
    pub fn record_unsubscribe(&mut self, connection: ConnectionId, token: u64) {
        if !take(&mut self.subscribe, connection, token) {
            self.unsubscribe.entry(connection).or_default().insert(token);
        }
    }

    /// Fold another batch into this one, in order.
    pub fn merge(&mut self, other: Self) {
        for (connection, tokens) in other.unsubscribe {
            for token in tokens {
                self.record_unsubscribe(connection, token);
            }
        }
        for (connection, tokens) in other.subscribe {
            for token in tokens {
                self.record_subscribe(connection, token);
            }
        }
    }

    /// Connections touched by this batch.
    #[must_use]
    pub fn connections(&self) -> BTreeSet<ConnectionId> {
        self.subscribe
            .keys()
            .chain(self.unsubscribe.keys())
            .copied()
            .collect()
    }

    /// Total number of token operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscribe.values().map(BTreeSet::len).sum::<usize>()
            + self.unsubscribe.values().map(BTreeSet::len).sum::<usize>()
    }
}

fn take(map: &mut BTreeMap<ConnectionId, BTreeSet<u64>>, connection: ConnectionId, token: u64) -> bool {
    let Some(tokens) = map.get_mut(&connection) else {
        return false;
    };
    let removed = tokens.remove(&token);
    if tokens.is_empty() {
        map.remove(&connection);
    }
    removed
}

// =============================================================================
// Audit
// =============================================================================

/// Audit trail action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    /// Instrument accepted into the ledger.
    Subscribe,
    /// Instrument released.
    Unsubscribe,
    /// Instrument released to make room.
    Evict,
    /// Instruments moved between connections.
    Rebalance,
    /// End-of-day summary.
    BulkClear,
}

impl AuditAction {
    /// Stable label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Evict => "EVICT",
            Self::Rebalance => "REBALANCE",
            Self::BulkClear => "BULK_CLEAR",
        }
    }
}

/// One `subscription_log` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// What happened.
    pub action: AuditAction,
    /// Instrument affected; `None` for summary rows.
    pub instrument_token: Option<u64>,
    /// Free-form reason.
    pub reason: String,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub(crate) fn new(action: AuditAction, instrument_token: Option<u64>, reason: impl Into<String>) -> Self {
        Self {
            action,
            instrument_token,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// Effects
// =============================================================================

/// Everything a batch of ledger mutations asks the outside world to do.
#[derive(Debug, Clone, Default)]
pub struct LedgerEffects {
    /// Upstream commands.
    pub feed: SubscriptionChanges,
    /// Audit rows, in order.
    pub audit: Vec<AuditEntry>,
    /// Watchlist groups removed by eviction, oldest first.
    pub evicted_groups: Vec<GroupId>,
    /// Instruments removed by eviction.
    pub evicted_instruments: usize,
}

impl LedgerEffects {
    /// Check if there is nothing to apply.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.feed.is_empty() && self.audit.is_empty() && self.evicted_groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opposite_operations_cancel() {
        let mut changes = SubscriptionChanges::default();
        changes.record_subscribe(0, 11);
        changes.record_unsubscribe(0, 11);
        assert!(changes.is_empty());

        changes.record_unsubscribe(1, 12);
        changes.record_subscribe(1, 12);
        assert!(changes.is_empty());
    }

    #[test]
    fn different_connections_do_not_cancel() {
        let mut changes = SubscriptionChanges::default();
        changes.record_unsubscribe(0, 11);
        changes.record_subscribe(1, 11);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes.connections(), BTreeSet::from([0, 1]));
    }

    #[test]
    fn merge_applies_in_order() {
        let mut first = SubscriptionChanges::default();
        first.record_subscribe(2, 7);

        let mut second = SubscriptionChanges::default();
        second.record_unsubscribe(2, 7);
        second.record_subscribe(3, 8);

        first.merge(second);
        assert!(first.unsubscribe.is_empty());
        assert_eq!(first.subscribe, BTreeMap::from([(3, BTreeSet::from([8]))]));
    }

    #[test]
    fn audit_labels() {
        assert_eq!(AuditAction::BulkClear.as_str(), "BULK_CLEAR");
        let json = serde_json::to_string(&AuditAction::Evict).unwrap();
        assert_eq!(json, "\"EVICT\"");
    }
}
