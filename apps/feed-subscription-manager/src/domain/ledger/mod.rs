//! Subscription Ledger
//!
//! Capacity-aware bookkeeping for every active subscription.
//!
//! # Design
//!
//! The ledger is the single source of truth for what is subscribed and on
//! which connection. It owns the [`ConnectionPool`] and is only ever mutated
//! behind one lock, so a capacity check and the assignment that consumes
//! the capacity can never interleave with another mutation.
//!
//! On-demand subscriptions are owned by watchlist groups, keyed by the
//! entry's insertion sequence. A key shared by several groups stays active
//! until the last owning group releases it. Eviction removes whole groups,
//! oldest first, and never touches `AlwaysOn` subscriptions.
//!
//! Upstream commands and audit rows are buffered in [`LedgerEffects`] and
//! drained with [`SubscriptionLedger::take_effects`].

mod changes;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use changes::{AuditAction, AuditEntry, LedgerEffects, SubscriptionChanges};

use crate::domain::errors::SubscriptionError;
use crate::domain::instrument::SubscriptionKey;
use crate::domain::pool::{ConnectionId, ConnectionPool, ConnectionStatus, Reassignment};

/// Watchlist group id (the entry's insertion sequence).
pub type GroupId = u64;

// =============================================================================
// Tier
// =============================================================================

/// Whether a subscription may be evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    /// Pre-loaded; never evicted, untouched by end-of-day clear.
    AlwaysOn,
    /// Added from a watchlist; evictable.
    OnDemand,
}

impl Tier {
    /// Stable label for metrics and query strings.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AlwaysOn => "always_on",
            Self::OnDemand => "on_demand",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "always_on" => Ok(Self::AlwaysOn),
            "on_demand" => Ok(Self::OnDemand),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// One active subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    /// Instrument key.
    pub key: SubscriptionKey,
    /// Upstream feed token.
    pub instrument_token: u64,
    /// Tier, fixed at creation.
    pub tier: Tier,
    /// Owning connection; `None` while queued for reassignment.
    pub connection_id: Option<ConnectionId>,
    /// When the subscription was accepted.
    pub created_at: DateTime<Utc>,
    /// Ledger-wide acceptance order.
    pub sequence: u64,
    /// Watchlist groups holding this subscription (on-demand only).
    pub owners: BTreeSet<GroupId>,
}

/// Input to [`SubscriptionLedger::subscribe`].
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    /// Instrument key.
    pub key: SubscriptionKey,
    /// Upstream feed token.
    pub instrument_token: u64,
    /// Requested tier.
    pub tier: Tier,
    /// Owning watchlist group. Ungrouped on-demand keys are never evicted.
    pub group: Option<GroupId>,
}

/// Outcome of a rebalance or reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RebalanceReport {
    /// Instruments that changed connection (or left the queue).
    pub moved: usize,
    /// Instruments still queued without a connection.
    pub queued: usize,
}

/// Serializable ledger snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerStatus {
    /// Active subscriptions.
    pub active: usize,
    /// Active `AlwaysOn` subscriptions.
    pub always_on: usize,
    /// Active `OnDemand` subscriptions.
    pub on_demand: usize,
    /// Active subscriptions without a connection.
    pub pending: usize,
    /// Live watchlist groups.
    pub groups: usize,
    /// Global ceiling.
    pub global_capacity: usize,
    /// `active / global_capacity`.
    pub utilization: f64,
    /// Per-connection state.
    pub connections: Vec<ConnectionStatus>,
}

// =============================================================================
// Ledger
// =============================================================================

/// Capacity-aware subscription bookkeeping.
#[derive(Debug)]
pub struct SubscriptionLedger {
    pool: ConnectionPool,
    global_capacity: usize,
    subscriptions: HashMap<SubscriptionKey, Subscription>,
    groups: BTreeMap<GroupId, BTreeSet<SubscriptionKey>>,
    next_sequence: u64,
    effects: LedgerEffects,
}

impl SubscriptionLedger {
    /// Create a ledger over a pool with a global ceiling.
    ///
    /// The global ceiling is clamped to the pool's total capacity.
    #[must_use]
    pub fn new(pool: ConnectionPool, global_capacity: usize) -> Self {
        let global_capacity = global_capacity.min(pool.total_capacity());
        Self {
            pool,
            global_capacity,
            subscriptions: HashMap::new(),
            groups: BTreeMap::new(),
            next_sequence: 0,
            effects: LedgerEffects::default(),
        }
    }

    /// Accept a subscription, evicting older on-demand groups if needed.
    ///
    /// Re-subscribing an active key is idempotent: it returns the existing
    /// assignment and only records the extra owning group.
    ///
    /// # Errors
    ///
    /// - `CapacityExceeded` when the global or per-connection ceiling is hit
    ///   and eviction could not make room.
    /// - `ConnectionUnavailable` when no connection accepts assignments.
    pub fn subscribe(&mut self, request: SubscribeRequest) -> Result<Option<ConnectionId>, SubscriptionError> {
        let SubscribeRequest {
            key,
            instrument_token,
            tier,
            group,
        } = request;

        if let Some(existing) = self.subscriptions.get_mut(&key) {
            if existing.tier == Tier::OnDemand
                && let Some(group) = group
                && existing.owners.insert(group)
            {
                self.groups.entry(group).or_default().insert(key);
            }
            return Ok(existing.connection_id);
        }

        if self.pool.usable_count() == 0 {
            tracing::warn!(key = %key, tier = %tier, "No connection accepts assignments");
            return Err(SubscriptionError::ConnectionUnavailable);
        }

        // Queued instruments were accepted earlier and take freed capacity first.
        self.settle();

        if tier == Tier::OnDemand && self.needs_room() {
            self.check_room_after_eviction(group).inspect_err(|e| {
                tracing::warn!(key = %key, tier = %tier, error = %e, "Eviction cannot make room");
            })?;
            while self.needs_room() {
                let Some(victim) = self.oldest_group_except(group) else {
                    break;
                };
                self.evict_group(victim);
                self.settle();
            }
        }

        if self.subscriptions.len() >= self.global_capacity {
            tracing::warn!(
                key = %key,
                tier = %tier,
                active = self.subscriptions.len(),
                capacity = self.global_capacity,
                "Global subscription capacity reached"
            );
            return Err(SubscriptionError::CapacityExceeded {
                active: self.subscriptions.len(),
                capacity: self.global_capacity,
            });
        }

        let connection = self.pool.assign(key.clone()).inspect_err(|e| {
            tracing::warn!(key = %key, tier = %tier, error = %e, "No connection accepted subscription");
        })?;

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let mut owners = BTreeSet::new();
        if tier == Tier::OnDemand
            && let Some(group) = group
        {
            owners.insert(group);
            self.groups.entry(group).or_default().insert(key.clone());
        }

        tracing::debug!(key = %key, tier = %tier, connection_id = connection, "Subscribed");

        self.effects.feed.record_subscribe(connection, instrument_token);
        self.effects.audit.push(AuditEntry::new(
            AuditAction::Subscribe,
            Some(instrument_token),
            group.map_or_else(|| format!("tier={tier}"), |g| format!("tier={tier} group={g}")),
        ));

        self.subscriptions.insert(
            key.clone(),
            Subscription {
                key,
                instrument_token,
                tier,
                connection_id: Some(connection),
                created_at: Utc::now(),
                sequence,
                owners,
            },
        );

        Ok(Some(connection))
    }

    /// Release a key regardless of tier or owners.
    ///
    /// Returns `false` (no-op) if the key is not active.
    pub fn unsubscribe(&mut self, key: &SubscriptionKey) -> bool {
        if !self.subscriptions.contains_key(key) {
            return false;
        }
        self.remove(key, AuditAction::Unsubscribe, "unsubscribe");
        self.settle();
        true
    }

    /// Release every on-demand key owned only by `group`.
    ///
    /// Returns the number of instruments unsubscribed.
    pub fn release_group(&mut self, group: GroupId) -> usize {
        let removed = self.drop_group(group, AuditAction::Unsubscribe, "watchlist_remove");
        self.settle();
        removed
    }

    /// Release every on-demand subscription.
    ///
    /// Writes one audit row per instrument plus a `BULK_CLEAR` summary.
    pub fn unsubscribe_all_on_demand(&mut self) -> usize {
        let mut keys: Vec<_> = self
            .subscriptions
            .values()
            .filter(|s| s.tier == Tier::OnDemand)
            .map(|s| (s.sequence, s.key.clone()))
            .collect();
        keys.sort_unstable_by_key(|(sequence, _)| *sequence);

        for (_, key) in &keys {
            self.remove(key, AuditAction::Unsubscribe, "end_of_day");
        }
        self.groups.clear();

        self.effects.audit.push(AuditEntry::new(
            AuditAction::BulkClear,
            None,
            format!("unsubscribed={}", keys.len()),
        ));
        self.settle();
        keys.len()
    }

    // ===== Connection Events =====

    /// Connection dropped and is reconnecting; its instruments move.
    pub fn connection_lost(&mut self, connection: ConnectionId, error: &str) -> RebalanceReport {
        let moves = self.pool.mark_lost(connection, error);
        self.apply_moves(moves, &format!("connection {connection} lost"))
    }

    /// Connection gave up reconnecting.
    pub fn connection_degraded(&mut self, connection: ConnectionId, error: &str) -> RebalanceReport {
        let moves = self.pool.mark_degraded(connection, error);
        self.apply_moves(moves, &format!("connection {connection} degraded"))
    }

    /// Connection closed without retry.
    pub fn connection_closed(&mut self, connection: ConnectionId) -> RebalanceReport {
        let moves = self.pool.mark_disconnected(connection);
        self.apply_moves(moves, &format!("connection {connection} closed"))
    }

    /// Connection (re)established; queued instruments are assigned.
    pub fn connection_restored(&mut self, connection: ConnectionId, now: DateTime<Utc>) -> RebalanceReport {
        let moves = self.pool.mark_connected(connection, now);
        self.apply_moves(moves, &format!("connection {connection} restored"))
    }

    /// Count a reconnect attempt for a connection.
    pub fn record_reconnect_attempt(&mut self, connection: ConnectionId) -> u32 {
        self.pool.record_reconnect_attempt(connection)
    }

    /// Assign queued instruments, then level load across usable connections.
    pub fn force_rebalance(&mut self) -> RebalanceReport {
        let mut moves = self.pool.drain_pending();
        moves.extend(self.pool.level());
        self.apply_moves(moves, "forced rebalance")
    }

    /// Assign queued instruments only.
    pub fn reconcile(&mut self) -> RebalanceReport {
        let moves = self.pool.drain_pending();
        self.apply_moves(moves, "reconcile")
    }

    /// Drain buffered upstream commands and audit rows.
    pub fn take_effects(&mut self) -> LedgerEffects {
        std::mem::take(&mut self.effects)
    }

    // ===== Inspection =====

    /// Subscription for a key.
    #[must_use]
    pub fn get(&self, key: &SubscriptionKey) -> Option<&Subscription> {
        self.subscriptions.get(key)
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Number of active subscriptions in a tier.
    #[must_use]
    pub fn tier_count(&self, tier: Tier) -> usize {
        self.subscriptions.values().filter(|s| s.tier == tier).count()
    }

    /// Global ceiling.
    #[must_use]
    pub const fn global_capacity(&self) -> usize {
        self.global_capacity
    }

    /// Connection pool (read-only).
    #[must_use]
    pub const fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Whether a group still owns subscriptions.
    #[must_use]
    pub fn has_group(&self, group: GroupId) -> bool {
        self.groups.contains_key(&group)
    }

    /// Keys owned by a group.
    #[must_use]
    pub fn group_keys(&self, group: GroupId) -> Vec<SubscriptionKey> {
        self.groups
            .get(&group)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Active subscriptions in acceptance order, optionally by tier.
    #[must_use]
    pub fn list(&self, tier: Option<Tier>) -> Vec<Subscription> {
        let mut subs: Vec<_> = self
            .subscriptions
            .values()
            .filter(|s| tier.is_none_or(|t| s.tier == t))
            .cloned()
            .collect();
        subs.sort_unstable_by_key(|s| s.sequence);
        subs
    }

    /// Snapshot for status reporting.
    #[must_use]
    pub fn status(&self) -> LedgerStatus {
        let active = self.subscriptions.len();
        #[allow(clippy::cast_precision_loss)]
        let utilization = if self.global_capacity == 0 {
            0.0
        } else {
            active as f64 / self.global_capacity as f64
        };
        LedgerStatus {
            active,
            always_on: self.tier_count(Tier::AlwaysOn),
            on_demand: self.tier_count(Tier::OnDemand),
            pending: self.pool.pending_len(),
            groups: self.groups.len(),
            global_capacity: self.global_capacity,
            utilization,
            connections: self.pool.statuses(),
        }
    }

    /// Check every bookkeeping invariant, returning the violations.
    #[must_use]
    pub fn verify_invariants(&self) -> Vec<String> {
        let mut violations = Vec::new();
        let active = self.subscriptions.len();

        if active > self.global_capacity {
            violations.push(format!("active {active} exceeds global capacity {}", self.global_capacity));
        }
        for slot in self.pool.slots() {
            if slot.load() > slot.capacity() {
                violations.push(format!(
                    "connection {} load {} exceeds capacity {}",
                    slot.id(),
                    slot.load(),
                    slot.capacity()
                ));
            }
        }
        let accounted = self.pool.total_load() + self.pool.pending_len();
        if accounted != active {
            violations.push(format!("assigned + pending {accounted} != active {active}"));
        }
        for sub in self.subscriptions.values() {
            let placed = match sub.connection_id {
                Some(id) => self.pool.slot(id).is_some_and(|slot| slot.contains(&sub.key)),
                None => self.pool.is_pending(&sub.key),
            };
            if !placed {
                violations.push(format!("{} not found on {:?}", sub.key, sub.connection_id));
            }
            if sub.tier == Tier::AlwaysOn && !sub.owners.is_empty() {
                violations.push(format!("always-on {} has group owners", sub.key));
            }
        }
        for (group, keys) in &self.groups {
            for key in keys {
                if !self.subscriptions.get(key).is_some_and(|s| s.owners.contains(group)) {
                    violations.push(format!("group {group} lists {key} without ownership"));
                }
            }
        }
        violations
    }

    // ===== Internals =====

    fn needs_room(&self) -> bool {
        self.subscriptions.len() >= self.global_capacity
            || (self.pool.usable_count() > 0 && !self.pool.has_headroom())
    }

    /// Fail unless evicting every group but `protected` would leave room
    /// for one more key, so a hopeless request evicts nothing.
    fn check_room_after_eviction(&self, protected: Option<GroupId>) -> Result<(), SubscriptionError> {
        let evictable = self
            .subscriptions
            .values()
            .filter(|s| {
                s.tier == Tier::OnDemand
                    && !s.owners.is_empty()
                    && protected.is_none_or(|g| !s.owners.contains(&g))
            })
            .count();
        let remaining = self.subscriptions.len() - evictable;

        if remaining >= self.global_capacity {
            return Err(SubscriptionError::CapacityExceeded {
                active: self.subscriptions.len(),
                capacity: self.global_capacity,
            });
        }
        // Down slots hold no members, so every remaining key lands on a usable one.
        let usable_capacity = self.pool.usable_capacity();
        if remaining >= usable_capacity {
            return Err(SubscriptionError::CapacityExceeded {
                active: self.pool.total_load(),
                capacity: usable_capacity,
            });
        }
        Ok(())
    }

    fn oldest_group_except(&self, protected: Option<GroupId>) -> Option<GroupId> {
        self.groups
            .keys()
            .copied()
            .find(|group| Some(*group) != protected)
    }

    fn evict_group(&mut self, group: GroupId) {
        let removed = self.drop_group(group, AuditAction::Evict, "capacity");
        tracing::warn!(group, instruments = removed, "Evicted watchlist group");
        self.effects.evicted_groups.push(group);
        self.effects.evicted_instruments += removed;
    }

    fn drop_group(&mut self, group: GroupId, action: AuditAction, reason: &str) -> usize {
        let Some(keys) = self.groups.remove(&group) else {
            return 0;
        };

        let mut removed = 0;
        for key in keys {
            let Some(sub) = self.subscriptions.get_mut(&key) else {
                continue;
            };
            sub.owners.remove(&group);
            if sub.tier == Tier::OnDemand && sub.owners.is_empty() {
                self.remove(&key, action, &format!("{reason} group={group}"));
                removed += 1;
            }
        }
        removed
    }

    fn remove(&mut self, key: &SubscriptionKey, action: AuditAction, reason: &str) {
        let Some(sub) = self.subscriptions.remove(key) else {
            return;
        };

        match sub.connection_id {
            Some(connection) => {
                self.pool.release(connection, key);
                self.effects.feed.record_unsubscribe(connection, sub.instrument_token);
            }
            None => {
                self.pool.remove_pending(key);
            }
        }

        for group in &sub.owners {
            if let Some(keys) = self.groups.get_mut(group) {
                keys.remove(key);
                if keys.is_empty() {
                    self.groups.remove(group);
                }
            }
        }

        tracing::debug!(key = %key, tier = %sub.tier, action = action.as_str(), "Unsubscribed");
        self.effects
            .audit
            .push(AuditEntry::new(action, Some(sub.instrument_token), reason));
    }

    fn settle(&mut self) {
        if self.pool.pending_len() > 0 {
            let moves = self.pool.drain_pending();
            self.apply_moves(moves, "capacity freed");
        }
    }

    fn apply_moves(&mut self, moves: Vec<Reassignment>, reason: &str) -> RebalanceReport {
        let moved = moves.len();
        for Reassignment { key, from, to } in moves {
            let Some(sub) = self.subscriptions.get_mut(&key) else {
                continue;
            };
            if let Some(from) = from {
                self.effects.feed.record_unsubscribe(from, sub.instrument_token);
            }
            if let Some(to) = to {
                self.effects.feed.record_subscribe(to, sub.instrument_token);
            }
            sub.connection_id = to;
        }

        let report = RebalanceReport {
            moved,
            queued: self.pool.pending_len(),
        };
        if moved > 0 {
            tracing::info!(moved, queued = report.queued, reason, "Rebalanced subscriptions");
            self.effects.audit.push(AuditEntry::new(
                AuditAction::Rebalance,
                None,
                format!("{reason}: moved={moved} queued={}", report.queued),
            ));
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u64) -> SubscriptionKey {
        SubscriptionKey::spot(format!("SYM{n:05}"))
    }

    fn request(n: u64, tier: Tier, group: Option<GroupId>) -> SubscribeRequest {
        SubscribeRequest {
            key: key(n),
            instrument_token: n,
            tier,
            group,
        }
    }

    fn ledger(connections: u16, capacity: usize, global: usize) -> SubscriptionLedger {
        SubscriptionLedger::new(ConnectionPool::new(connections, capacity), global)
    }

    fn assert_ok(ledger: &SubscriptionLedger) {
        let violations = ledger.verify_invariants();
        assert!(violations.is_empty(), "{violations:?}");
    }

    #[test]
    fn subscribe_is_idempotent() {
        let mut ledger = ledger(2, 10, 20);
        let first = ledger.subscribe(request(1, Tier::OnDemand, Some(1))).unwrap();
        let second = ledger.subscribe(request(1, Tier::OnDemand, Some(2))).unwrap();
        assert_eq!(first, second);
        assert_eq!(ledger.active_count(), 1);
        assert_eq!(ledger.get(&key(1)).unwrap().owners, BTreeSet::from([1, 2]));
        assert_ok(&ledger);
    }

    #[test]
    fn unsubscribe_unknown_is_noop() {
        let mut ledger = ledger(1, 10, 10);
        assert!(!ledger.unsubscribe(&key(1)));
        assert!(ledger.take_effects().is_empty());
    }

    #[test]
    fn shared_key_survives_until_last_owner() {
        let mut ledger = ledger(1, 10, 10);
        ledger.subscribe(request(1, Tier::OnDemand, Some(1))).unwrap();
        ledger.subscribe(request(1, Tier::OnDemand, Some(2))).unwrap();
        ledger.subscribe(request(2, Tier::OnDemand, Some(2))).unwrap();

        assert_eq!(ledger.release_group(1), 0);
        assert_eq!(ledger.active_count(), 2);
        assert_eq!(ledger.release_group(2), 2);
        assert_eq!(ledger.active_count(), 0);
        assert_ok(&ledger);
    }

    #[test]
    fn always_on_blocks_without_eviction() {
        let mut ledger = ledger(1, 2, 2);
        ledger.subscribe(request(1, Tier::AlwaysOn, None)).unwrap();
        ledger.subscribe(request(2, Tier::OnDemand, Some(1))).unwrap();

        let err = ledger.subscribe(request(3, Tier::AlwaysOn, None)).unwrap_err();
        assert_eq!(
            err,
            SubscriptionError::CapacityExceeded {
                active: 2,
                capacity: 2
            }
        );
        assert!(ledger.get(&key(2)).is_some());
    }

    #[test]
    fn eviction_takes_oldest_whole_group() {
        let mut ledger = ledger(2, 3, 6);
        ledger.subscribe(request(100, Tier::AlwaysOn, None)).unwrap();
        for (group, keys) in [(1, [1, 2]), (2, [3, 4])] {
            for n in keys {
                ledger.subscribe(request(n, Tier::OnDemand, Some(group))).unwrap();
            }
        }
        ledger.subscribe(request(5, Tier::OnDemand, Some(3))).unwrap();
        ledger.take_effects();

        ledger.subscribe(request(6, Tier::OnDemand, Some(4))).unwrap();
        let effects = ledger.take_effects();

        assert_eq!(effects.evicted_groups, vec![1]);
        assert_eq!(effects.evicted_instruments, 2);
        assert!(ledger.get(&key(1)).is_none());
        assert!(ledger.get(&key(2)).is_none());
        assert!(ledger.get(&key(3)).is_some());
        assert!(ledger.get(&key(100)).is_some());
        assert!(!ledger.has_group(1));
        assert_eq!(ledger.active_count(), 5);
        assert!(
            effects
                .audit
                .iter()
                .filter(|a| a.action == AuditAction::Evict)
                .count()
                == 2
        );
        assert_ok(&ledger);
    }

    #[test]
    fn own_group_is_never_evicted() {
        let mut ledger = ledger(1, 2, 2);
        ledger.subscribe(request(1, Tier::OnDemand, Some(7))).unwrap();
        ledger.subscribe(request(2, Tier::OnDemand, Some(7))).unwrap();

        assert!(matches!(
            ledger.subscribe(request(3, Tier::OnDemand, Some(7))),
            Err(SubscriptionError::CapacityExceeded { .. })
        ));
        assert_eq!(ledger.active_count(), 2);
    }

    #[test]
    fn full_connections_trigger_eviction() {
        // Global ceiling has room but every usable slot is full.
        let mut ledger = ledger(2, 2, 4);
        ledger.subscribe(request(1, Tier::OnDemand, Some(1))).unwrap();
        ledger.subscribe(request(2, Tier::OnDemand, Some(1))).unwrap();
        ledger.subscribe(request(3, Tier::OnDemand, Some(2))).unwrap();
        ledger.connection_lost(1, "eof");
        assert_eq!(ledger.status().pending, 1);

        ledger.subscribe(request(4, Tier::OnDemand, Some(3))).unwrap();
        assert!(!ledger.has_group(1));
        assert_ok(&ledger);
    }

    #[test]
    fn queued_instruments_take_evicted_capacity_first() {
        let mut ledger = ledger(3, 2, 6);
        for n in 1..=3 {
            ledger.subscribe(request(n, Tier::AlwaysOn, None)).unwrap();
        }
        ledger.subscribe(request(4, Tier::OnDemand, Some(1))).unwrap();
        ledger.subscribe(request(5, Tier::OnDemand, Some(1))).unwrap();
        ledger.connection_lost(2, "eof");
        assert_eq!(ledger.get(&key(3)).unwrap().connection_id, None);

        let assigned = ledger.subscribe(request(6, Tier::OnDemand, Some(2))).unwrap();

        assert!(!ledger.has_group(1));
        assert_eq!(ledger.get(&key(3)).unwrap().connection_id, Some(0));
        assert_eq!(assigned, Some(1));
        assert_eq!(ledger.status().pending, 0);
        assert_ok(&ledger);
    }

    #[test]
    fn hopeless_request_evicts_nothing() {
        let mut ledger = ledger(2, 2, 4);
        ledger.subscribe(request(1, Tier::AlwaysOn, None)).unwrap();
        ledger.subscribe(request(2, Tier::AlwaysOn, None)).unwrap();
        ledger.subscribe(request(3, Tier::OnDemand, Some(1))).unwrap();
        ledger.subscribe(request(4, Tier::OnDemand, Some(1))).unwrap();
        ledger.connection_lost(1, "eof");
        ledger.take_effects();

        // Evicting group 1 would only let the queued always-on key back in.
        let err = ledger.subscribe(request(5, Tier::OnDemand, Some(2))).unwrap_err();

        assert!(matches!(err, SubscriptionError::CapacityExceeded { .. }));
        assert!(ledger.has_group(1));
        assert!(ledger.take_effects().evicted_groups.is_empty());
        assert_eq!(ledger.active_count(), 4);
        assert_ok(&ledger);
    }

    #[test]
    fn no_eviction_while_every_connection_is_down() {
        let mut ledger = ledger(1, 2, 2);
        ledger.subscribe(request(1, Tier::OnDemand, Some(1))).unwrap();
        ledger.subscribe(request(2, Tier::OnDemand, Some(1))).unwrap();
        ledger.connection_lost(0, "eof");
        ledger.take_effects();

        assert_eq!(
            ledger.subscribe(request(3, Tier::OnDemand, Some(2))),
            Err(SubscriptionError::ConnectionUnavailable)
        );
        assert!(ledger.has_group(1));
        assert!(ledger.take_effects().evicted_groups.is_empty());
        assert_eq!(ledger.active_count(), 2);
        assert_ok(&ledger);
    }

    #[test]
    fn unavailable_when_all_connections_down() {
        let mut ledger = ledger(1, 5, 5);
        ledger.connection_degraded(0, "gave up");
        assert_eq!(
            ledger.subscribe(request(1, Tier::AlwaysOn, None)),
            Err(SubscriptionError::ConnectionUnavailable)
        );
    }

    #[test]
    fn disconnect_moves_subscriptions() {
        let mut ledger = ledger(3, 10, 30);
        for n in 0..9 {
            ledger.subscribe(request(n, Tier::AlwaysOn, None)).unwrap();
        }
        ledger.take_effects();

        let report = ledger.connection_lost(1, "reset");
        assert_eq!(report, RebalanceReport { moved: 3, queued: 0 });
        assert!(ledger.list(None).iter().all(|s| s.connection_id != Some(1)));

        let effects = ledger.take_effects();
        assert_eq!(effects.feed.unsubscribe.get(&1).map(BTreeSet::len), Some(3));
        assert_eq!(effects.feed.len(), 6);
        assert_ok(&ledger);
    }

    #[test]
    fn release_drains_pending() {
        let mut ledger = ledger(2, 2, 4);
        for n in 0..4 {
            ledger.subscribe(request(n, Tier::AlwaysOn, None)).unwrap();
        }
        ledger.connection_lost(0, "eof");
        assert_eq!(ledger.status().pending, 2);

        assert!(ledger.unsubscribe(&key(1)));
        assert_eq!(ledger.status().pending, 1);
        assert_ok(&ledger);
    }

    #[test]
    fn bulk_clear_keeps_always_on() {
        let mut ledger = ledger(2, 10, 20);
        ledger.subscribe(request(1, Tier::AlwaysOn, None)).unwrap();
        for n in 2..6 {
            ledger.subscribe(request(n, Tier::OnDemand, Some(n))).unwrap();
        }
        ledger.take_effects();

        assert_eq!(ledger.unsubscribe_all_on_demand(), 4);
        assert_eq!(ledger.unsubscribe_all_on_demand(), 0);
        assert_eq!(ledger.list(Some(Tier::AlwaysOn)).len(), 1);
        assert_eq!(ledger.active_count(), 1);

        let effects = ledger.take_effects();
        let bulk: Vec<_> = effects
            .audit
            .iter()
            .filter(|a| a.action == AuditAction::BulkClear)
            .collect();
        assert_eq!(bulk.len(), 2);
        assert_eq!(bulk[0].reason, "unsubscribed=4");
        assert_ok(&ledger);
    }

    #[test]
    fn tier_parses_from_query() {
        assert_eq!("ALWAYS_ON".parse::<Tier>(), Ok(Tier::AlwaysOn));
        assert_eq!("on_demand".parse::<Tier>(), Ok(Tier::OnDemand));
        assert!("sometimes".parse::<Tier>().is_err());
    }
}
