//! Connection Pool
//!
//! Fixed set of upstream feed connections, each with its own subscription
//! ceiling. The pool only tracks which keys live on which slot and the slot
//! lifecycle state; the network side is driven by the feed clients.
//!
//! # Assignment
//!
//! New keys go to the usable slot with the lowest `(load, id)` that still has
//! headroom. Selection is deterministic; equal loads go to the lowest id.
//!
//! # Failure
//!
//! When a slot is lost, its members are reassigned in key order with the
//! same rule. Members that do not fit anywhere are parked in a FIFO pending
//! queue and drained as soon as any slot frees capacity or reconnects.

use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::errors::SubscriptionError;
use crate::domain::instrument::SubscriptionKey;

/// Connection slot identifier.
pub type ConnectionId = u16;

// =============================================================================
// Slot State
// =============================================================================

/// Lifecycle state of a connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Created, first connect in progress.
    Connecting,
    /// Connected and streaming.
    Connected,
    /// Connection lost, retrying with backoff.
    Reconnecting,
    /// Closed without retry (shutdown).
    Disconnected,
    /// Reconnect attempts exhausted.
    Degraded,
}

impl SlotState {
    /// Whether the slot accepts new assignments.
    #[must_use]
    pub const fn is_usable(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }

    /// Stable label for metrics and status output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Disconnected => "disconnected",
            Self::Degraded => "degraded",
        }
    }
}

// =============================================================================
// Connection Slot
// =============================================================================

/// One upstream connection and the keys assigned to it.
#[derive(Debug, Clone)]
pub struct ConnectionSlot {
    id: ConnectionId,
    capacity: usize,
    members: BTreeSet<SubscriptionKey>,
    state: SlotState,
    reconnect_attempts: u32,
    last_error: Option<String>,
    last_connected_at: Option<DateTime<Utc>>,
}

impl ConnectionSlot {
    fn new(id: ConnectionId, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            members: BTreeSet::new(),
            state: SlotState::Connecting,
            reconnect_attempts: 0,
            last_error: None,
            last_connected_at: None,
        }
    }

    /// Slot id.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Number of keys currently assigned.
    #[must_use]
    pub fn load(&self) -> usize {
        self.members.len()
    }

    /// Per-connection ceiling.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SlotState {
        self.state
    }

    /// Keys assigned to this slot, in key order.
    pub fn members(&self) -> impl Iterator<Item = &SubscriptionKey> {
        self.members.iter()
    }

    /// Whether the slot holds the key.
    #[must_use]
    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.members.contains(key)
    }

    fn has_headroom(&self) -> bool {
        self.state.is_usable() && self.members.len() < self.capacity
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            id: self.id,
            state: self.state,
            load: self.members.len(),
            capacity: self.capacity,
            reconnect_attempts: self.reconnect_attempts,
            last_error: self.last_error.clone(),
            last_connected_at: self.last_connected_at,
        }
    }
}

/// Serializable snapshot of a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    /// Slot id.
    pub id: ConnectionId,
    /// Current state.
    pub state: SlotState,
    /// Assigned keys.
    pub load: usize,
    /// Per-connection ceiling.
    pub capacity: usize,
    /// Reconnect attempts since the last successful connect.
    pub reconnect_attempts: u32,
    /// Last connection error.
    pub last_error: Option<String>,
    /// Last successful connect.
    pub last_connected_at: Option<DateTime<Utc>>,
}

/// Connection lifecycle event reported by the feed layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Handshake completed.
    Connected {
        /// Slot id.
        connection: ConnectionId,
    },
    /// Connection dropped; the client will retry.
    Lost {
        /// Slot id.
        connection: ConnectionId,
        /// Why it dropped.
        error: String,
    },
    /// A reconnect attempt is starting.
    ReconnectAttempt {
        /// Slot id.
        connection: ConnectionId,
        /// Attempt number, starting at 1.
        attempt: u32,
    },
    /// Reconnect attempts exhausted.
    Degraded {
        /// Slot id.
        connection: ConnectionId,
        /// Last error.
        error: String,
    },
    /// Client stopped on shutdown.
    Closed {
        /// Slot id.
        connection: ConnectionId,
    },
}

impl ConnectionEvent {
    /// Slot the event is about.
    #[must_use]
    pub const fn connection(&self) -> ConnectionId {
        match self {
            Self::Connected { connection }
            | Self::Lost { connection, .. }
            | Self::ReconnectAttempt { connection, .. }
            | Self::Degraded { connection, .. }
            | Self::Closed { connection } => *connection,
        }
    }
}

/// A key that moved between slots (or into / out of the pending queue).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassignment {
    /// Key that moved.
    pub key: SubscriptionKey,
    /// Previous slot, `None` if it was pending.
    pub from: Option<ConnectionId>,
    /// New slot, `None` if it is now pending.
    pub to: Option<ConnectionId>,
}

// =============================================================================
// Pool
// =============================================================================

/// Fixed pool of connection slots.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    slots: Vec<ConnectionSlot>,
    pending: VecDeque<SubscriptionKey>,
}

impl ConnectionPool {
    /// Create `connections` slots with `capacity` keys each.
    ///
    /// Slot ids run from `0` to `connections - 1`.
    #[must_use]
    pub fn new(connections: u16, capacity: usize) -> Self {
        Self {
            slots: (0..connections)
                .map(|id| ConnectionSlot::new(id, capacity))
                .collect(),
            pending: VecDeque::new(),
        }
    }

    /// Pick the slot a new key would be assigned to.
    ///
    /// # Errors
    ///
    /// `CapacityExceeded` if usable slots exist but all are full,
    /// `ConnectionUnavailable` if no slot is usable.
    pub fn select(&self) -> Result<ConnectionId, SubscriptionError> {
        if let Some(id) = self.least_loaded() {
            return Ok(id);
        }
        if self.usable_count() == 0 {
            return Err(SubscriptionError::ConnectionUnavailable);
        }
        Err(SubscriptionError::CapacityExceeded {
            active: self.usable_load(),
            capacity: self.usable_capacity(),
        })
    }

    /// Assign a key to the least loaded usable slot.
    ///
    /// # Errors
    ///
    /// Same as [`select`](Self::select).
    pub fn assign(&mut self, key: SubscriptionKey) -> Result<ConnectionId, SubscriptionError> {
        let id = self.select()?;
        self.slots[usize::from(id)].members.insert(key);
        Ok(id)
    }

    /// Remove a key from its slot.
    ///
    /// Returns `false` if the slot did not hold the key.
    pub fn release(&mut self, connection: ConnectionId, key: &SubscriptionKey) -> bool {
        self.slots
            .get_mut(usize::from(connection))
            .is_some_and(|slot| slot.members.remove(key))
    }

    /// Park a key in the pending queue.
    pub fn enqueue(&mut self, key: SubscriptionKey) {
        self.pending.push_back(key);
    }

    /// Drop a key from the pending queue.
    pub fn remove_pending(&mut self, key: &SubscriptionKey) -> bool {
        let before = self.pending.len();
        self.pending.retain(|k| k != key);
        self.pending.len() != before
    }

    /// Assign pending keys while any slot has headroom, oldest first.
    pub fn drain_pending(&mut self) -> Vec<Reassignment> {
        let mut moved = Vec::new();
        while !self.pending.is_empty() {
            let Some(id) = self.least_loaded() else {
                break;
            };
            let Some(key) = self.pending.pop_front() else {
                break;
            };
            self.slots[usize::from(id)].members.insert(key.clone());
            moved.push(Reassignment {
                key,
                from: None,
                to: Some(id),
            });
        }
        moved
    }

    /// Slot lost its connection and is retrying.
    ///
    /// Members are moved to other usable slots or to the pending queue.
    pub fn mark_lost(&mut self, connection: ConnectionId, error: impl Into<String>) -> Vec<Reassignment> {
        self.take_down(connection, SlotState::Reconnecting, Some(error.into()))
    }

    /// Slot exhausted its reconnect attempts.
    pub fn mark_degraded(&mut self, connection: ConnectionId, error: impl Into<String>) -> Vec<Reassignment> {
        self.take_down(connection, SlotState::Degraded, Some(error.into()))
    }

    /// Slot closed without retry.
    pub fn mark_disconnected(&mut self, connection: ConnectionId) -> Vec<Reassignment> {
        self.take_down(connection, SlotState::Disconnected, None)
    }

    /// Slot (re)connected.
    ///
    /// Resets the attempt counter and drains the pending queue.
    pub fn mark_connected(&mut self, connection: ConnectionId, now: DateTime<Utc>) -> Vec<Reassignment> {
        let Some(slot) = self.slots.get_mut(usize::from(connection)) else {
            return Vec::new();
        };
        slot.state = SlotState::Connected;
        slot.reconnect_attempts = 0;
        slot.last_error = None;
        slot.last_connected_at = Some(now);
        self.drain_pending()
    }

    /// Count a reconnect attempt for a slot and return the new total.
    pub fn record_reconnect_attempt(&mut self, connection: ConnectionId) -> u32 {
        self.slots
            .get_mut(usize::from(connection))
            .map_or(0, |slot| {
                slot.reconnect_attempts = slot.reconnect_attempts.saturating_add(1);
                slot.reconnect_attempts
            })
    }

    /// Even out load across usable slots until loads differ by at most one.
    ///
    /// Moves the largest keys of the most loaded slot (lowest id on ties) to
    /// the least loaded slot.
    pub fn level(&mut self) -> Vec<Reassignment> {
        let mut moved = Vec::new();
        loop {
            let usable = self.slots.iter().filter(|s| s.state.is_usable());
            let Some(max) = usable
                .clone()
                .max_by_key(|s| (s.load(), std::cmp::Reverse(s.id)))
                .map(|s| (s.id, s.load()))
            else {
                break;
            };
            let Some(min) = usable.min_by_key(|s| (s.load(), s.id)).map(|s| (s.id, s.load())) else {
                break;
            };
            if max.1 <= min.1 + 1 {
                break;
            }

            let Some(key) = self.slots[usize::from(max.0)].members.pop_last() else {
                break;
            };
            self.slots[usize::from(min.0)].members.insert(key.clone());
            moved.push(Reassignment {
                key,
                from: Some(max.0),
                to: Some(min.0),
            });
        }
        moved
    }

    // ===== Inspection =====

    /// Slot by id.
    #[must_use]
    pub fn slot(&self, connection: ConnectionId) -> Option<&ConnectionSlot> {
        self.slots.get(usize::from(connection))
    }

    /// All slots in id order.
    pub fn slots(&self) -> impl Iterator<Item = &ConnectionSlot> {
        self.slots.iter()
    }

    /// Snapshot of every slot.
    #[must_use]
    pub fn statuses(&self) -> Vec<ConnectionStatus> {
        self.slots.iter().map(ConnectionSlot::status).collect()
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool has no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of slots accepting assignments.
    #[must_use]
    pub fn usable_count(&self) -> usize {
        self.slots.iter().filter(|s| s.state.is_usable()).count()
    }

    /// Number of slots in the `Connected` state.
    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Connected)
            .count()
    }

    /// Whether any usable slot has headroom.
    #[must_use]
    pub fn has_headroom(&self) -> bool {
        self.slots.iter().any(ConnectionSlot::has_headroom)
    }

    /// Keys assigned across all slots.
    #[must_use]
    pub fn total_load(&self) -> usize {
        self.slots.iter().map(ConnectionSlot::load).sum()
    }

    /// Sum of all slot ceilings.
    #[must_use]
    pub fn total_capacity(&self) -> usize {
        self.slots.iter().map(|s| s.capacity).sum()
    }

    /// Keys waiting for a slot.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether the key is waiting for a slot.
    #[must_use]
    pub fn is_pending(&self, key: &SubscriptionKey) -> bool {
        self.pending.contains(key)
    }

    // ===== Internals =====

    fn least_loaded(&self) -> Option<ConnectionId> {
        self.slots
            .iter()
            .filter(|s| s.has_headroom())
            .min_by_key(|s| (s.load(), s.id))
            .map(|s| s.id)
    }

    fn usable_load(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state.is_usable())
            .map(ConnectionSlot::load)
            .sum()
    }

    /// Sum of ceilings over slots that accept assignments.
    #[must_use]
    pub fn usable_capacity(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state.is_usable())
            .map(|s| s.capacity)
            .sum()
    }

    fn take_down(
        &mut self,
        connection: ConnectionId,
        state: SlotState,
        error: Option<String>,
    ) -> Vec<Reassignment> {
        let Some(slot) = self.slots.get_mut(usize::from(connection)) else {
            return Vec::new();
        };
        slot.state = state;
        if error.is_some() {
            slot.last_error = error;
        }
        let orphans = std::mem::take(&mut slot.members);

        orphans
            .into_iter()
            .map(|key| {
                let to = self.least_loaded();
                match to {
                    Some(id) => {
                        self.slots[usize::from(id)].members.insert(key.clone());
                    }
                    None => self.pending.push_back(key.clone()),
                }
                Reassignment {
                    key,
                    from: Some(connection),
                    to,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: usize) -> SubscriptionKey {
        SubscriptionKey::spot(format!("SYM{n:05}"))
    }

    fn filled(connections: u16, capacity: usize, keys: usize) -> ConnectionPool {
        let mut pool = ConnectionPool::new(connections, capacity);
        for n in 0..keys {
            pool.assign(key(n)).unwrap();
        }
        pool
    }

    #[test]
    fn assigns_least_loaded_lowest_id_first() {
        let mut pool = ConnectionPool::new(3, 10);
        assert_eq!(pool.assign(key(0)).unwrap(), 0);
        assert_eq!(pool.assign(key(1)).unwrap(), 1);
        assert_eq!(pool.assign(key(2)).unwrap(), 2);
        assert_eq!(pool.assign(key(3)).unwrap(), 0);

        assert!(pool.release(1, &key(1)));
        assert_eq!(pool.assign(key(4)).unwrap(), 1);
    }

    #[test]
    fn full_usable_slots_are_capacity_exceeded() {
        let mut pool = filled(2, 2, 4);
        assert_eq!(
            pool.assign(key(99)),
            Err(SubscriptionError::CapacityExceeded {
                active: 4,
                capacity: 4
            })
        );
    }

    #[test]
    fn no_usable_slot_is_connection_unavailable() {
        let mut pool = ConnectionPool::new(2, 5);
        pool.mark_degraded(0, "gone");
        pool.mark_lost(1, "reset");
        assert_eq!(
            pool.assign(key(0)),
            Err(SubscriptionError::ConnectionUnavailable)
        );
    }

    #[test]
    fn lost_slot_members_spread_over_survivors() {
        let mut pool = filled(3, 10, 9);
        let before = pool.total_load();

        let moved = pool.mark_lost(0, "eof");
        assert_eq!(moved.len(), 3);
        assert!(moved.iter().all(|m| m.from == Some(0) && m.to.is_some()));
        assert_eq!(pool.slot(0).unwrap().load(), 0);
        assert_eq!(pool.total_load(), before);
        assert!(pool.slots().all(|s| s.load() <= s.capacity()));
        assert_eq!(pool.slot(0).unwrap().state(), SlotState::Reconnecting);
    }

    #[test]
    fn overflow_goes_pending_and_drains_on_reconnect() {
        let mut pool = filled(2, 3, 5);

        let moved = pool.mark_lost(0, "eof");
        let queued = moved.iter().filter(|m| m.to.is_none()).count();
        assert_eq!(pool.slot(1).unwrap().load(), 3);
        assert_eq!(pool.pending_len(), queued);
        assert_eq!(pool.total_load() + pool.pending_len(), 5);

        let drained = pool.mark_connected(0, Utc::now());
        assert_eq!(drained.len(), queued);
        assert_eq!(pool.pending_len(), 0);
        assert_eq!(pool.total_load(), 5);
        assert_eq!(pool.slot(0).unwrap().state(), SlotState::Connected);
    }

    #[test]
    fn reconnect_attempts_reset_on_connect() {
        let mut pool = ConnectionPool::new(1, 1);
        pool.mark_lost(0, "eof");
        assert_eq!(pool.record_reconnect_attempt(0), 1);
        assert_eq!(pool.record_reconnect_attempt(0), 2);
        assert_eq!(pool.statuses()[0].last_error.as_deref(), Some("eof"));

        pool.mark_connected(0, Utc::now());
        let status = &pool.statuses()[0];
        assert_eq!(status.reconnect_attempts, 0);
        assert!(status.last_error.is_none());
        assert!(status.last_connected_at.is_some());
    }

    #[test]
    fn level_evens_out_loads() {
        let mut pool = ConnectionPool::new(3, 100);
        pool.mark_lost(1, "eof");
        pool.mark_lost(2, "eof");
        for n in 0..30 {
            pool.assign(key(n)).unwrap();
        }
        pool.mark_connected(1, Utc::now());
        pool.mark_connected(2, Utc::now());

        let moved = pool.level();
        assert_eq!(moved.len(), 20);
        let loads: Vec<_> = pool.slots().map(ConnectionSlot::load).collect();
        assert_eq!(loads, vec![10, 10, 10]);
        assert_eq!(pool.total_load(), 30);
    }

    #[test]
    fn level_is_noop_when_even() {
        let mut pool = filled(3, 10, 7);
        assert!(pool.level().is_empty());
    }

    #[test]
    fn remove_pending() {
        let mut pool = ConnectionPool::new(1, 1);
        pool.enqueue(key(1));
        assert!(pool.is_pending(&key(1)));
        assert!(pool.remove_pending(&key(1)));
        assert!(!pool.remove_pending(&key(1)));
    }
}
