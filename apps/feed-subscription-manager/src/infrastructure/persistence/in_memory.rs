//! In-memory repositories.
//!
//! The process keeps the watchlist, audit trail and run marker in memory
//! unless a durable adapter is configured. Data is lost on restart.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::RwLock;

use crate::application::ports::{
    PersistenceError, RunMarkerStore, SubscriptionLogRepository, WatchlistRepository,
};
use crate::domain::ledger::AuditEntry;
use crate::domain::watchlist::WatchlistEntry;

// =============================================================================
// Watchlist
// =============================================================================

/// In-memory `watchlist` table keyed by insertion sequence.
#[derive(Debug)]
pub struct InMemoryWatchlistRepository {
    entries: RwLock<BTreeMap<u64, WatchlistEntry>>,
    next_order: AtomicU64,
}

impl Default for InMemoryWatchlistRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWatchlistRepository {
    /// Create an empty repository. Sequence numbers start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            next_order: AtomicU64::new(1),
        }
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether there are no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl WatchlistRepository for InMemoryWatchlistRepository {
    async fn next_order(&self) -> Result<u64, PersistenceError> {
        Ok(self.next_order.fetch_add(1, Ordering::Relaxed))
    }

    async fn find(
        &self,
        user_id: &str,
        underlying: &str,
        expiry: Option<NaiveDate>,
    ) -> Result<Option<WatchlistEntry>, PersistenceError> {
        Ok(self
            .entries
            .read()
            .values()
            .find(|e| e.matches(user_id, underlying, expiry))
            .cloned())
    }

    async fn insert(&self, entry: &WatchlistEntry) -> Result<(), PersistenceError> {
        let mut entries = self.entries.write();
        if entries
            .values()
            .any(|e| e.matches(&entry.user_id, &entry.underlying, entry.expiry))
        {
            return Err(PersistenceError::Conflict(format!(
                "{}/{}/{:?} already watched",
                entry.user_id, entry.underlying, entry.expiry
            )));
        }
        if entries.contains_key(&entry.added_order) {
            return Err(PersistenceError::Conflict(format!(
                "added_order {} already used",
                entry.added_order
            )));
        }
        entries.insert(entry.added_order, entry.clone());
        Ok(())
    }

    async fn delete(
        &self,
        user_id: &str,
        underlying: &str,
        expiry: Option<NaiveDate>,
    ) -> Result<bool, PersistenceError> {
        let mut entries = self.entries.write();
        let order = entries
            .values()
            .find(|e| e.matches(user_id, underlying, expiry))
            .map(|e| e.added_order);
        Ok(order.and_then(|order| entries.remove(&order)).is_some())
    }

    async fn delete_by_order(&self, added_order: u64) -> Result<bool, PersistenceError> {
        Ok(self.entries.write().remove(&added_order).is_some())
    }

    async fn list_all(&self) -> Result<Vec<WatchlistEntry>, PersistenceError> {
        Ok(self.entries.read().values().cloned().collect())
    }

    async fn clear_all(&self) -> Result<usize, PersistenceError> {
        let mut entries = self.entries.write();
        let count = entries.len();
        entries.clear();
        Ok(count)
    }
}

// =============================================================================
// Subscription Log
// =============================================================================

/// In-memory `subscription_log`, bounded to the most recent rows.
#[derive(Debug)]
pub struct InMemorySubscriptionLog {
    rows: RwLock<VecDeque<AuditEntry>>,
    retain: usize,
}

impl InMemorySubscriptionLog {
    /// Default number of rows kept.
    pub const DEFAULT_RETAIN: usize = 100_000;

    /// Create a log keeping at most `retain` rows.
    #[must_use]
    pub fn new(retain: usize) -> Self {
        Self {
            rows: RwLock::new(VecDeque::new()),
            retain: retain.max(1),
        }
    }

    /// Number of rows kept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

impl Default for InMemorySubscriptionLog {
    fn default() -> Self {
        Self::new(Self::DEFAULT_RETAIN)
    }
}

#[async_trait]
impl SubscriptionLogRepository for InMemorySubscriptionLog {
    async fn append(&self, entries: &[AuditEntry]) -> Result<(), PersistenceError> {
        let mut rows = self.rows.write();
        rows.extend(entries.iter().cloned());
        let excess = rows.len().saturating_sub(self.retain);
        rows.drain(..excess);
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>, PersistenceError> {
        let rows = self.rows.read();
        let skip = rows.len().saturating_sub(limit);
        Ok(rows.iter().skip(skip).cloned().collect())
    }
}

// =============================================================================
// Run Marker
// =============================================================================

/// Run marker held in memory.
#[derive(Debug, Default)]
pub struct InMemoryRunMarkerStore {
    last_run: RwLock<Option<NaiveDate>>,
}

impl InMemoryRunMarkerStore {
    /// Create a store with no recorded run.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunMarkerStore for InMemoryRunMarkerStore {
    async fn last_run(&self) -> Result<Option<NaiveDate>, PersistenceError> {
        Ok(*self.last_run.read())
    }

    async fn record_run(&self, date: NaiveDate) -> Result<(), PersistenceError> {
        *self.last_run.write() = Some(date);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::domain::ledger::AuditAction;
    use crate::domain::watchlist::InstrumentType;

    fn entry(repo_order: u64, user: &str, underlying: &str) -> WatchlistEntry {
        WatchlistEntry {
            user_id: user.to_string(),
            underlying: underlying.to_string(),
            expiry: NaiveDate::from_ymd_opt(2026, 10, 29),
            instrument_type: InstrumentType::IndexOption,
            added_at: Utc::now(),
            added_order: repo_order,
            window: None,
        }
    }

    #[tokio::test]
    async fn sequence_survives_clear() {
        let repo = InMemoryWatchlistRepository::new();
        let first = repo.next_order().await.unwrap();
        repo.insert(&entry(first, "u1", "NIFTY")).await.unwrap();
        assert_eq!(repo.clear_all().await.unwrap(), 1);

        let second = repo.next_order().await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn duplicate_triple_conflicts() {
        let repo = InMemoryWatchlistRepository::new();
        repo.insert(&entry(1, "u1", "NIFTY")).await.unwrap();

        let err = repo.insert(&entry(2, "u1", "NIFTY")).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Conflict(_)));
        repo.insert(&entry(3, "u2", "NIFTY")).await.unwrap();
        assert_eq!(repo.len(), 2);
    }

    #[tokio::test]
    async fn list_is_in_insertion_order() {
        let repo = InMemoryWatchlistRepository::new();
        repo.insert(&entry(5, "u1", "BANKNIFTY")).await.unwrap();
        repo.insert(&entry(2, "u1", "NIFTY")).await.unwrap();

        let orders: Vec<u64> = repo.list_all().await.unwrap().iter().map(|e| e.added_order).collect();
        assert_eq!(orders, vec![2, 5]);

        assert!(repo.delete("u1", "NIFTY", NaiveDate::from_ymd_opt(2026, 10, 29)).await.unwrap());
        assert!(!repo.delete_by_order(2).await.unwrap());
        assert!(repo.delete_by_order(5).await.unwrap());
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn log_keeps_most_recent_rows() {
        let log = InMemorySubscriptionLog::new(3);
        let rows: Vec<AuditEntry> = (0..5)
            .map(|n| AuditEntry::new(AuditAction::Subscribe, Some(n), "test"))
            .collect();
        log.append(&rows).await.unwrap();

        assert_eq!(log.len(), 3);
        let recent = log.recent(2).await.unwrap();
        assert_eq!(recent[0].instrument_token, Some(3));
        assert_eq!(recent[1].instrument_token, Some(4));
    }

    #[tokio::test]
    async fn run_marker_round_trip() {
        let store = InMemoryRunMarkerStore::new();
        assert_eq!(store.last_run().await.unwrap(), None);

        let date = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        store.record_run(date).await.unwrap();
        assert_eq!(store.last_run().await.unwrap(), Some(date));
    }
}
