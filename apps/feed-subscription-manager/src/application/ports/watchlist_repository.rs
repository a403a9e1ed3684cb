//! Watchlist Repository Port (Driven Port)

use async_trait::async_trait;
use chrono::NaiveDate;

use super::PersistenceError;
use crate::domain::watchlist::WatchlistEntry;

/// Storage for `watchlist` rows.
#[async_trait]
pub trait WatchlistRepository: Send + Sync {
    /// Allocate the next insertion sequence number.
    ///
    /// Numbers are strictly increasing and never reused, even across
    /// [`clear_all`](Self::clear_all).
    async fn next_order(&self) -> Result<u64, PersistenceError>;

    /// Find the entry for a `(user, underlying, expiry)` triple.
    async fn find(
        &self,
        user_id: &str,
        underlying: &str,
        expiry: Option<NaiveDate>,
    ) -> Result<Option<WatchlistEntry>, PersistenceError>;

    /// Insert an entry. Fails with `Conflict` on a duplicate triple.
    async fn insert(&self, entry: &WatchlistEntry) -> Result<(), PersistenceError>;

    /// Delete the entry for a triple. Returns whether a row was deleted.
    async fn delete(
        &self,
        user_id: &str,
        underlying: &str,
        expiry: Option<NaiveDate>,
    ) -> Result<bool, PersistenceError>;

    /// Delete the entry with an insertion sequence. Returns whether a row
    /// was deleted.
    async fn delete_by_order(&self, added_order: u64) -> Result<bool, PersistenceError>;

    /// All entries in insertion order.
    async fn list_all(&self) -> Result<Vec<WatchlistEntry>, PersistenceError>;

    /// Delete every entry. Returns the number deleted.
    async fn clear_all(&self) -> Result<usize, PersistenceError>;
}
