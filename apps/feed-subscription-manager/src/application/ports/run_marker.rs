//! Run Marker Port (Driven Port)

use async_trait::async_trait;
use chrono::NaiveDate;

use super::PersistenceError;

/// Persisted date of the last end-of-day clear.
#[async_trait]
pub trait RunMarkerStore: Send + Sync {
    /// Session date of the last completed run, if any.
    async fn last_run(&self) -> Result<Option<NaiveDate>, PersistenceError>;

    /// Record a completed run for a session date.
    async fn record_run(&self, date: NaiveDate) -> Result<(), PersistenceError>;
}
