//! Subscription Log Port (Driven Port)

use async_trait::async_trait;

use super::PersistenceError;
use crate::domain::ledger::AuditEntry;

/// Append-only `subscription_log` storage.
#[async_trait]
pub trait SubscriptionLogRepository: Send + Sync {
    /// Append rows in order.
    async fn append(&self, entries: &[AuditEntry]) -> Result<(), PersistenceError>;

    /// Most recent rows, newest last.
    async fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>, PersistenceError>;
}
