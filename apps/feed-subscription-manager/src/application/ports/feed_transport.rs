//! Feed Transport Port (Driven Port)
//!
//! Hands upstream subscribe/unsubscribe batches to the connection layer.
//! Dispatch is synchronous and must not wait on the network; delivery is
//! confirmed later through connection events.

use crate::domain::ledger::SubscriptionChanges;

/// Sink for upstream subscription commands.
pub trait FeedTransport: Send + Sync {
    /// Queue a batch for the affected connections.
    fn dispatch(&self, changes: &SubscriptionChanges);
}

/// Transport that drops every batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpFeedTransport;

impl FeedTransport for NoOpFeedTransport {
    fn dispatch(&self, _changes: &SubscriptionChanges) {}
}
