//! Channel Feed Transport
//!
//! [`FeedTransport`] adapter that routes each connection's share of a
//! [`SubscriptionChanges`] batch to that connection's client task over an
//! unbounded channel. Dispatch never waits on the network.

use tokio::sync::mpsc;

use super::client::FeedCommand;
use crate::application::ports::FeedTransport;
use crate::domain::ledger::SubscriptionChanges;
use crate::domain::pool::ConnectionId;

/// Routes upstream commands to per-connection clients.
#[derive(Debug, Clone)]
pub struct ChannelFeedTransport {
    senders: Vec<mpsc::UnboundedSender<FeedCommand>>,
}

impl ChannelFeedTransport {
    /// Create a transport and the command receivers, one per connection,
    /// indexed by connection id.
    #[must_use]
    pub fn new(connections: u16) -> (Self, Vec<mpsc::UnboundedReceiver<FeedCommand>>) {
        let (senders, receivers) = (0..connections).map(|_| mpsc::unbounded_channel()).unzip();
        (Self { senders }, receivers)
    }

    fn send(&self, connection: ConnectionId, command: FeedCommand) {
        let Some(sender) = self.senders.get(usize::from(connection)) else {
            tracing::warn!(connection_id = connection, "Command for unknown connection dropped");
            return;
        };
        if sender.send(command).is_err() {
            tracing::warn!(connection_id = connection, "Feed client gone, command dropped");
        }
    }
}

impl FeedTransport for ChannelFeedTransport {
    fn dispatch(&self, changes: &SubscriptionChanges) {
        for (connection, tokens) in &changes.unsubscribe {
            self.send(*connection, FeedCommand::Unsubscribe(tokens.iter().copied().collect()));
        }
        for (connection, tokens) in &changes.subscribe {
            self.send(*connection, FeedCommand::Subscribe(tokens.iter().copied().collect()));
        }
        tracing::debug!(
            connections = changes.connections().len(),
            operations = changes.len(),
            "Upstream commands dispatched"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_by_connection_unsubscribe_first() {
        let (transport, mut receivers) = ChannelFeedTransport::new(3);
        let mut changes = SubscriptionChanges::default();
        changes.record_subscribe(1, 10);
        changes.record_subscribe(1, 11);
        changes.record_unsubscribe(1, 20);
        changes.record_subscribe(2, 30);

        transport.dispatch(&changes);

        assert!(receivers[0].try_recv().is_err());
        assert_eq!(receivers[1].try_recv().unwrap(), FeedCommand::Unsubscribe(vec![20]));
        assert_eq!(receivers[1].try_recv().unwrap(), FeedCommand::Subscribe(vec![10, 11]));
        assert_eq!(receivers[2].try_recv().unwrap(), FeedCommand::Subscribe(vec![30]));
    }

    #[test]
    fn closed_or_unknown_connections_are_ignored() {
        let (transport, mut receivers) = ChannelFeedTransport::new(1);
        receivers.clear();

        let mut changes = SubscriptionChanges::default();
        changes.record_subscribe(0, 1);
        changes.record_subscribe(7, 2);
        transport.dispatch(&changes);
    }
}
