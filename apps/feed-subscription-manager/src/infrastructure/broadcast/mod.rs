//! Tick Broadcast
//!
//! Fan-out of raw feed frames to the price cache and any other consumer,
//! using a tokio broadcast channel.
//!
//! Publishing never blocks: slow receivers lag and lose the oldest frames
//! instead of back-pressuring the feed connections.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Bytes;

use crate::domain::pool::ConnectionId;

/// One raw frame received on a feed connection.
#[derive(Debug, Clone)]
pub struct TickFrame {
    /// Connection that received the frame.
    pub connection_id: ConnectionId,
    /// Receive time.
    pub received_at: DateTime<Utc>,
    /// Frame payload as received.
    pub payload: Bytes,
}

/// Broadcast hub for tick frames.
///
/// # Example
///
/// ```rust
/// use feed_subscription_manager::infrastructure::broadcast::TickHub;
///
/// let hub = TickHub::new(1024);
/// let mut rx = hub.subscribe();
/// hub.on_tick(0, vec![1, 2, 3].into());
/// assert_eq!(rx.try_recv().unwrap().payload.as_ref(), &[1, 2, 3]);
/// ```
#[derive(Debug, Clone)]
pub struct TickHub {
    tx: broadcast::Sender<TickFrame>,
}

impl TickHub {
    /// Create a hub buffering up to `capacity` frames per receiver.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity.max(1)).0,
        }
    }

    /// Publish a frame from a connection.
    ///
    /// Returns the number of receivers, or `None` if nobody is listening.
    pub fn on_tick(&self, connection_id: ConnectionId, payload: Bytes) -> Option<usize> {
        self.tx
            .send(TickFrame {
                connection_id,
                received_at: Utc::now(),
                payload,
            })
            .ok()
    }

    /// Get a new receiver.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TickFrame> {
        self.tx.subscribe()
    }

    /// Number of active receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_receivers_returns_none() {
        let hub = TickHub::new(4);
        assert!(hub.on_tick(0, Bytes::from_static(b"x")).is_none());
    }

    #[tokio::test]
    async fn frames_reach_every_receiver() {
        let hub = TickHub::new(4);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        assert_eq!(hub.receiver_count(), 2);

        assert_eq!(hub.on_tick(3, Bytes::from_static(b"tick")), Some(2));
        assert_eq!(a.recv().await.unwrap().connection_id, 3);
        assert_eq!(b.recv().await.unwrap().payload, Bytes::from_static(b"tick"));
    }

    #[tokio::test]
    async fn slow_receiver_lags_instead_of_blocking() {
        let hub = TickHub::new(2);
        let mut rx = hub.subscribe();
        for n in 0..5u8 {
            hub.on_tick(0, Bytes::from(vec![n]));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert_eq!(rx.recv().await.unwrap().payload.as_ref(), &[3]);
    }
}
