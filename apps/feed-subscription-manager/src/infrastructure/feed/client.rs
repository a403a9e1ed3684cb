//! Feed WebSocket Client
//!
//! One client task per connection slot. The client owns the set of
//! instrument tokens its slot should stream, applies subscribe/unsubscribe
//! commands from the [`ChannelFeedTransport`](super::ChannelFeedTransport),
//! replays the whole set after every (re)connect and reports lifecycle
//! changes as [`ConnectionEvent`]s.
//!
//! # Protocol
//!
//! Control messages are JSON text frames:
//!
//! ```text
//! {"a":"subscribe","v":[256265,260105]}
//! {"a":"mode","v":["full",[256265,260105]]}
//! {"a":"unsubscribe","v":[256265]}
//! ```
//!
//! Market data arrives as binary frames and is forwarded untouched to the
//! [`TickHub`]. The server sends a one-byte binary heartbeat every second
//! while idle.

use std::collections::BTreeSet;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use super::reconnect::{ReconnectConfig, ReconnectError, ReconnectPolicy};
use crate::domain::pool::{ConnectionEvent, ConnectionId};
use crate::infrastructure::broadcast::TickHub;
use crate::infrastructure::metrics;

/// Tokens per control frame.
const MAX_TOKENS_PER_FRAME: usize = 1000;

/// Streaming mode requested for every token.
const STREAM_MODE: &str = "full";

// =============================================================================
// Error Type
// =============================================================================

/// Errors that can occur in a feed client.
#[derive(Debug, thiserror::Error)]
pub enum FeedClientError {
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Server closed the connection or the stream ended.
    #[error("connection closed by server")]
    ConnectionClosed,

    /// Nothing received within the idle timeout.
    #[error("no frames received for {0:?}")]
    Stale(Duration),

    /// Reconnect budget spent.
    #[error(transparent)]
    Reconnect(#[from] ReconnectError),
}

// =============================================================================
// Commands & Configuration
// =============================================================================

/// Upstream command for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedCommand {
    /// Start streaming tokens.
    Subscribe(Vec<u64>),
    /// Stop streaming tokens.
    Unsubscribe(Vec<u64>),
}

/// Configuration for one feed client.
#[derive(Debug, Clone)]
pub struct FeedClientConfig {
    /// Slot this client serves.
    pub connection_id: ConnectionId,
    /// Full WebSocket URL including credentials.
    pub url: String,
    /// Backoff between attempts.
    pub reconnect: ReconnectConfig,
    /// Drop the connection when nothing arrives for this long.
    pub idle_timeout: Duration,
}

impl FeedClientConfig {
    /// Config with the default idle timeout.
    #[must_use]
    pub fn new(connection_id: ConnectionId, url: impl Into<String>, reconnect: ReconnectConfig) -> Self {
        Self {
            connection_id,
            url: url.into(),
            reconnect,
            idle_timeout: Duration::from_secs(10),
        }
    }
}

/// Text frame pushed by the server.
#[derive(Debug, Deserialize)]
struct ServerMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

// =============================================================================
// Client
// =============================================================================

/// WebSocket client for one connection slot.
pub struct FeedClient {
    config: FeedClientConfig,
    commands: mpsc::UnboundedReceiver<FeedCommand>,
    events: mpsc::Sender<ConnectionEvent>,
    ticks: TickHub,
    cancel: CancellationToken,
    desired: BTreeSet<u64>,
}

impl std::fmt::Debug for FeedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedClient")
            .field("connection_id", &self.config.connection_id)
            .field("desired", &self.desired.len())
            .finish_non_exhaustive()
    }
}

impl FeedClient {
    /// Create a client. Nothing connects until [`run`](Self::run).
    #[must_use]
    pub fn new(
        config: FeedClientConfig,
        commands: mpsc::UnboundedReceiver<FeedCommand>,
        events: mpsc::Sender<ConnectionEvent>,
        ticks: TickHub,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            commands,
            events,
            ticks,
            cancel,
            desired: BTreeSet::new(),
        }
    }

    /// Tokens this client streams whenever it is connected.
    #[must_use]
    pub const fn desired(&self) -> &BTreeSet<u64> {
        &self.desired
    }

    /// Run the connection loop until cancelled or the reconnect budget is
    /// spent.
    ///
    /// # Errors
    ///
    /// Returns [`FeedClientError::Reconnect`] once every attempt has failed.
    /// The slot has been reported degraded by then.
    pub async fn run(mut self) -> Result<(), FeedClientError> {
        let connection = self.config.connection_id;
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let error = match self.connect_and_run(&mut policy).await {
                Ok(()) => break,
                Err(e) => e.to_string(),
            };

            tracing::warn!(connection_id = connection, error = %error, "Feed connection lost");
            self.emit(ConnectionEvent::Lost {
                connection,
                error: error.clone(),
            })
            .await;

            let Some(delay) = policy.next_delay() else {
                let attempts = policy.attempt_count();
                tracing::error!(connection_id = connection, attempts, "Feed connection degraded");
                self.emit(ConnectionEvent::Degraded {
                    connection,
                    error: error.clone(),
                })
                .await;
                return Err(ReconnectError::Exhausted {
                    attempts,
                    last_error: error,
                }
                .into());
            };

            let attempt = policy.attempt_count();
            tracing::info!(
                connection_id = connection,
                attempt,
                delay_ms = delay.as_millis(),
                "Reconnecting feed connection"
            );
            self.emit(ConnectionEvent::ReconnectAttempt { connection, attempt })
                .await;

            if !self.wait_offline(delay).await {
                break;
            }
        }

        tracing::info!(connection_id = connection, "Feed client stopped");
        self.emit(ConnectionEvent::Closed { connection }).await;
        Ok(())
    }

    /// Sleep for `delay` while still tracking commands. Returns `false` if
    /// cancelled.
    async fn wait_offline(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return false,
                () = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(command) => {
                        self.apply(command);
                    }
                    None => return false,
                },
            }
        }
    }

    /// Connect, replay the desired set and pump frames until error or
    /// cancellation.
    async fn connect_and_run(&mut self, policy: &mut ReconnectPolicy) -> Result<(), FeedClientError> {
        let connection = self.config.connection_id;
        tracing::info!(connection_id = connection, "Connecting to feed");

        let (ws_stream, _response) = tokio_tungstenite::connect_async(self.config.url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        policy.reset();
        tracing::info!(connection_id = connection, tokens = self.desired.len(), "Feed connected");
        self.emit(ConnectionEvent::Connected { connection }).await;

        let replay: Vec<u64> = self.desired.iter().copied().collect();
        send_frames(&mut write, subscribe_frames(&replay)).await?;

        let idle_timeout = self.config.idle_timeout;
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                () = &mut idle => {
                    return Err(FeedClientError::Stale(idle_timeout));
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    };
                    let frames = self.apply(command);
                    send_frames(&mut write, frames).await?;
                }
                msg = read.next() => {
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            if data.len() > 1 {
                                metrics::record_tick(connection);
                                tracing::trace!(connection_id = connection, bytes = data.len(), "Tick frame");
                                self.ticks.on_tick(connection, data);
                            }
                        }
                        Some(Ok(Message::Text(text))) => {
                            handle_text(connection, text.as_str());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) => {
                            tracing::info!(connection_id = connection, "Server sent close frame");
                            return Err(FeedClientError::ConnectionClosed);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(FeedClientError::ConnectionClosed),
                    }
                }
            }
        }
    }

    /// Apply a command to the desired set and return the frames for the
    /// tokens that actually changed.
    fn apply(&mut self, command: FeedCommand) -> Vec<String> {
        match command {
            FeedCommand::Subscribe(tokens) => {
                let added: Vec<u64> = tokens.into_iter().filter(|t| self.desired.insert(*t)).collect();
                tracing::debug!(connection_id = self.config.connection_id, count = added.len(), "Subscribe tokens");
                subscribe_frames(&added)
            }
            FeedCommand::Unsubscribe(tokens) => {
                let removed: Vec<u64> = tokens.into_iter().filter(|t| self.desired.remove(t)).collect();
                tracing::debug!(connection_id = self.config.connection_id, count = removed.len(), "Unsubscribe tokens");
                unsubscribe_frames(&removed)
            }
        }
    }

    async fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!(connection_id = self.config.connection_id, "Connection event receiver dropped");
        }
    }
}

async fn send_frames<W>(write: &mut W, frames: Vec<String>) -> Result<(), FeedClientError>
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    for frame in frames {
        write.send(Message::text(frame)).await?;
    }
    Ok(())
}

fn handle_text(connection: ConnectionId, text: &str) {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(message) if message.kind == "error" => {
            tracing::warn!(connection_id = connection, data = %message.data, "Feed server error");
        }
        Ok(message) => {
            tracing::debug!(connection_id = connection, kind = %message.kind, "Feed server message");
        }
        Err(e) => {
            tracing::debug!(connection_id = connection, error = %e, "Unrecognised text frame");
        }
    }
}

// =============================================================================
// Frame Encoding
// =============================================================================

/// Subscribe and mode frames for a token batch, chunked.
#[must_use]
pub fn subscribe_frames(tokens: &[u64]) -> Vec<String> {
    tokens
        .chunks(MAX_TOKENS_PER_FRAME)
        .flat_map(|chunk| {
            [
                serde_json::json!({ "a": "subscribe", "v": chunk }).to_string(),
                serde_json::json!({ "a": "mode", "v": [STREAM_MODE, chunk] }).to_string(),
            ]
        })
        .collect()
}

/// Unsubscribe frames for a token batch, chunked.
#[must_use]
pub fn unsubscribe_frames(tokens: &[u64]) -> Vec<String> {
    tokens
        .chunks(MAX_TOKENS_PER_FRAME)
        .map(|chunk| serde_json::json!({ "a": "unsubscribe", "v": chunk }).to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> (FeedClient, mpsc::UnboundedSender<FeedCommand>, mpsc::Receiver<ConnectionEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(16);
        let config = FeedClientConfig::new(2, "ws://127.0.0.1:1", ReconnectConfig::default());
        let client = FeedClient::new(config, cmd_rx, event_tx, TickHub::new(8), CancellationToken::new());
        (client, cmd_tx, event_rx)
    }

    #[test]
    fn subscribe_frame_layout() {
        let frames = subscribe_frames(&[256_265, 260_105]);
        assert_eq!(frames.len(), 2);

        let subscribe: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(subscribe["a"], "subscribe");
        assert_eq!(subscribe["v"], serde_json::json!([256_265, 260_105]));

        let mode: serde_json::Value = serde_json::from_str(&frames[1]).unwrap();
        assert_eq!(mode["a"], "mode");
        assert_eq!(mode["v"], serde_json::json!(["full", [256_265, 260_105]]));
    }

    #[test]
    fn frames_are_chunked() {
        let tokens: Vec<u64> = (0..2500).collect();
        assert_eq!(subscribe_frames(&tokens).len(), 6);
        assert_eq!(unsubscribe_frames(&tokens).len(), 3);
        assert!(subscribe_frames(&[]).is_empty());
    }

    #[test]
    fn apply_only_emits_changes() {
        let (mut client, _tx, _rx) = client();

        assert_eq!(client.apply(FeedCommand::Subscribe(vec![1, 2])).len(), 2);
        assert!(client.apply(FeedCommand::Subscribe(vec![1, 2])).is_empty());
        assert!(client.apply(FeedCommand::Unsubscribe(vec![9])).is_empty());

        let frames = client.apply(FeedCommand::Unsubscribe(vec![1, 9]));
        let frame: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame["v"], serde_json::json!([1]));
        assert_eq!(client.desired().iter().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[tokio::test]
    async fn offline_wait_tracks_commands() {
        let (mut client, tx, _rx) = client();
        tx.send(FeedCommand::Subscribe(vec![7, 8])).unwrap();
        tx.send(FeedCommand::Unsubscribe(vec![8])).unwrap();

        assert!(client.wait_offline(Duration::from_millis(20)).await);
        assert_eq!(client.desired().len(), 1);
        assert!(client.desired().contains(&7));
    }

    #[tokio::test]
    async fn cancelled_client_reports_closed() {
        let (client, _tx, mut rx) = client();
        client.cancel.cancel();

        client.run().await.unwrap();
        assert_eq!(rx.recv().await, Some(ConnectionEvent::Closed { connection: 2 }));
    }

    #[tokio::test]
    async fn unreachable_server_degrades_after_budget() {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let reconnect = ReconnectConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 1.0,
            jitter_factor: 0.0,
            max_attempts: 1,
        };
        let config = FeedClientConfig::new(0, "ws://127.0.0.1:1", reconnect);
        let client = FeedClient::new(config, cmd_rx, event_tx, TickHub::new(8), CancellationToken::new());

        let result = client.run().await;
        drop(cmd_tx);
        assert!(matches!(result, Err(FeedClientError::Reconnect(ReconnectError::Exhausted { attempts: 1, .. }))));

        let mut kinds = Vec::new();
        while let Ok(event) = event_rx.try_recv() {
            kinds.push(std::mem::discriminant(&event));
        }
        assert_eq!(kinds.len(), 4);
        assert_eq!(
            kinds.last(),
            Some(&std::mem::discriminant(&ConnectionEvent::Degraded {
                connection: 0,
                error: String::new()
            }))
        );
    }
}
