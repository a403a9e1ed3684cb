//! Upstream Feed
//!
//! WebSocket clients for the connection pool, their reconnect policy and
//! the transport that feeds them subscription commands.

pub mod client;
pub mod reconnect;
pub mod transport;

pub use client::{FeedClient, FeedClientConfig, FeedClientError, FeedCommand};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectPolicy};
pub use transport::ChannelFeedTransport;
