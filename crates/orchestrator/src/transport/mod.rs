//! Publish/subscribe transports connecting orchestrator instances.
//!
//! A transport moves opaque string payloads between named channels. The
//! orchestrator publishes every notification to its workflow's channel and
//! listens on the channels of the workflows it has subscribers for.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

pub use memory::{InMemoryBroker, InMemoryPubSub};
pub use postgres::PgPubSub;

/// Capacity of the inbound message buffer of a transport.
pub const MESSAGE_BUFFER: usize = 1024;

/// A message received on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub channel: String,
    pub payload: String,
}

/// Errors that can occur in a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Database error from sqlx.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The transport's background task is gone.
    #[error("Transport closed")]
    Closed,

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Channel-based publish/subscribe.
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Sends a payload to every listener of a channel.
    async fn publish(&self, channel: &str, payload: String) -> Result<(), TransportError>;

    /// Starts receiving the channel's messages.
    async fn subscribe(&self, channel: &str) -> Result<(), TransportError>;

    /// Stops receiving the channel's messages.
    async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError>;

    /// Stream of messages from every subscribed channel.
    fn messages(&self) -> broadcast::Receiver<TransportMessage>;
}
