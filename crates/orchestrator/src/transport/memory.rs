//! In-process transport for running several orchestrator instances in one process.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};

use super::{MESSAGE_BUFFER, PubSubTransport, TransportError, TransportMessage};

struct Peer {
    channels: RwLock<HashSet<String>>,
    sender: broadcast::Sender<TransportMessage>,
}

/// Routes messages between the [`InMemoryPubSub`] handles it created.
///
/// Like a real broker, a publisher subscribed to the channel it publishes
/// on receives its own messages. Dropped handles are forgotten.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    peers: Arc<RwLock<Vec<Weak<Peer>>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a handle connected to this broker.
    pub async fn connect(&self) -> InMemoryPubSub {
        let (sender, _) = broadcast::channel(MESSAGE_BUFFER);
        let peer = Arc::new(Peer {
            channels: RwLock::new(HashSet::new()),
            sender,
        });
        let mut peers = self.peers.write().await;
        peers.retain(|p| p.strong_count() > 0);
        peers.push(Arc::downgrade(&peer));
        drop(peers);

        InMemoryPubSub {
            broker: self.clone(),
            peer,
        }
    }

    /// Number of connected handles.
    pub async fn peer_count(&self) -> usize {
        let mut peers = self.peers.write().await;
        peers.retain(|p| p.strong_count() > 0);
        peers.len()
    }

    async fn route(&self, message: TransportMessage) -> usize {
        let peers: Vec<Arc<Peer>> = {
            let mut peers = self.peers.write().await;
            peers.retain(|p| p.strong_count() > 0);
            peers.iter().filter_map(Weak::upgrade).collect()
        };
        let mut delivered = 0;
        for peer in &peers {
            if !peer.channels.read().await.contains(&message.channel) {
                continue;
            }
            // Fails only when the peer has no live receiver.
            if peer.sender.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

/// One connection to an [`InMemoryBroker`].
pub struct InMemoryPubSub {
    broker: InMemoryBroker,
    peer: Arc<Peer>,
}

impl InMemoryPubSub {
    /// Channels this handle currently receives.
    pub async fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.peer.channels.read().await.iter().cloned().collect();
        channels.sort();
        channels
    }
}

#[async_trait]
impl PubSubTransport for InMemoryPubSub {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), TransportError> {
        let delivered = self
            .broker
            .route(TransportMessage {
                channel: channel.to_string(),
                payload,
            })
            .await;
        tracing::trace!(channel, delivered, "published message");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<(), TransportError> {
        self.peer.channels.write().await.insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError> {
        self.peer.channels.write().await.remove(channel);
        Ok(())
    }

    fn messages(&self) -> broadcast::Receiver<TransportMessage> {
        self.peer.sender.subscribe()
    }
}
