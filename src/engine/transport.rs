//! In-memory transport
//!
//! Each node owns one transport endpoint identified by an address string.
//! Endpoints reach each other only after being connected explicitly, which
//! lets tests build full meshes, partial meshes, or partitions. Peers are
//! held weakly: an endpoint lives as long as its owning node holds it.

use crate::engine::errors::TransportError;
use raft::prelude::Message;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::sync::mpsc;

/// Message transport used by a `Raft` node
pub trait Transport: Send + Sync {
    /// Address other endpoints use to reach this one
    fn local_addr(&self) -> String;

    /// Send a message to the peer at `target`
    fn send(&self, target: &str, message: Message) -> Result<(), TransportError>;

    /// Deliver a message to this endpoint's consumer (called by peers)
    fn receive(&self, message: Message) -> Result<(), TransportError>;

    /// Take the stream of delivered messages. Only the first call succeeds.
    fn take_consumer(&self) -> Option<mpsc::UnboundedReceiver<Message>>;

    /// Peer management capability, if this transport supports it
    fn with_peers(&self) -> Option<&dyn WithPeers> {
        None
    }
}

/// Transports whose peers can be connected at runtime
pub trait WithPeers {
    /// Route messages for `peer` to the given transport
    fn connect(&self, peer: String, transport: Arc<dyn Transport>);

    /// Stop routing messages to `peer`
    fn disconnect(&self, peer: &str);

    /// Stop routing messages to every peer
    fn disconnect_all(&self);
}

/// Transport that delivers messages through in-process channels
pub struct InmemTransport {
    local_addr: String,

    /// Sender feeding this endpoint's consumer
    consumer_tx: mpsc::UnboundedSender<Message>,

    /// Consumer side, handed to the node at construction
    consumer_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,

    /// Peer registry: address → transport
    peers: RwLock<HashMap<String, Weak<dyn Transport>>>,
}

impl InmemTransport {
    pub fn new(local_addr: impl Into<String>) -> Self {
        let (consumer_tx, consumer_rx) = mpsc::unbounded_channel();
        Self {
            local_addr: local_addr.into(),
            consumer_tx,
            consumer_rx: Mutex::new(Some(consumer_rx)),
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Addresses of all connected peers
    pub fn peers(&self) -> Vec<String> {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
        let mut addresses: Vec<String> = peers.keys().cloned().collect();
        addresses.sort();
        addresses
    }
}

impl Transport for InmemTransport {
    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    fn send(&self, target: &str, message: Message) -> Result<(), TransportError> {
        let peer = {
            let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
            peers.get(target).cloned()
        };
        let Some(peer) = peer else {
            return Err(TransportError::PeerNotFound {
                address: target.to_string(),
            });
        };
        match peer.upgrade() {
            Some(peer) => peer.receive(message),
            None => Err(TransportError::Disconnected {
                address: target.to_string(),
            }),
        }
    }

    fn receive(&self, message: Message) -> Result<(), TransportError> {
        self.consumer_tx
            .send(message)
            .map_err(|_| TransportError::Disconnected {
                address: self.local_addr.clone(),
            })
    }

    fn take_consumer(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.consumer_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn with_peers(&self) -> Option<&dyn WithPeers> {
        Some(self)
    }
}

impl WithPeers for InmemTransport {
    fn connect(&self, peer: String, transport: Arc<dyn Transport>) {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        peers.insert(peer, Arc::downgrade(&transport));
    }

    fn disconnect(&self, peer: &str) {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        peers.remove(peer);
    }

    fn disconnect_all(&self) {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(to: u64) -> Message {
        let mut msg = Message::default();
        msg.to = to;
        msg
    }

    #[tokio::test]
    async fn test_connected_transports_deliver() {
        let t1 = Arc::new(InmemTransport::new("node-0"));
        let t2 = Arc::new(InmemTransport::new("node-1"));
        let mut rx2 = t2.take_consumer().unwrap();

        t1.connect("node-1".to_string(), t2.clone());
        t1.send("node-1", message(2)).unwrap();

        let received = rx2.recv().await.unwrap();
        assert_eq!(received.to, 2);
        assert_eq!(t1.peers(), vec!["node-1".to_string()]);
    }

    #[test]
    fn test_send_to_unknown_peer() {
        let t1 = InmemTransport::new("node-0");
        let result = t1.send("node-9", message(10));
        assert_eq!(
            result,
            Err(TransportError::PeerNotFound {
                address: "node-9".to_string()
            })
        );
    }

    #[test]
    fn test_consumer_taken_once() {
        let t1 = InmemTransport::new("node-0");
        assert!(t1.take_consumer().is_some());
        assert!(t1.take_consumer().is_none());
    }

    #[test]
    fn test_send_after_peer_consumer_dropped() {
        let t1 = InmemTransport::new("node-0");
        let t2 = Arc::new(InmemTransport::new("node-1"));
        drop(t2.take_consumer());

        t1.connect("node-1".to_string(), t2);
        assert_eq!(
            t1.send("node-1", message(2)),
            Err(TransportError::Disconnected {
                address: "node-1".to_string()
            })
        );
    }

    #[test]
    fn test_meshed_transports_are_freed() {
        let t1: Arc<dyn Transport> = Arc::new(InmemTransport::new("node-0"));
        let t2: Arc<dyn Transport> = Arc::new(InmemTransport::new("node-1"));
        t1.with_peers().unwrap().connect("node-1".to_string(), t2.clone());
        t2.with_peers().unwrap().connect("node-0".to_string(), t1.clone());
        assert_eq!(Arc::strong_count(&t1), 1);
        assert_eq!(Arc::strong_count(&t2), 1);

        let freed = Arc::downgrade(&t2);
        drop(t2);
        assert!(freed.upgrade().is_none());
        assert_eq!(
            t1.send("node-1", message(2)),
            Err(TransportError::Disconnected {
                address: "node-1".to_string()
            })
        );
    }

    #[test]
    fn test_disconnect() {
        let t1 = InmemTransport::new("node-0");
        t1.connect("node-1".to_string(), Arc::new(InmemTransport::new("node-1")));
        t1.connect("node-2".to_string(), Arc::new(InmemTransport::new("node-2")));

        t1.disconnect("node-1");
        assert_eq!(t1.peers(), vec!["node-2".to_string()]);

        t1.disconnect_all();
        assert!(t1.peers().is_empty());
        assert!(t1.with_peers().is_some());
    }
}
