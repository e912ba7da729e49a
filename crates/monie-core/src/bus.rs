//! Registry of connected foreground clients and the worker→client channel.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::cache::GenerationId;
use crate::models::WorkerMessage;

/// Identifier of a connected foreground client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

struct ClientEntry {
    tx: mpsc::UnboundedSender<WorkerMessage>,
    /// Generation currently serving this client's requests
    controller: Option<GenerationId>,
}

/// Clone is cheap - all clones share one client registry.
#[derive(Clone, Default)]
pub struct MessageBus {
    clients: Arc<RwLock<HashMap<ClientId, ClientEntry>>>,
    next_id: Arc<AtomicU64>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client. Messages for it arrive on the returned receiver.
    pub async fn connect(
        &self,
        controller: Option<GenerationId>,
    ) -> (ClientId, mpsc::UnboundedReceiver<WorkerMessage>) {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::unbounded_channel();
        self.clients
            .write()
            .await
            .insert(id, ClientEntry { tx, controller });
        debug!(client = %id, "Client connected");
        (id, rx)
    }

    /// Unregister a client. Returns whether it was connected.
    pub async fn disconnect(&self, id: ClientId) -> bool {
        let removed = self.clients.write().await.remove(&id).is_some();
        if removed {
            debug!(client = %id, "Client disconnected");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    pub async fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.clients.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn controller(&self, id: ClientId) -> Option<GenerationId> {
        self.clients.read().await.get(&id)?.controller.clone()
    }

    /// Send to one client. A client whose receiver is gone is dropped.
    pub async fn post(&self, id: ClientId, message: WorkerMessage) -> bool {
        let mut clients = self.clients.write().await;
        let Some(entry) = clients.get(&id) else {
            debug!(client = %id, "Dropping message for unknown client");
            return false;
        };
        if entry.tx.send(message).is_err() {
            clients.remove(&id);
            debug!(client = %id, "Client channel closed");
            return false;
        }
        true
    }

    /// Send to every connected client. Returns how many received it.
    pub async fn broadcast(&self, message: WorkerMessage) -> usize {
        let mut clients = self.clients.write().await;
        let mut closed = Vec::new();
        for (id, entry) in clients.iter() {
            if entry.tx.send(message.clone()).is_err() {
                closed.push(*id);
            }
        }
        for id in &closed {
            clients.remove(id);
        }
        clients.len()
    }

    /// Put every connected client under `generation` without a reload.
    pub async fn claim(&self, generation: &GenerationId) -> usize {
        let mut clients = self.clients.write().await;
        for entry in clients.values_mut() {
            entry.controller = Some(generation.clone());
        }
        clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RatesDocument;
    use serde_json::json;

    #[tokio::test]
    async fn test_post_reaches_only_target() {
        let bus = MessageBus::new();
        let (a, mut rx_a) = bus.connect(None).await;
        let (_b, mut rx_b) = bus.connect(None).await;

        let msg = WorkerMessage::StatusInfo { version: "v1".into() };
        assert!(bus.post(a, msg.clone()).await);

        assert_eq!(rx_a.try_recv().unwrap(), msg);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_prunes_closed_clients() {
        let bus = MessageBus::new();
        let (_a, mut rx_a) = bus.connect(None).await;
        let (_b, rx_b) = bus.connect(None).await;
        drop(rx_b);

        let delivered = bus.broadcast(WorkerMessage::NewRates(RatesDocument(json!({})))).await;
        assert_eq!(delivered, 1);
        assert_eq!(bus.len().await, 1);
        assert!(rx_a.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_claim_sets_controller() {
        let bus = MessageBus::new();
        let (a, _rx_a) = bus.connect(Some("v1".into())).await;
        let (b, _rx_b) = bus.connect(None).await;

        assert_eq!(bus.claim(&"v2".into()).await, 2);
        assert_eq!(bus.controller(a).await, Some("v2".into()));
        assert_eq!(bus.controller(b).await, Some("v2".into()));
    }

    #[tokio::test]
    async fn test_disconnect_and_unknown_post() {
        let bus = MessageBus::new();
        let (a, _rx) = bus.connect(None).await;
        assert!(bus.disconnect(a).await);
        assert!(!bus.disconnect(a).await);
        assert!(bus.is_empty().await);
        assert!(!bus.post(a, WorkerMessage::StatusInfo { version: "v1".into() }).await);
    }
}
