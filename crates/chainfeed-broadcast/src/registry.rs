//! Registered subscriber connections, keyed by connection id.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::connection::SubscriberConnection;
use crate::error::BroadcastError;

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Uuid, Arc<SubscriberConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn`. Fails if its id is already present.
    pub async fn insert(&self, conn: Arc<SubscriberConnection>) -> Result<(), BroadcastError> {
        let mut map = self.connections.write().await;
        let id = conn.id();
        if map.contains_key(&id) {
            return Err(BroadcastError::DuplicateConnection(id));
        }
        map.insert(id, conn);
        Ok(())
    }

    pub async fn remove(&self, id: Uuid) -> Option<Arc<SubscriberConnection>> {
        self.connections.write().await.remove(&id)
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<SubscriberConnection>> {
        self.connections.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Point-in-time copy, so callers can send without holding the lock.
    pub async fn snapshot(&self) -> Vec<Arc<SubscriberConnection>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Remove and return every connection.
    pub async fn drain(&self) -> Vec<Arc<SubscriberConnection>> {
        self.connections
            .write()
            .await
            .drain()
            .map(|(_, conn)| conn)
            .collect()
    }
}
