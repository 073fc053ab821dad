use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Registry of live connections, keyed by the per-channel connection id.
///
/// Dropping a connection's sender makes its select loop exit, so
/// `close_connection` doubles as force-disconnect.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    async fn add_connection(&self, connection_id: Uuid, sender: mpsc::UnboundedSender<String>);

    async fn remove_connection(&self, connection_id: &Uuid);

    async fn send_to_connection(&self, connection_id: &Uuid, message: &str);

    async fn send_to_connections(&self, connection_ids: &[Uuid], message: &str);

    /// Presence transitions go to every live connection.
    async fn broadcast_all(&self, message: &str);

    async fn close_connection(&self, connection_id: &Uuid);
}

pub struct InMemoryConnectionManager {
    connections: Arc<RwLock<HashMap<Uuid, mpsc::UnboundedSender<String>>>>,
}

impl Default for InMemoryConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl ConnectionManager for InMemoryConnectionManager {
    async fn add_connection(&self, connection_id: Uuid, sender: mpsc::UnboundedSender<String>) {
        let mut connections = self.connections.write().await;
        connections.insert(connection_id, sender);
    }

    async fn remove_connection(&self, connection_id: &Uuid) {
        let mut connections = self.connections.write().await;
        connections.remove(connection_id);
    }

    async fn send_to_connection(&self, connection_id: &Uuid, message: &str) {
        let connections = self.connections.read().await;
        if let Some(sender) = connections.get(connection_id) {
            let _ = sender.send(message.to_string());
        }
    }

    async fn send_to_connections(&self, connection_ids: &[Uuid], message: &str) {
        let connections = self.connections.read().await;
        for connection_id in connection_ids {
            if let Some(sender) = connections.get(connection_id) {
                let _ = sender.send(message.to_string());
            }
        }
    }

    async fn broadcast_all(&self, message: &str) {
        let connections = self.connections.read().await;
        for sender in connections.values() {
            let _ = sender.send(message.to_string());
        }
    }

    async fn close_connection(&self, connection_id: &Uuid) {
        // Dropping the sender closes the outbound channel; the connection
        // loop then breaks and the socket is closed.
        let mut connections = self.connections.write().await;
        connections.remove(connection_id);
    }
}
