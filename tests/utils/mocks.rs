use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use meetbridge::signaling::ConnectionManager;

// ============================================================================
// Mock Infrastructure
// ============================================================================

/// Records everything sent per connection instead of writing to sockets.
#[derive(Clone)]
pub struct MockConnectionManager {
    sent_messages: Arc<RwLock<HashMap<Uuid, Vec<String>>>>,
    live_connections: Arc<RwLock<Vec<Uuid>>>,
    closed_connections: Arc<RwLock<Vec<Uuid>>>,
}

impl MockConnectionManager {
    pub fn new() -> Self {
        Self {
            sent_messages: Arc::new(RwLock::new(HashMap::new())),
            live_connections: Arc::new(RwLock::new(Vec::new())),
            closed_connections: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn get_messages_for(&self, connection_id: &Uuid) -> Vec<String> {
        self.sent_messages
            .read()
            .await
            .get(connection_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn clear_messages(&self) {
        self.sent_messages.write().await.clear();
    }

    pub async fn was_closed(&self, connection_id: &Uuid) -> bool {
        self.closed_connections
            .read()
            .await
            .contains(connection_id)
    }
}

#[async_trait]
impl ConnectionManager for MockConnectionManager {
    async fn add_connection(&self, connection_id: Uuid, _sender: mpsc::UnboundedSender<String>) {
        self.live_connections.write().await.push(connection_id);
    }

    async fn remove_connection(&self, connection_id: &Uuid) {
        self.live_connections
            .write()
            .await
            .retain(|c| c != connection_id);
    }

    async fn send_to_connection(&self, connection_id: &Uuid, message: &str) {
        self.sent_messages
            .write()
            .await
            .entry(*connection_id)
            .or_default()
            .push(message.to_string());
    }

    async fn send_to_connections(&self, connection_ids: &[Uuid], message: &str) {
        for connection_id in connection_ids {
            self.send_to_connection(connection_id, message).await;
        }
    }

    async fn broadcast_all(&self, message: &str) {
        let live = self.live_connections.read().await.clone();
        for connection_id in &live {
            self.send_to_connection(connection_id, message).await;
        }
    }

    async fn close_connection(&self, connection_id: &Uuid) {
        self.closed_connections.write().await.push(*connection_id);
        self.remove_connection(connection_id).await;
    }
}
