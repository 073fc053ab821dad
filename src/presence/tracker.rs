use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::room::Role;
use crate::signaling::connection_manager::ConnectionManager;
use crate::signaling::messages::WireMessage;
use crate::store::CacheStore;

/// TTL on the cached presence record. Refreshed while the user stays
/// connected, so entries left behind by a crashed process self-expire.
const PRESENCE_TTL: Duration = Duration::from_secs(300);

fn presence_key(user_id: &str) -> String {
    format!("presence:{user_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedPresence {
    role: Role,
    connections: Vec<Uuid>,
}

#[derive(Debug, Clone)]
struct PresenceEntry {
    role: Role,
    connections: HashSet<Uuid>,
}

/// Tracks which users currently have at least one live connection.
///
/// In-memory state is authoritative for this process; the cache mirror lets
/// a different instance answer `is_online` after failover. Cache failures
/// degrade to memory-only and never block connection teardown.
pub struct PresenceTracker {
    cache: Arc<dyn CacheStore>,
    connections: Arc<dyn ConnectionManager>,
    users: RwLock<HashMap<String, PresenceEntry>>,
    /// connection id -> owning user, for disconnect cleanup
    owners: RwLock<HashMap<Uuid, String>>,
}

impl PresenceTracker {
    pub fn new(cache: Arc<dyn CacheStore>, connections: Arc<dyn ConnectionManager>) -> Self {
        Self {
            cache,
            connections,
            users: RwLock::new(HashMap::new()),
            owners: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a connection for a user. Broadcasts `user-online` when this
    /// is the user's first live connection.
    #[instrument(skip(self))]
    pub async fn register(&self, user_id: &str, role: Role, connection_id: Uuid) {
        let (first_connection, snapshot) = {
            let mut users = self.users.write().await;
            let entry = users.entry(user_id.to_string()).or_insert(PresenceEntry {
                role,
                connections: HashSet::new(),
            });
            let was_empty = entry.connections.is_empty();
            entry.connections.insert(connection_id);
            entry.role = role;
            (was_empty, entry.connections.iter().copied().collect())
        };

        self.owners
            .write()
            .await
            .insert(connection_id, user_id.to_string());

        self.mirror_to_cache(user_id, role, snapshot).await;

        if first_connection {
            info!(user_id = %user_id, role = role.as_str(), "User came online");
            self.connections
                .broadcast_all(&WireMessage::user_online(user_id.to_string(), role).to_json())
                .await;
        } else {
            debug!(user_id = %user_id, "Additional connection registered");
        }
    }

    /// Removes a connection from its owner's set. Broadcasts `user-offline`
    /// and clears the cache record only when the last connection is gone.
    #[instrument(skip(self))]
    pub async fn unregister(&self, connection_id: &Uuid) {
        let user_id = match self.owners.write().await.remove(connection_id) {
            Some(user_id) => user_id,
            None => return,
        };

        let removal = {
            let mut users = self.users.write().await;
            match users.get_mut(&user_id) {
                Some(entry) => {
                    entry.connections.remove(connection_id);
                    if entry.connections.is_empty() {
                        let role = entry.role;
                        users.remove(&user_id);
                        Some((role, None))
                    } else {
                        Some((entry.role, Some(entry.connections.iter().copied().collect())))
                    }
                }
                None => None,
            }
        };

        match removal {
            Some((role, None)) => {
                if let Err(e) = self.cache.delete(&presence_key(&user_id)).await {
                    warn!(user_id = %user_id, error = %e, "Failed to clear cached presence");
                }
                info!(user_id = %user_id, "User went offline");
                self.connections
                    .broadcast_all(&WireMessage::user_offline(user_id.clone(), role).to_json())
                    .await;
            }
            Some((role, Some(remaining))) => {
                self.mirror_to_cache(&user_id, role, remaining).await;
                debug!(user_id = %user_id, "Connection removed, user still online");
            }
            None => {}
        }
    }

    /// True if the user has a live connection here, or an unexpired cache
    /// record written by any instance.
    pub async fn is_online(&self, user_id: &str) -> bool {
        {
            let users = self.users.read().await;
            if users
                .get(user_id)
                .is_some_and(|e| !e.connections.is_empty())
            {
                return true;
            }
        }

        match self.cache.exists(&presence_key(user_id)).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Presence check degraded to memory-only");
                false
            }
        }
    }

    /// Connection ids for a user, falling back to the cache representation
    /// when this process has none.
    pub async fn connections_for(&self, user_id: &str) -> Vec<Uuid> {
        {
            let users = self.users.read().await;
            if let Some(entry) = users.get(user_id) {
                if !entry.connections.is_empty() {
                    return entry.connections.iter().copied().collect();
                }
            }
        }

        match self.cache.get(&presence_key(user_id)).await {
            Ok(Some(json)) => serde_json::from_str::<CachedPresence>(&json)
                .map(|c| c.connections)
                .unwrap_or_default(),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Connection lookup degraded to memory-only");
                Vec::new()
            }
        }
    }

    /// Role of the user as last registered, if known to this process.
    pub async fn role_of(&self, user_id: &str) -> Option<Role> {
        self.users.read().await.get(user_id).map(|e| e.role)
    }

    async fn mirror_to_cache(&self, user_id: &str, role: Role, connections: Vec<Uuid>) {
        let record = CachedPresence { role, connections };
        match serde_json::to_string(&record) {
            Ok(json) => {
                if let Err(e) = self
                    .cache
                    .set(&presence_key(user_id), &json, PRESENCE_TTL)
                    .await
                {
                    warn!(user_id = %user_id, error = %e, "Failed to mirror presence to cache");
                }
            }
            Err(e) => warn!(user_id = %user_id, error = %e, "Failed to serialize presence"),
        }
    }

    /// Re-arms the TTL on every live user's cache record. A failure for one
    /// user is logged and never blocks the rest of the sweep. Returns the
    /// number of records refreshed.
    pub async fn refresh_cache_ttls(&self) -> usize {
        let user_ids: Vec<String> = {
            let users = self.users.read().await;
            users.keys().cloned().collect()
        };

        let mut refreshed = 0;
        for user_id in user_ids {
            match self.cache.expire(&presence_key(&user_id), PRESENCE_TTL).await {
                Ok(()) => refreshed += 1,
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Presence TTL refresh failed for user");
                }
            }
        }
        refreshed
    }

    /// Spawns the background task that keeps cached presence alive while
    /// this process is healthy.
    pub fn spawn_refresh_task(self: Arc<Self>, refresh_interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = interval(refresh_interval);
            loop {
                ticker.tick().await;
                let refreshed = self.refresh_cache_ttls().await;
                if refreshed > 0 {
                    debug!(users = refreshed, "Refreshed presence TTLs");
                }
            }
        });
    }
}
