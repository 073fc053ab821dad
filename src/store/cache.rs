use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, instrument, warn};

use crate::shared::AppError;

/// Key-value cache with per-key TTL.
///
/// Values are JSON strings; callers own the (de)serialization. Consumers
/// treat cached state as a hint for reconstructing local authoritative state
/// after a restart, never as a remote mutex.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError>;

    /// Stores a value with a TTL; overwrites any existing value (last write wins).
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError>;

    async fn delete(&self, key: &str) -> Result<(), AppError>;

    /// Resets the TTL on an existing key. No-op if the key is gone.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), AppError>;

    async fn exists(&self, key: &str) -> Result<bool, AppError>;

    /// Returns all live keys starting with `prefix`. Used by the timer
    /// recovery scan at startup.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>, AppError>;
}

/// Redis-backed cache store.
///
/// The `MultiplexedConnection` is cheap to clone and safe for concurrent
/// use, so each operation clones it rather than locking.
#[derive(Clone)]
pub struct RedisCacheStore {
    connection: MultiplexedConnection,
}

impl RedisCacheStore {
    pub async fn connect(redis_url: &str) -> Result<Self, AppError> {
        // Do not log the URL, it may carry credentials
        let client = Client::open(redis_url).map_err(|e| {
            error!(error = %e, "Failed to open Redis client");
            AppError::CacheError(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to connect to Redis");
                AppError::CacheError(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self { connection })
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut conn = self.connection.clone();
        conn.get(key).await.map_err(|e| {
            warn!(key = %key, error = %e, "Redis GET failed");
            AppError::CacheError(format!("GET {key}: {e}"))
        })
    }

    #[instrument(skip(self, value))]
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError> {
        let mut conn = self.connection.clone();
        conn.set_ex(key, value, ttl.as_secs()).await.map_err(|e| {
            warn!(key = %key, error = %e, "Redis SETEX failed");
            AppError::CacheError(format!("SETEX {key}: {e}"))
        })
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self.connection.clone();
        conn.del(key).await.map_err(|e| {
            warn!(key = %key, error = %e, "Redis DEL failed");
            AppError::CacheError(format!("DEL {key}: {e}"))
        })
    }

    #[instrument(skip(self))]
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), AppError> {
        let mut conn = self.connection.clone();
        conn.expire(key, ttl.as_secs() as i64).await.map_err(|e| {
            warn!(key = %key, error = %e, "Redis EXPIRE failed");
            AppError::CacheError(format!("EXPIRE {key}: {e}"))
        })
    }

    #[instrument(skip(self))]
    async fn exists(&self, key: &str) -> Result<bool, AppError> {
        let mut conn = self.connection.clone();
        conn.exists(key).await.map_err(|e| {
            warn!(key = %key, error = %e, "Redis EXISTS failed");
            AppError::CacheError(format!("EXISTS {key}: {e}"))
        })
    }

    #[instrument(skip(self))]
    async fn scan(&self, prefix: &str) -> Result<Vec<String>, AppError> {
        let mut conn = self.connection.clone();
        let pattern = format!("{prefix}*");
        let mut keys = Vec::new();

        let mut iter = conn
            .scan_match::<_, String>(&pattern)
            .await
            .map_err(|e| {
                warn!(prefix = %prefix, error = %e, "Redis SCAN failed");
                AppError::CacheError(format!("SCAN {pattern}: {e}"))
            })?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }

        debug!(prefix = %prefix, count = keys.len(), "Cache scan completed");
        Ok(keys)
    }
}

/// In-memory implementation of CacheStore for development and testing.
///
/// TTLs are tracked against the tokio clock so paused-time tests can drive
/// expiry deterministically.
pub struct InMemoryCacheStore {
    entries: Mutex<HashMap<String, (String, tokio::time::Instant)>>,
}

impl Default for InMemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > tokio::time::Instant::now() => {
                Ok(Some(value.clone()))
            }
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            (value.to_string(), tokio::time::Instant::now() + ttl),
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        let mut entries = self.entries.lock().await;
        entries.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), AppError> {
        let mut entries = self.entries.lock().await;
        if let Some((_, expires_at)) = entries.get_mut(key) {
            *expires_at = tokio::time::Instant::now() + ttl;
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, AppError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, AppError> {
        let now = tokio::time::Instant::now();
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .filter(|(key, (_, expires_at))| key.starts_with(prefix) && *expires_at > now)
            .map(|(key, _)| key.clone())
            .collect())
    }
}
