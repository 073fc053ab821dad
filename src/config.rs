use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::store::CacheStore;

const CONFIG_KEY: &str = "meeting_config";
const CONFIG_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Meeting duration and warning checkpoints.
///
/// Warnings are expressed as remaining-time thresholds. A timer captures a
/// snapshot of this config when it starts; later config changes only affect
/// meetings started after the refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingTimerConfig {
    /// Total meeting duration in milliseconds.
    pub duration_ms: i64,
    /// First warning fires when this much time remains.
    pub first_warning_remaining_ms: i64,
    /// Second warning fires when this much time remains.
    pub second_warning_remaining_ms: i64,
}

impl Default for MeetingTimerConfig {
    fn default() -> Self {
        Self {
            duration_ms: 40 * 60 * 1000,             // 40 minutes
            first_warning_remaining_ms: 10 * 60 * 1000, // 10 minutes left
            second_warning_remaining_ms: 5 * 60 * 1000, // 5 minutes left
        }
    }
}

/// Holds the active timer config and refreshes it from the cache so
/// operators can adjust durations without a redeploy.
pub struct ConfigService {
    cache: Arc<dyn CacheStore>,
    current: RwLock<MeetingTimerConfig>,
}

impl ConfigService {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self::with_config(cache, MeetingTimerConfig::default())
    }

    pub fn with_config(cache: Arc<dyn CacheStore>, config: MeetingTimerConfig) -> Self {
        Self {
            cache,
            current: RwLock::new(config),
        }
    }

    /// Returns a snapshot of the active config.
    pub async fn current(&self) -> MeetingTimerConfig {
        self.current.read().await.clone()
    }

    /// Publishes a new config to the cache and applies it locally.
    pub async fn publish(&self, config: MeetingTimerConfig) {
        match serde_json::to_string(&config) {
            Ok(json) => {
                if let Err(e) = self.cache.set(CONFIG_KEY, &json, CONFIG_TTL).await {
                    warn!(error = %e, "Failed to publish meeting config to cache");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize meeting config"),
        }
        *self.current.write().await = config;
    }

    /// Pulls the cached config once. Cache misses and parse failures leave
    /// the active config untouched.
    pub async fn refresh(&self) {
        let cached = match self.cache.get(CONFIG_KEY).await {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Config refresh skipped, cache unavailable");
                return;
            }
        };

        if let Some(json) = cached {
            match serde_json::from_str::<MeetingTimerConfig>(&json) {
                Ok(config) => {
                    let mut current = self.current.write().await;
                    if *current != config {
                        info!(
                            duration_ms = config.duration_ms,
                            "Meeting config updated from cache"
                        );
                        *current = config;
                    }
                }
                Err(e) => warn!(error = %e, "Ignoring malformed cached meeting config"),
            }
        } else {
            debug!("No cached meeting config, keeping current");
        }
    }

    /// Spawns the periodic refresh loop.
    pub fn spawn_refresh_task(self: Arc<Self>, refresh_interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = interval(refresh_interval);
            loop {
                ticker.tick().await;
                self.refresh().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryCacheStore;

    #[tokio::test]
    async fn test_default_config_is_forty_minutes() {
        let config = MeetingTimerConfig::default();
        assert_eq!(config.duration_ms, 2_400_000);
        assert!(config.first_warning_remaining_ms > config.second_warning_remaining_ms);
    }

    #[tokio::test]
    async fn test_refresh_picks_up_published_config() {
        let cache = Arc::new(InMemoryCacheStore::new());
        let publisher = ConfigService::new(Arc::clone(&cache) as Arc<dyn CacheStore>);
        let consumer = ConfigService::new(Arc::clone(&cache) as Arc<dyn CacheStore>);

        let custom = MeetingTimerConfig {
            duration_ms: 60_000,
            first_warning_remaining_ms: 30_000,
            second_warning_remaining_ms: 10_000,
        };
        publisher.publish(custom.clone()).await;

        assert_eq!(consumer.current().await, MeetingTimerConfig::default());
        consumer.refresh().await;
        assert_eq!(consumer.current().await, custom);
    }

    #[tokio::test]
    async fn test_refresh_keeps_current_on_empty_cache() {
        let cache = Arc::new(InMemoryCacheStore::new());
        let service = ConfigService::new(cache);

        service.refresh().await;
        assert_eq!(service.current().await, MeetingTimerConfig::default());
    }
}
