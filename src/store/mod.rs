// Ephemeral shared store: the only coordination point across process restarts
// and service instances.

pub mod cache;

pub use cache::{CacheStore, InMemoryCacheStore, RedisCacheStore};
