//! Key-value storage layer for Kinetic.
//!
//! - [`KeyValueStore`]: namespaced JSON store with strict and fail-open commands
//! - [`CacheKeyCodec`]: deterministic key layout and parameter hashing
//! - [`CacheService`]: cache-aside helper with hit/miss statistics
//! - [`connect_store`]: build a store from configuration, degrading on failure

pub mod backend;
pub mod cache;
pub mod codec;
pub mod config;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use kinetic_core::SharedClock;

pub use crate::backend::{KvBackend, MemoryBackend, NoOpBackend, RedisBackend, ServerInfo, StoreMode};
pub use crate::cache::{CacheService, CacheStats};
pub use crate::codec::{CacheKeyCodec, KeyOptions};
pub use crate::config::{CacheConfig, RedisConfig};
pub use crate::store::{HealthReport, HealthStatus, KeyValueStore};

/// Create the key-value store from configuration.
///
/// Redis disabled selects the in-memory backend. If Redis is enabled but
/// the pool cannot be created or the first ping fails, the store falls back
/// to the no-op client and the process keeps running.
pub async fn connect_store(
    redis: &RedisConfig,
    cache: &CacheConfig,
    clock: SharedClock,
) -> KeyValueStore {
    let codec = CacheKeyCodec::new(cache.key_prefix.clone());
    let default_ttl = cache.default_ttl();

    if !redis.enabled {
        tracing::info!("Redis disabled, using in-memory store");
        return KeyValueStore::new(Arc::new(MemoryBackend::new(clock)), codec)
            .with_default_ttl(default_ttl);
    }

    tracing::info!(url = %redis.url, "Connecting to Redis");

    let mut redis_config = deadpool_redis::Config::from_url(&redis.url);
    let pool_config = redis_config
        .pool
        .get_or_insert_with(|| deadpool_redis::PoolConfig::new(redis.pool_size));
    pool_config.max_size = redis.pool_size;
    pool_config.timeouts.wait = Some(Duration::from_millis(redis.timeout_ms));
    pool_config.timeouts.create = Some(Duration::from_millis(redis.timeout_ms));
    pool_config.timeouts.recycle = Some(Duration::from_millis(redis.timeout_ms));

    let pool = match redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1)) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to create Redis pool. Falling back to no-op store."
            );
            return KeyValueStore::new(Arc::new(NoOpBackend), codec);
        }
    };

    let store = KeyValueStore::new(Arc::new(RedisBackend::new(pool)), codec.clone())
        .with_default_ttl(default_ttl);
    let health = store.health().await;
    match health.error {
        None => {
            tracing::info!(latency_ms = ?health.latency_ms, "Connected to Redis successfully");
            store
        }
        Some(error) => {
            tracing::warn!(
                error = %error,
                "Failed to connect to Redis. Falling back to no-op store."
            );
            KeyValueStore::new(Arc::new(NoOpBackend), codec)
        }
    }
}
