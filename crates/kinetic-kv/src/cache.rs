//! Cache-aside helper over [`KeyValueStore`].
//!
//! Every operation here is fail-open: a store outage turns reads into
//! misses and writes into no-ops, and the loader result is returned anyway.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use kinetic_core::{Result, metric_names};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec::KeyOptions;
use crate::store::KeyValueStore;

/// Cache statistics for monitoring.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub invalidations: u64,
    pub hit_rate: f64,
}

impl CacheStats {
    /// Hit rate as a percentage.
    pub fn compute_hit_rate(hits: u64, misses: u64) -> f64 {
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64) * 100.0
        }
    }
}

pub struct CacheService {
    store: KeyValueStore,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    invalidations: AtomicU64,
}

impl CacheService {
    pub fn new(store: KeyValueStore) -> Self {
        Self {
            store,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &KeyValueStore {
        &self.store
    }

    pub async fn get<T: DeserializeOwned>(&self, base_key: &str, opts: &KeyOptions) -> Option<T> {
        let value = self.store.get(base_key, opts).await;
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(metric_names::CACHE_LOOKUPS_TOTAL, "result" => "hit").increment(1);
            tracing::debug!(key = %base_key, "Cache hit");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(metric_names::CACHE_LOOKUPS_TOTAL, "result" => "miss").increment(1);
            tracing::debug!(key = %base_key, "Cache miss");
        }
        value
    }

    pub async fn put<T: Serialize + ?Sized>(&self, base_key: &str, value: &T, opts: &KeyOptions) -> bool {
        let written = self.store.set(base_key, value, opts).await;
        if written {
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
        written
    }

    /// Return the cached value, or run `loader` and cache its result.
    ///
    /// Loader errors are returned as-is and nothing is cached.
    pub async fn get_or_load<T, F, Fut>(&self, base_key: &str, opts: &KeyOptions, loader: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(value) = self.get(base_key, opts).await {
            return Ok(value);
        }
        let value = loader().await?;
        self.put(base_key, &value, opts).await;
        Ok(value)
    }

    pub async fn invalidate(&self, base_key: &str, opts: &KeyOptions) -> bool {
        let removed = self.store.del(base_key, opts).await;
        if removed {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Delete every key matching `pattern`, returning the number removed.
    pub async fn invalidate_pattern(&self, pattern: &str, opts: &KeyOptions) -> u64 {
        let removed = self.store.delete_matching(pattern, opts).await;
        self.invalidations.fetch_add(removed, Ordering::Relaxed);
        tracing::info!(pattern = %pattern, removed, "Cache invalidated by pattern");
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        CacheStats {
            hits,
            misses,
            writes: self.writes.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            hit_rate: CacheStats::compute_hit_rate(hits, misses),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use kinetic_core::{CoordError, ManualClock};
    use serde_json::json;

    use super::*;
    use crate::codec::CacheKeyCodec;

    fn service() -> CacheService {
        let clock = ManualClock::at_millis(1_700_000_000_000);
        CacheService::new(KeyValueStore::in_memory(Arc::new(clock), "kinetic"))
    }

    #[tokio::test]
    async fn test_get_or_load_populates_once() {
        let cache = service();
        let opts = KeyOptions::namespace("recipes").with_tenant("t1").with_ttl(60);
        let calls = AtomicUsize::new(0);
        let key = CacheKeyCodec::with_params("list", &json!({"page": 1, "q": "oats"}));

        for _ in 0..3 {
            let value: Vec<String> = cache
                .get_or_load(&key, &opts, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(vec!["oats".to_string()])
                })
                .await
                .unwrap();
            assert_eq!(value, vec!["oats"]);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.writes, 1);
        assert!((stats.hit_rate - 66.666).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_loader_error_is_not_cached() {
        let cache = service();
        let opts = KeyOptions::namespace("recipes");
        let result: Result<u32> = cache
            .get_or_load("broken", &opts, || async {
                Err(CoordError::not_found("recipe", "broken"))
            })
            .await;
        assert!(matches!(result, Err(CoordError::NotFound { .. })));
        assert_eq!(cache.get::<u32>("broken", &opts).await, None);
        assert_eq!(cache.stats().writes, 0);
    }

    #[tokio::test]
    async fn test_invalidate_pattern() {
        let cache = service();
        let opts = KeyOptions::namespace("meals").with_tenant("t1");
        tokio_test::assert_ok!(
            cache
                .get_or_load("plan:1", &opts, || async { Ok(1u32) })
                .await
        );
        cache.put("plan:2", &2u32, &opts).await;
        cache.put("other", &3u32, &opts).await;

        assert_eq!(cache.invalidate_pattern("plan:*", &opts).await, 2);
        assert_eq!(cache.get::<u32>("plan:1", &opts).await, None);
        assert_eq!(cache.get::<u32>("other", &opts).await, Some(3));
        assert!(cache.invalidate("other", &opts).await);
        assert_eq!(cache.stats().invalidations, 3);
    }

    #[tokio::test]
    async fn test_degraded_store_always_loads() {
        let cache = CacheService::new(KeyValueStore::degraded("kinetic"));
        let opts = KeyOptions::namespace("n");
        let first: u32 = cache.get_or_load("k", &opts, || async { Ok(1) }).await.unwrap();
        let second: u32 = cache.get_or_load("k", &opts, || async { Ok(2) }).await.unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(cache.stats().hits, 0);
    }

    #[test]
    fn test_hit_rate_empty() {
        assert_eq!(CacheStats::compute_hit_rate(0, 0), 0.0);
    }
}
