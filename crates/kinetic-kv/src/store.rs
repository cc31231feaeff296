//! Namespaced, JSON-encoding key-value store.
//!
//! Each command comes in two flavours:
//!
//! - `try_*` returns the store error to the caller. Rate limiting and
//!   session validation use these so an outage is never mistaken for
//!   "no data".
//! - the plain variant is fail-open: errors are logged and the caller gets
//!   the null/false/zero answer, as on a cache miss.

use std::sync::Arc;
use std::time::Instant;

use kinetic_core::{CoordError, Result, SharedClock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::backend::{KvBackend, MemoryBackend, NoOpBackend, ServerInfo, StoreMode};
use crate::codec::{CacheKeyCodec, KeyOptions};

/// Store liveness as reported by [`KeyValueStore::health`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub mode: StoreMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct KeyValueStore {
    backend: Arc<dyn KvBackend>,
    codec: CacheKeyCodec,
    default_ttl_secs: Option<u64>,
}

impl KeyValueStore {
    pub fn new(backend: Arc<dyn KvBackend>, codec: CacheKeyCodec) -> Self {
        Self {
            backend,
            codec,
            default_ttl_secs: None,
        }
    }

    /// Store backed by a process-local map.
    pub fn in_memory(clock: SharedClock, prefix: &str) -> Self {
        Self::new(Arc::new(MemoryBackend::new(clock)), CacheKeyCodec::new(prefix))
    }

    /// Store backed by the no-op client.
    pub fn degraded(prefix: &str) -> Self {
        Self::new(Arc::new(NoOpBackend), CacheKeyCodec::new(prefix))
    }

    #[must_use]
    pub fn with_default_ttl(mut self, ttl_secs: Option<u64>) -> Self {
        self.default_ttl_secs = ttl_secs;
        self
    }

    pub fn mode(&self) -> StoreMode {
        self.backend.mode()
    }

    pub fn codec(&self) -> &CacheKeyCodec {
        &self.codec
    }

    /// Physical key for `base_key` under `opts`.
    pub fn key(&self, base_key: &str, opts: &KeyOptions) -> String {
        self.codec.build(base_key, opts)
    }

    fn encode<T: Serialize + ?Sized>(value: &T, raw_string: bool) -> Result<String> {
        if raw_string {
            if let Value::String(s) = serde_json::to_value(value)? {
                return Ok(s);
            }
        }
        Ok(serde_json::to_string(value)?)
    }

    fn decode<T: DeserializeOwned>(raw: String, raw_string: bool) -> Result<T> {
        if raw_string {
            return Ok(serde_json::from_value(Value::String(raw))?);
        }
        Ok(serde_json::from_str(&raw)?)
    }

    // ==================== Strict commands ====================

    pub async fn try_get<T: DeserializeOwned>(
        &self,
        base_key: &str,
        opts: &KeyOptions,
    ) -> Result<Option<T>> {
        let key = self.key(base_key, opts);
        self.try_get_key(&key, opts.raw_string).await
    }

    /// Read by physical key (as returned from [`KeyValueStore::try_keys_matching`]).
    pub async fn try_get_key<T: DeserializeOwned>(
        &self,
        full_key: &str,
        raw_string: bool,
    ) -> Result<Option<T>> {
        match self.backend.get(full_key).await? {
            Some(raw) => Self::decode(raw, raw_string).map(Some),
            None => Ok(None),
        }
    }

    pub async fn try_set<T: Serialize + ?Sized>(
        &self,
        base_key: &str,
        value: &T,
        opts: &KeyOptions,
    ) -> Result<()> {
        let key = self.key(base_key, opts);
        let payload = Self::encode(value, opts.raw_string)?;
        // An explicit TTL of 0 writes the key without expiry
        let ttl = opts.ttl_secs.or(self.default_ttl_secs).filter(|ttl| *ttl > 0);
        self.backend.set(&key, &payload, ttl).await
    }

    pub async fn try_del(&self, base_key: &str, opts: &KeyOptions) -> Result<bool> {
        let key = self.key(base_key, opts);
        Ok(self.backend.del(&[key]).await? > 0)
    }

    /// Delete physical keys, returning how many existed.
    pub async fn try_del_keys(&self, full_keys: &[String]) -> Result<u64> {
        self.backend.del(full_keys).await
    }

    pub async fn try_exists(&self, base_key: &str, opts: &KeyOptions) -> Result<bool> {
        self.backend.exists(&self.key(base_key, opts)).await
    }

    pub async fn try_expire(&self, base_key: &str, ttl_secs: u64, opts: &KeyOptions) -> Result<bool> {
        self.backend.expire(&self.key(base_key, opts), ttl_secs).await
    }

    pub async fn try_ttl(&self, base_key: &str, opts: &KeyOptions) -> Result<i64> {
        self.backend.ttl(&self.key(base_key, opts)).await
    }

    pub async fn try_incr(&self, base_key: &str, opts: &KeyOptions) -> Result<i64> {
        self.backend.incr(&self.key(base_key, opts)).await
    }

    pub async fn try_incr_with_expire(
        &self,
        base_key: &str,
        ttl_secs: u64,
        opts: &KeyOptions,
    ) -> Result<i64> {
        self.backend
            .incr_with_expire(&self.key(base_key, opts), ttl_secs)
            .await
    }

    pub async fn try_pipeline_incr_expire(
        &self,
        items: &[(&str, u64)],
        opts: &KeyOptions,
    ) -> Result<Vec<i64>> {
        let items: Vec<(String, u64)> = items
            .iter()
            .map(|(base, ttl)| (self.key(base, opts), *ttl))
            .collect();
        self.backend.pipeline_incr_expire(&items).await
    }

    /// Physical keys matching a glob under `opts`' scope.
    pub async fn try_keys_matching(&self, pattern: &str, opts: &KeyOptions) -> Result<Vec<String>> {
        self.backend.keys(&self.codec.pattern(pattern, opts)).await
    }

    pub async fn try_info(&self) -> Result<ServerInfo> {
        self.backend.info().await
    }

    // ==================== Fail-open commands ====================

    pub async fn get<T: DeserializeOwned>(&self, base_key: &str, opts: &KeyOptions) -> Option<T> {
        match self.try_get(base_key, opts).await {
            Ok(value) => value,
            Err(e) => {
                log_degraded("get", base_key, &e);
                None
            }
        }
    }

    pub async fn get_key<T: DeserializeOwned>(&self, full_key: &str, raw_string: bool) -> Option<T> {
        match self.try_get_key(full_key, raw_string).await {
            Ok(value) => value,
            Err(e) => {
                log_degraded("get", full_key, &e);
                None
            }
        }
    }

    pub async fn set<T: Serialize + ?Sized>(&self, base_key: &str, value: &T, opts: &KeyOptions) -> bool {
        match self.try_set(base_key, value, opts).await {
            Ok(()) => true,
            Err(e) => {
                log_degraded("set", base_key, &e);
                false
            }
        }
    }

    pub async fn del(&self, base_key: &str, opts: &KeyOptions) -> bool {
        self.try_del(base_key, opts)
            .await
            .unwrap_or_else(|e| {
                log_degraded("del", base_key, &e);
                false
            })
    }

    pub async fn del_keys(&self, full_keys: &[String]) -> u64 {
        self.try_del_keys(full_keys).await.unwrap_or_else(|e| {
            log_degraded("del", &format!("{} keys", full_keys.len()), &e);
            0
        })
    }

    pub async fn exists(&self, base_key: &str, opts: &KeyOptions) -> bool {
        self.try_exists(base_key, opts).await.unwrap_or_else(|e| {
            log_degraded("exists", base_key, &e);
            false
        })
    }

    pub async fn expire(&self, base_key: &str, ttl_secs: u64, opts: &KeyOptions) -> bool {
        self.try_expire(base_key, ttl_secs, opts)
            .await
            .unwrap_or_else(|e| {
                log_degraded("expire", base_key, &e);
                false
            })
    }

    pub async fn ttl(&self, base_key: &str, opts: &KeyOptions) -> i64 {
        self.try_ttl(base_key, opts).await.unwrap_or_else(|e| {
            log_degraded("ttl", base_key, &e);
            -2
        })
    }

    pub async fn incr(&self, base_key: &str, opts: &KeyOptions) -> i64 {
        self.try_incr(base_key, opts).await.unwrap_or_else(|e| {
            log_degraded("incr", base_key, &e);
            0
        })
    }

    pub async fn incr_with_expire(&self, base_key: &str, ttl_secs: u64, opts: &KeyOptions) -> i64 {
        self.try_incr_with_expire(base_key, ttl_secs, opts)
            .await
            .unwrap_or_else(|e| {
                log_degraded("incr_with_expire", base_key, &e);
                0
            })
    }

    pub async fn pipeline_incr_expire(&self, items: &[(&str, u64)], opts: &KeyOptions) -> Vec<i64> {
        self.try_pipeline_incr_expire(items, opts)
            .await
            .unwrap_or_else(|e| {
                log_degraded("pipeline_incr_expire", &format!("{} keys", items.len()), &e);
                vec![0; items.len()]
            })
    }

    pub async fn keys_matching(&self, pattern: &str, opts: &KeyOptions) -> Vec<String> {
        self.try_keys_matching(pattern, opts)
            .await
            .unwrap_or_else(|e| {
                log_degraded("keys", pattern, &e);
                Vec::new()
            })
    }

    /// Delete every key matching a glob under `opts`' scope.
    pub async fn delete_matching(&self, pattern: &str, opts: &KeyOptions) -> u64 {
        let keys = self.keys_matching(pattern, opts).await;
        if keys.is_empty() {
            return 0;
        }
        self.del_keys(&keys).await
    }

    pub async fn info(&self) -> ServerInfo {
        self.try_info().await.unwrap_or_else(|e| {
            log_degraded("info", "-", &e);
            ServerInfo::new()
        })
    }

    /// Round-trip ping with latency measurement.
    pub async fn health(&self) -> HealthReport {
        let mode = self.mode();
        let started = Instant::now();
        match self.backend.ping().await {
            Ok(()) => HealthReport {
                status: if mode == StoreMode::Degraded {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                },
                mode,
                latency_ms: Some(started.elapsed().as_millis() as u64),
                error: None,
            },
            Err(e) => HealthReport {
                status: HealthStatus::Unhealthy,
                mode,
                latency_ms: None,
                error: Some(e.to_string()),
            },
        }
    }
}

fn log_degraded(op: &str, key: &str, error: &CoordError) {
    tracing::warn!(
        op,
        key = %key,
        error = %error,
        category = %error.category(),
        "Key-value store call failed, continuing without it"
    );
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use kinetic_core::ManualClock;
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Recipe {
        id: u32,
        name: String,
    }

    fn memory_store() -> (KeyValueStore, ManualClock) {
        let clock = ManualClock::at_millis(1_700_000_000_000);
        let store = KeyValueStore::in_memory(Arc::new(clock.clone()), "kinetic");
        (store, clock)
    }

    /// Backend whose every call fails, as a dropped Redis connection would.
    struct FailingBackend;

    #[async_trait]
    impl KvBackend for FailingBackend {
        fn mode(&self) -> StoreMode {
            StoreMode::Redis
        }
        async fn get(&self, _: &str) -> Result<Option<String>> {
            Err(CoordError::store_unavailable("connection reset"))
        }
        async fn set(&self, _: &str, _: &str, _: Option<u64>) -> Result<()> {
            Err(CoordError::store_unavailable("connection reset"))
        }
        async fn del(&self, _: &[String]) -> Result<u64> {
            Err(CoordError::store_unavailable("connection reset"))
        }
        async fn exists(&self, _: &str) -> Result<bool> {
            Err(CoordError::store_unavailable("connection reset"))
        }
        async fn expire(&self, _: &str, _: u64) -> Result<bool> {
            Err(CoordError::store_unavailable("connection reset"))
        }
        async fn ttl(&self, _: &str) -> Result<i64> {
            Err(CoordError::store_unavailable("connection reset"))
        }
        async fn incr(&self, _: &str) -> Result<i64> {
            Err(CoordError::store_unavailable("connection reset"))
        }
        async fn incr_with_expire(&self, _: &str, _: u64) -> Result<i64> {
            Err(CoordError::store_unavailable("connection reset"))
        }
        async fn keys(&self, _: &str) -> Result<Vec<String>> {
            Err(CoordError::store_unavailable("connection reset"))
        }
        async fn info(&self) -> Result<ServerInfo> {
            Err(CoordError::store_unavailable("connection reset"))
        }
        async fn ping(&self) -> Result<()> {
            Err(CoordError::store_unavailable("connection reset"))
        }
    }

    #[tokio::test]
    async fn test_json_round_trip_with_scope() {
        let (store, _) = memory_store();
        let opts = KeyOptions::namespace("recipes").with_tenant("t1").with_user("u1");
        let recipe = Recipe {
            id: 7,
            name: "Oats".into(),
        };
        assert!(store.set("r:7", &recipe, &opts).await);
        assert_eq!(store.get::<Recipe>("r:7", &opts).await, Some(recipe));

        let other_user = KeyOptions::namespace("recipes").with_tenant("t1").with_user("u2");
        assert_eq!(store.get::<Recipe>("r:7", &other_user).await, None);
        let no_tenant = KeyOptions::namespace("recipes").with_user("u1");
        assert_eq!(store.get::<Recipe>("r:7", &no_tenant).await, None);
    }

    #[tokio::test]
    async fn test_raw_string_is_stored_verbatim() {
        let (store, _) = memory_store();
        let opts = KeyOptions::namespace("flags").raw();
        store.set("mode", "maintenance", &opts).await;

        let raw: Option<String> = store.get_key("kinetic:flags:mode", true).await;
        assert_eq!(raw.as_deref(), Some("maintenance"));
        // JSON decoding of the same key fails and degrades to a miss
        let json: Option<String> = store.get_key("kinetic:flags:mode", false).await;
        assert_eq!(json, None);
    }

    #[tokio::test]
    async fn test_default_ttl_applies_when_unset() {
        let (store, clock) = memory_store();
        let store = store.with_default_ttl(Some(60));
        let opts = KeyOptions::namespace("c");
        store.set("k", &1, &opts).await;
        assert_eq!(store.ttl("k", &opts).await, 60);

        store.set("explicit", &1, &opts.clone().with_ttl(5)).await;
        assert_eq!(store.ttl("explicit", &opts).await, 5);

        store.set("forever", &1, &opts.clone().persistent()).await;
        assert_eq!(store.ttl("forever", &opts).await, -1);

        clock.advance(Duration::from_secs(61));
        assert!(!store.exists("k", &opts).await);
        assert!(store.exists("forever", &opts).await);
    }

    #[tokio::test]
    async fn test_counters_and_patterns() {
        let (store, _) = memory_store();
        let opts = KeyOptions::namespace("ratelimit");
        assert_eq!(store.incr_with_expire("ip:1:100", 60, &opts).await, 1);
        assert_eq!(store.incr_with_expire("ip:1:100", 60, &opts).await, 2);
        assert_eq!(store.incr("ip:2:100", &opts).await, 1);
        assert_eq!(store.get::<i64>("ip:1:100", &opts).await, Some(2));

        let counts = store
            .pipeline_incr_expire(&[("ip:1:100", 60), ("ip:3:100", 60)], &opts)
            .await;
        assert_eq!(counts, vec![3, 1]);

        let keys = store.keys_matching("ip:*", &opts).await;
        assert_eq!(keys.len(), 3);
        assert_eq!(store.delete_matching("ip:1:*", &opts).await, 1);
        assert_eq!(store.keys_matching("ip:*", &opts).await.len(), 2);
    }

    #[tokio::test]
    async fn test_fail_open_on_backend_errors() {
        let store = KeyValueStore::new(Arc::new(FailingBackend), CacheKeyCodec::new("k"));
        let opts = KeyOptions::default();

        assert_eq!(store.get::<String>("a", &opts).await, None);
        assert!(!store.set("a", &"v", &opts).await);
        assert_eq!(store.incr_with_expire("a", 10, &opts).await, 0);
        assert!(store.keys_matching("*", &opts).await.is_empty());
        assert_eq!(store.ttl("a", &opts).await, -2);

        // Strict variants surface the failure
        let err = store.try_incr_with_expire("a", 10, &opts).await.unwrap_err();
        assert!(matches!(err, CoordError::StoreUnavailable(_)));

        let health = store.health().await;
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(health.error.is_some());
    }

    #[tokio::test]
    async fn test_degraded_store_behaves_as_noop() {
        let store = KeyValueStore::degraded("k");
        let opts = KeyOptions::default();
        assert!(store.set("a", &1, &opts).await);
        assert_eq!(store.get::<i64>("a", &opts).await, None);
        assert_eq!(store.try_incr_with_expire("a", 10, &opts).await.unwrap(), 0);

        let health = store.health().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.mode, StoreMode::Degraded);
    }

    #[tokio::test]
    async fn test_health_report_serializes_camel_case() {
        let (store, _) = memory_store();
        let health = serde_json::to_value(store.health().await).unwrap();
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["mode"], "memory");
        assert!(health.get("latencyMs").is_some());
        assert!(health.get("error").is_none());
    }
}
