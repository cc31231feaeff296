//! Raw command backends.
//!
//! A backend speaks the small subset of Redis commands the coordination
//! layer needs. Keys passed here are already fully built by the codec.

mod memory;
mod noop;
mod redis;

use std::collections::BTreeMap;

use async_trait::async_trait;
use kinetic_core::Result;
use serde::Serialize;

pub use self::memory::MemoryBackend;
pub use self::noop::NoOpBackend;
pub use self::redis::RedisBackend;

/// `INFO` output grouped by section.
pub type ServerInfo = BTreeMap<String, BTreeMap<String, String>>;

/// Which backend a store is running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// Shared Redis instance
    Redis,
    /// Process-local map
    Memory,
    /// No-op client substituted after a connection failure
    Degraded,
}

impl std::fmt::Display for StoreMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Redis => write!(f, "redis"),
            Self::Memory => write!(f, "memory"),
            Self::Degraded => write!(f, "degraded"),
        }
    }
}

/// Command surface consumed from the key-value store.
#[async_trait]
pub trait KvBackend: Send + Sync {
    fn mode(&self) -> StoreMode;

    /// `GET key`
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// `SET key value [EX ttl]`
    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()>;

    /// `DEL key...`, returning how many keys existed.
    async fn del(&self, keys: &[String]) -> Result<u64>;

    /// `EXISTS key`
    async fn exists(&self, key: &str) -> Result<bool>;

    /// `EXPIRE key ttl`, false when the key does not exist.
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool>;

    /// `TTL key`: -2 when missing, -1 when the key has no expiry.
    async fn ttl(&self, key: &str) -> Result<i64>;

    /// `INCR key`
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Pipelined `INCR key` + `EXPIRE key ttl`.
    async fn incr_with_expire(&self, key: &str, ttl_secs: u64) -> Result<i64>;

    /// Batched [`KvBackend::incr_with_expire`] over several keys.
    async fn pipeline_incr_expire(&self, items: &[(String, u64)]) -> Result<Vec<i64>> {
        let mut counts = Vec::with_capacity(items.len());
        for (key, ttl_secs) in items {
            counts.push(self.incr_with_expire(key, *ttl_secs).await?);
        }
        Ok(counts)
    }

    /// `KEYS pattern`
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// `INFO`-style server statistics.
    async fn info(&self) -> Result<ServerInfo>;

    /// Liveness round trip.
    async fn ping(&self) -> Result<()>;
}

/// Parse the `# Section` / `key:value` text returned by Redis `INFO`.
pub fn parse_info(raw: &str) -> ServerInfo {
    let mut info = ServerInfo::new();
    let mut section = String::from("default");
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(name) = line.strip_prefix('#') {
            section = name.trim().to_ascii_lowercase();
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            info.entry(section.clone())
                .or_default()
                .insert(key.to_string(), value.to_string());
        }
    }
    info
}
