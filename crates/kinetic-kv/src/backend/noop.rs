use std::collections::BTreeMap;

use async_trait::async_trait;
use kinetic_core::Result;

use super::{KvBackend, ServerInfo, StoreMode};

/// Stand-in client used when the store is unreachable.
///
/// Reads return nothing, writes report success and counters return 0, so
/// callers see false cache misses and must be idempotent.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpBackend;

#[async_trait]
impl KvBackend for NoOpBackend {
    fn mode(&self) -> StoreMode {
        StoreMode::Degraded
    }

    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: &str, _ttl_secs: Option<u64>) -> Result<()> {
        Ok(())
    }

    async fn del(&self, _keys: &[String]) -> Result<u64> {
        Ok(0)
    }

    async fn exists(&self, _key: &str) -> Result<bool> {
        Ok(false)
    }

    async fn expire(&self, _key: &str, _ttl_secs: u64) -> Result<bool> {
        Ok(true)
    }

    async fn ttl(&self, _key: &str) -> Result<i64> {
        Ok(-2)
    }

    async fn incr(&self, _key: &str) -> Result<i64> {
        Ok(0)
    }

    async fn incr_with_expire(&self, _key: &str, _ttl_secs: u64) -> Result<i64> {
        Ok(0)
    }

    async fn keys(&self, _pattern: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn info(&self) -> Result<ServerInfo> {
        Ok(ServerInfo::from([(
            "server".to_string(),
            BTreeMap::from([("mode".to_string(), StoreMode::Degraded.to_string())]),
        )]))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
