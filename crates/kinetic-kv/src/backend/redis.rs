use async_trait::async_trait;
use deadpool_redis::Pool;
use kinetic_core::{CoordError, Result};
use redis::AsyncCommands;

use super::{KvBackend, ServerInfo, StoreMode, parse_info};

/// Backend over a pooled Redis connection.
#[derive(Clone)]
pub struct RedisBackend {
    pool: Pool,
}

impl RedisBackend {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool.get().await.map_err(|e| {
            CoordError::store_unavailable(format!("failed to get Redis connection: {e}"))
        })
    }
}

fn store_err(op: &str, e: redis::RedisError) -> CoordError {
    CoordError::store_unavailable(format!("Redis {op} error: {e}"))
}

#[async_trait]
impl KvBackend for RedisBackend {
    fn mode(&self) -> StoreMode {
        StoreMode::Redis
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        conn.get::<_, Option<String>>(key)
            .await
            .map_err(|e| store_err("GET", e))
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        let mut conn = self.conn().await?;
        match ttl_secs {
            Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl).await,
            None => conn.set::<_, _, ()>(key, value).await,
        }
        .map_err(|e| store_err("SET", e))
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        conn.del::<_, u64>(keys.to_vec())
            .await
            .map_err(|e| store_err("DEL", e))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        conn.exists::<_, bool>(key)
            .await
            .map_err(|e| store_err("EXISTS", e))
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        let mut conn = self.conn().await?;
        let updated: bool = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_err("EXPIRE", e))?;
        Ok(updated)
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn().await?;
        conn.ttl::<_, i64>(key)
            .await
            .map_err(|e| store_err("TTL", e))
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn().await?;
        conn.incr::<_, _, i64>(key, 1)
            .await
            .map_err(|e| store_err("INCR", e))
    }

    async fn incr_with_expire(&self, key: &str, ttl_secs: u64) -> Result<i64> {
        let mut conn = self.conn().await?;
        let (count,): (i64,) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| store_err("INCR/EXPIRE pipeline", e))?;
        Ok(count)
    }

    async fn pipeline_incr_expire(&self, items: &[(String, u64)]) -> Result<Vec<i64>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, ttl_secs) in items {
            pipe.cmd("INCR")
                .arg(key)
                .cmd("EXPIRE")
                .arg(key)
                .arg(*ttl_secs)
                .ignore();
        }
        let mut conn = self.conn().await?;
        let counts: Vec<i64> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| store_err("INCR/EXPIRE pipeline", e))?;
        Ok(counts)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        conn.keys::<_, Vec<String>>(pattern)
            .await
            .map_err(|e| store_err("KEYS", e))
    }

    async fn info(&self) -> Result<ServerInfo> {
        let mut conn = self.conn().await?;
        let raw: String = redis::cmd("INFO")
            .query_async(&mut conn)
            .await
            .map_err(|e| store_err("INFO", e))?;
        Ok(parse_info(&raw))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let _pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| store_err("PING", e))?;
        Ok(())
    }
}
