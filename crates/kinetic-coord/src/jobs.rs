//! Maintenance jobs registered with every scheduler.

use std::sync::Arc;

use async_trait::async_trait;
use kinetic_core::{CoordError, Result};
use kinetic_kv::{HealthStatus, KeyValueStore};

use crate::presence::PresenceTracker;
use crate::scheduler::{JobHandler, JobScheduler};
use crate::session::SessionCoordinator;

pub const PRESENCE_SWEEP_JOB: &str = "presence-sweep";
pub const SESSION_COMPACTION_JOB: &str = "session-index-compaction";
pub const STORE_STATS_JOB: &str = "store-stats";

/// Marks idle users offline.
pub struct PresenceSweepJob {
    presence: Arc<PresenceTracker>,
}

#[async_trait]
impl JobHandler for PresenceSweepJob {
    fn handler_type(&self) -> &str {
        "presence_sweep"
    }

    async fn run(&self) -> Result<()> {
        self.presence.cleanup_expired_presence().await;
        Ok(())
    }
}

/// Removes expired session ids from user session indices.
pub struct SessionIndexCompactionJob {
    sessions: Arc<SessionCoordinator>,
}

#[async_trait]
impl JobHandler for SessionIndexCompactionJob {
    fn handler_type(&self) -> &str {
        "session_compaction"
    }

    async fn run(&self) -> Result<()> {
        self.sessions.compact_session_indices().await;
        Ok(())
    }
}

/// Logs store health and keyspace size.
pub struct StoreStatsJob {
    store: KeyValueStore,
}

#[async_trait]
impl JobHandler for StoreStatsJob {
    fn handler_type(&self) -> &str {
        "store_stats"
    }

    async fn run(&self) -> Result<()> {
        let health = self.store.health().await;
        if health.status == HealthStatus::Unhealthy {
            return Err(CoordError::store_unavailable(
                health.error.unwrap_or_else(|| "ping failed".to_string()),
            ));
        }

        let info = self.store.info().await;
        let keyspace = info.get("keyspace").cloned().unwrap_or_default();
        tracing::info!(
            mode = %health.mode,
            latency_ms = ?health.latency_ms,
            keyspace = ?keyspace,
            "Key-value store stats"
        );
        Ok(())
    }
}

/// Register the built-in maintenance jobs.
pub fn register_builtin_jobs(
    scheduler: &JobScheduler,
    store: KeyValueStore,
    sessions: Arc<SessionCoordinator>,
    presence: Arc<PresenceTracker>,
) {
    scheduler.register(
        PRESENCE_SWEEP_JOB,
        "Presence idle sweep",
        "*/5 * * * *",
        Arc::new(PresenceSweepJob { presence }),
    );
    scheduler.register(
        SESSION_COMPACTION_JOB,
        "Session index compaction",
        "0 3 * * *",
        Arc::new(SessionIndexCompactionJob { sessions }),
    );
    scheduler.register(
        STORE_STATS_JOB,
        "Key-value store stats",
        "0 * * * *",
        Arc::new(StoreStatsJob { store }),
    );
}
