//! Online status tracking.
//!
//! Each user has a short-lived presence record. Two index arrays (one per
//! tenant, one global) list users believed to be online. Index updates are
//! read-modify-write on a JSON array, so concurrent connects for the same
//! scope can lose an append. A record expiring does not remove the user from
//! the indices; only [`PresenceTracker::set_offline`] and the idle sweep do.
//!
//! All operations are fail-open.

use std::collections::BTreeMap;

use kinetic_core::{SharedClock, metric_names};
use kinetic_kv::{KeyOptions, KeyValueStore};
use serde::{Deserialize, Serialize};

const PRESENCE_NAMESPACE: &str = "presence";
const GLOBAL_INDEX_KEY: &str = "online";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Away => write!(f, "away"),
            Self::Busy => write!(f, "busy"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    #[serde(default)]
    pub identity: String,
    #[serde(default)]
    pub role: String,
    pub tenant_id: String,
    pub status: PresenceStatus,
    /// Epoch milliseconds
    pub last_activity: i64,
    /// Epoch milliseconds
    pub connected_at: i64,
}

/// Connect or heartbeat input.
#[derive(Debug, Clone, Deserialize)]
pub struct PresenceUpdate {
    pub user_id: String,
    pub tenant_id: String,
    #[serde(default = "default_status")]
    pub status: PresenceStatus,
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

fn default_status() -> PresenceStatus {
    PresenceStatus::Online
}

/// Presence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceSettings {
    /// Lifetime of a live presence record, refreshed on activity (seconds)
    #[serde(default = "default_record_ttl_secs")]
    pub record_ttl_secs: u64,

    /// Lifetime of the offline marker (seconds)
    #[serde(default = "default_offline_ttl_secs")]
    pub offline_ttl_secs: u64,

    /// Inactivity after which the sweep marks a user offline (seconds)
    #[serde(default = "default_idle_threshold_secs")]
    pub idle_threshold_secs: u64,

    /// Records returned in the "recently active" list of the stats
    #[serde(default = "default_recent_limit")]
    pub recent_limit: usize,
}

fn default_record_ttl_secs() -> u64 {
    600 // 10 minutes
}

fn default_offline_ttl_secs() -> u64 {
    300
}

fn default_idle_threshold_secs() -> u64 {
    300 // 5 minutes
}

fn default_recent_limit() -> usize {
    10
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            record_ttl_secs: default_record_ttl_secs(),
            offline_ttl_secs: default_offline_ttl_secs(),
            idle_threshold_secs: default_idle_threshold_secs(),
            recent_limit: default_recent_limit(),
        }
    }
}

impl PresenceSettings {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.record_ttl_secs == 0 || self.offline_ttl_secs == 0 {
            return Err("presence TTLs must be > 0".to_string());
        }
        if self.idle_threshold_secs == 0 {
            return Err("presence.idle_threshold_secs must be > 0".to_string());
        }
        if self.idle_threshold_secs >= self.record_ttl_secs {
            // Records expire before the sweep can see them idle, so index
            // entries of silent clients are never reconciled.
            tracing::warn!(
                idle_threshold_secs = self.idle_threshold_secs,
                record_ttl_secs = self.record_ttl_secs,
                "presence.idle_threshold_secs is not below presence.record_ttl_secs"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub scanned: usize,
    pub transitioned: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceStats {
    pub total_online: usize,
    pub by_tenant: BTreeMap<String, usize>,
    pub by_role: BTreeMap<String, usize>,
    pub recent: Vec<PresenceRecord>,
}

pub struct PresenceTracker {
    store: KeyValueStore,
    clock: SharedClock,
    settings: PresenceSettings,
}

impl PresenceTracker {
    pub fn new(store: KeyValueStore, clock: SharedClock, settings: PresenceSettings) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    fn opts() -> KeyOptions {
        KeyOptions::namespace(PRESENCE_NAMESPACE)
    }

    fn record_key(user_id: &str) -> String {
        format!("user:{user_id}:status")
    }

    fn tenant_index_key(tenant_id: &str) -> String {
        format!("tenant:{tenant_id}:online")
    }

    async fn write_record(&self, record: &PresenceRecord, ttl_secs: u64) -> bool {
        self.store
            .set(
                &Self::record_key(&record.user_id),
                record,
                &Self::opts().with_ttl(ttl_secs),
            )
            .await
    }

    async fn read_index(&self, index_key: &str) -> Vec<String> {
        self.store
            .get::<Vec<String>>(index_key, &Self::opts())
            .await
            .unwrap_or_default()
    }

    async fn add_to_index(&self, index_key: &str, user_id: &str) {
        let mut members = self.read_index(index_key).await;
        if members.iter().any(|m| m == user_id) {
            return;
        }
        members.push(user_id.to_string());
        self.store
            .set(index_key, &members, &Self::opts().persistent())
            .await;
    }

    async fn remove_from_index(&self, index_key: &str, user_id: &str) {
        let members = self.read_index(index_key).await;
        let remaining: Vec<String> = members.iter().filter(|m| *m != user_id).cloned().collect();
        if remaining.is_empty() {
            if !members.is_empty() {
                self.store.del(index_key, &Self::opts()).await;
            }
        } else if remaining.len() != members.len() {
            self.store
                .set(index_key, &remaining, &Self::opts().persistent())
                .await;
        }
    }

    /// Mark a user online and add them to the tenant and global indices.
    pub async fn set_online(&self, update: &PresenceUpdate) -> PresenceRecord {
        let now = self.clock.now_millis();
        let status = match update.status {
            PresenceStatus::Offline => PresenceStatus::Online,
            other => other,
        };
        let record = PresenceRecord {
            user_id: update.user_id.clone(),
            identity: update.identity.clone().unwrap_or_default(),
            role: update.role.clone().unwrap_or_default(),
            tenant_id: update.tenant_id.clone(),
            status,
            last_activity: now,
            connected_at: now,
        };
        self.write_record(&record, self.settings.record_ttl_secs).await;
        self.add_to_index(&Self::tenant_index_key(&record.tenant_id), &record.user_id)
            .await;
        self.add_to_index(GLOBAL_INDEX_KEY, &record.user_id).await;

        tracing::debug!(user_id = %record.user_id, tenant_id = %record.tenant_id, "User online");
        record
    }

    /// Write an offline marker and remove the user from both indices.
    ///
    /// `tenant_id` is taken from the current record when not given.
    pub async fn set_offline(&self, user_id: &str, tenant_id: Option<&str>) {
        let now = self.clock.now_millis();
        let existing = self.get_presence(user_id).await;
        let tenant_id = tenant_id
            .map(str::to_string)
            .or_else(|| existing.as_ref().map(|r| r.tenant_id.clone()));

        let record = PresenceRecord {
            user_id: user_id.to_string(),
            identity: existing.as_ref().map(|r| r.identity.clone()).unwrap_or_default(),
            role: existing.as_ref().map(|r| r.role.clone()).unwrap_or_default(),
            tenant_id: tenant_id.clone().unwrap_or_default(),
            status: PresenceStatus::Offline,
            last_activity: now,
            connected_at: existing.as_ref().map_or(now, |r| r.connected_at),
        };
        self.write_record(&record, self.settings.offline_ttl_secs).await;

        if let Some(tenant_id) = tenant_id.as_deref() {
            self.remove_from_index(&Self::tenant_index_key(tenant_id), user_id)
                .await;
        }
        self.remove_from_index(GLOBAL_INDEX_KEY, user_id).await;

        tracing::debug!(user_id = %user_id, "User offline");
    }

    /// Change the status of a connected user. Index membership is untouched.
    ///
    /// Returns false when the user has no live record. Setting
    /// [`PresenceStatus::Offline`] goes through [`PresenceTracker::set_offline`].
    pub async fn update_status(&self, user_id: &str, status: PresenceStatus) -> bool {
        if status == PresenceStatus::Offline {
            self.set_offline(user_id, None).await;
            return true;
        }
        let Some(mut record) = self.get_presence(user_id).await else {
            return false;
        };
        if record.status == PresenceStatus::Offline {
            return false;
        }
        record.status = status;
        record.last_activity = self.clock.now_millis();
        self.write_record(&record, self.settings.record_ttl_secs).await
    }

    /// Refresh the activity timestamp and TTL of a connected user.
    pub async fn update_last_activity(&self, user_id: &str) -> bool {
        let Some(mut record) = self.get_presence(user_id).await else {
            return false;
        };
        if record.status == PresenceStatus::Offline {
            return false;
        }
        record.last_activity = self.clock.now_millis();
        self.write_record(&record, self.settings.record_ttl_secs).await
    }

    /// Connect if needed, otherwise refresh status and activity.
    pub async fn heartbeat(&self, update: &PresenceUpdate) {
        if update.status == PresenceStatus::Offline {
            self.set_offline(&update.user_id, Some(&update.tenant_id)).await;
            return;
        }
        if !self.update_status(&update.user_id, update.status).await {
            self.set_online(update).await;
        }
    }

    pub async fn get_presence(&self, user_id: &str) -> Option<PresenceRecord> {
        self.store.get(&Self::record_key(user_id), &Self::opts()).await
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.get_presence(user_id)
            .await
            .is_some_and(|r| r.status != PresenceStatus::Offline)
    }

    /// Indexed online user ids, for one tenant or globally.
    ///
    /// May include users whose record has expired until the next sweep.
    pub async fn online_users(&self, tenant_id: Option<&str>) -> Vec<String> {
        match tenant_id {
            Some(tenant_id) => self.read_index(&Self::tenant_index_key(tenant_id)).await,
            None => self.read_index(GLOBAL_INDEX_KEY).await,
        }
    }

    /// Live records of every user indexed under `tenant_id`.
    pub async fn tenant_presence(&self, tenant_id: &str) -> Vec<PresenceRecord> {
        let mut records = Vec::new();
        for user_id in self.online_users(Some(tenant_id)).await {
            if let Some(record) = self.get_presence(&user_id).await {
                records.push(record);
            }
        }
        records
    }

    /// Mark every record idle past the threshold offline.
    ///
    /// Offline markers are skipped, so a second run without new activity
    /// transitions nobody.
    pub async fn cleanup_expired_presence(&self) -> SweepReport {
        let now = self.clock.now_millis();
        let idle_ms = (self.settings.idle_threshold_secs as i64) * 1000;
        let mut report = SweepReport::default();

        for key in self.store.keys_matching("user:*:status", &Self::opts()).await {
            let Some(record) = self.store.get_key::<PresenceRecord>(&key, false).await else {
                continue;
            };
            report.scanned += 1;
            if record.status == PresenceStatus::Offline || now - record.last_activity <= idle_ms {
                continue;
            }
            self.set_offline(&record.user_id, Some(&record.tenant_id)).await;
            report.transitioned += 1;
        }

        metrics::counter!(metric_names::PRESENCE_SWEEP_TRANSITIONS_TOTAL).increment(report.transitioned as u64);
        let online = self.online_users(None).await.len();
        metrics::gauge!(metric_names::PRESENCE_ONLINE_USERS).set(online as f64);

        if report.transitioned > 0 {
            tracing::info!(
                scanned = report.scanned,
                transitioned = report.transitioned,
                "Idle presence swept"
            );
        }
        report
    }

    /// Global index counted by tenant and role, plus the most recently
    /// active records.
    pub async fn get_presence_stats(&self, recent_limit: Option<usize>) -> PresenceStats {
        let online = self.online_users(None).await;
        let mut stats = PresenceStats {
            total_online: online.len(),
            ..Default::default()
        };

        let mut records = Vec::with_capacity(online.len());
        for user_id in &online {
            let Some(record) = self.get_presence(user_id).await else {
                continue;
            };
            *stats.by_tenant.entry(record.tenant_id.clone()).or_default() += 1;
            let role = if record.role.is_empty() {
                "unknown".to_string()
            } else {
                record.role.clone()
            };
            *stats.by_role.entry(role).or_default() += 1;
            records.push(record);
        }

        records.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        records.truncate(recent_limit.unwrap_or(self.settings.recent_limit));
        stats.recent = records;
        stats
    }
}
