//! Session lifecycle, token blacklist and login-attempt throttling.
//!
//! Session validation is policy-sensitive, so these operations surface
//! store errors instead of treating them as "no session". Statistics and
//! index compaction are maintenance paths and stay fail-open.

use kinetic_core::{CoordError, Result, SharedClock, codes};
use kinetic_kv::{KeyOptions, KeyValueStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

const SESSION_NAMESPACE: &str = "session";
const SESSION_INDEX_NAMESPACE: &str = "session-index";
const BLACKLIST_NAMESPACE: &str = "blacklist";
const LOGIN_ATTEMPTS_NAMESPACE: &str = "login-attempts";

/// Session and lockout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Sliding session lifetime in seconds
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,

    /// Failures per address or identity before lockout
    #[serde(default = "default_max_login_attempts")]
    pub max_login_attempts: u32,

    /// Lockout duration in seconds
    #[serde(default = "default_lockout_secs")]
    pub lockout_secs: u64,

    /// How long failed attempts are remembered, in seconds
    #[serde(default = "default_attempt_window_secs")]
    pub attempt_window_secs: u64,
}

fn default_session_ttl_secs() -> u64 {
    86_400 // 24 hours
}

fn default_max_login_attempts() -> u32 {
    5
}

fn default_lockout_secs() -> u64 {
    900 // 15 minutes
}

fn default_attempt_window_secs() -> u64 {
    900
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl_secs(),
            max_login_attempts: default_max_login_attempts(),
            lockout_secs: default_lockout_secs(),
            attempt_window_secs: default_attempt_window_secs(),
        }
    }
}

impl SessionSettings {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.ttl_secs == 0 {
            return Err("session.ttl_secs must be > 0".to_string());
        }
        if self.max_login_attempts == 0 {
            return Err("session.max_login_attempts must be > 0".to_string());
        }
        if self.lockout_secs == 0 || self.attempt_window_secs == 0 {
            return Err("session.lockout_secs and session.attempt_window_secs must be > 0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub tenant_id: String,
    pub role: String,
    pub identity: String,
    pub address: String,
    pub user_agent: String,
    /// Epoch milliseconds
    pub created_at: i64,
    /// Epoch milliseconds
    pub last_activity: i64,
    pub is_active: bool,
}

/// Attributes of a freshly authenticated caller.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewSession {
    pub user_id: String,
    pub tenant_id: String,
    pub role: String,
    pub identity: String,
    pub address: String,
    pub user_agent: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginAttemptRecord {
    pub attempts: u32,
    /// Epoch milliseconds
    pub last_attempt_at: i64,
    /// Epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_until: Option<i64>,
}

impl LoginAttemptRecord {
    fn locked_at(&self, now_ms: i64) -> Option<i64> {
        self.locked_until.filter(|until| *until > now_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockStatus {
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_until: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub active_sessions: usize,
    pub indexed_users: usize,
    pub blacklisted_tokens: usize,
    pub locked_subjects: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionReport {
    pub indices_scanned: usize,
    pub removed_ids: usize,
    pub deleted_indices: usize,
}

pub struct SessionCoordinator {
    store: KeyValueStore,
    clock: SharedClock,
    settings: SessionSettings,
}

impl SessionCoordinator {
    pub fn new(store: KeyValueStore, clock: SharedClock, settings: SessionSettings) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    fn session_opts(&self) -> KeyOptions {
        KeyOptions::namespace(SESSION_NAMESPACE).with_ttl(self.settings.ttl_secs)
    }

    fn index_opts() -> KeyOptions {
        KeyOptions::namespace(SESSION_INDEX_NAMESPACE).persistent()
    }

    fn attempt_opts(&self) -> KeyOptions {
        let ttl = self.settings.attempt_window_secs.max(self.settings.lockout_secs);
        KeyOptions::namespace(LOGIN_ATTEMPTS_NAMESPACE).with_ttl(ttl)
    }

    // ==================== Sessions ====================

    /// Create a session and add it to the owner's session index.
    pub async fn create_session(&self, new: NewSession) -> Result<String> {
        let now = self.clock.now_millis();
        let session_id = Uuid::new_v4().to_string();
        let record = SessionRecord {
            session_id: session_id.clone(),
            user_id: new.user_id,
            tenant_id: new.tenant_id,
            role: new.role,
            identity: new.identity,
            address: new.address,
            user_agent: new.user_agent,
            created_at: now,
            last_activity: now,
            is_active: true,
        };

        self.store
            .try_set(&session_id, &record, &self.session_opts())
            .await?;

        // Read-modify-write: a concurrent create for the same user can drop an id
        let mut index = self.read_index(&record.user_id).await?;
        if !index.contains(&session_id) {
            index.push(session_id.clone());
        }
        self.store
            .try_set(&record.user_id, &index, &Self::index_opts())
            .await?;

        tracing::info!(
            session_id = %session_id,
            user_id = %record.user_id,
            tenant_id = %record.tenant_id,
            "Session created"
        );
        Ok(session_id)
    }

    /// Fetch a session and extend its expiry to `now + ttl`.
    ///
    /// Returns `None` when the session is absent, inactive, or owned by a
    /// different user than `user_id`.
    pub async fn get_session(&self, session_id: &str, user_id: Option<&str>) -> Result<Option<SessionRecord>> {
        let opts = self.session_opts();
        let Some(mut record) = self.store.try_get::<SessionRecord>(session_id, &opts).await? else {
            return Ok(None);
        };
        if !record.is_active || user_id.is_some_and(|uid| uid != record.user_id) {
            return Ok(None);
        }

        record.last_activity = self.clock.now_millis().max(record.last_activity);
        self.store.try_set(session_id, &record, &opts).await?;
        Ok(Some(record))
    }

    /// Delete a session and remove it from its owner's index.
    pub async fn invalidate_session(&self, session_id: &str, user_id: Option<&str>) -> Result<bool> {
        let opts = self.session_opts();
        let record = self.store.try_get::<SessionRecord>(session_id, &opts).await?;

        let owner = match (&record, user_id) {
            (Some(record), Some(uid)) if record.user_id != uid => return Ok(false),
            (Some(record), _) => Some(record.user_id.clone()),
            (None, uid) => uid.map(str::to_string),
        };

        let deleted = self.store.try_del(session_id, &opts).await?;
        if let Some(owner) = owner {
            self.remove_from_index(&owner, &[session_id.to_string()]).await?;
        }
        if deleted {
            tracing::info!(session_id = %session_id, "Session invalidated");
        }
        Ok(deleted)
    }

    /// Delete every indexed session of `user_id`, returning how many existed.
    pub async fn invalidate_all_sessions(&self, user_id: &str) -> Result<usize> {
        let index = self.read_index(user_id).await?;
        let keys: Vec<String> = index
            .iter()
            .map(|id| self.store.key(id, &self.session_opts()))
            .collect();
        let deleted = self.store.try_del_keys(&keys).await? as usize;
        self.store.try_del(user_id, &Self::index_opts()).await?;

        tracing::info!(user_id = %user_id, deleted, "All sessions invalidated");
        Ok(deleted)
    }

    async fn read_index(&self, user_id: &str) -> Result<Vec<String>> {
        Ok(self
            .store
            .try_get::<Vec<String>>(user_id, &Self::index_opts())
            .await?
            .unwrap_or_default())
    }

    /// Remove ids from an index, deleting the key once it is empty.
    async fn remove_from_index(&self, user_id: &str, session_ids: &[String]) -> Result<usize> {
        let index = self.read_index(user_id).await?;
        let before = index.len();
        let remaining: Vec<String> = index
            .into_iter()
            .filter(|id| !session_ids.contains(id))
            .collect();
        let removed = before - remaining.len();

        if remaining.is_empty() {
            self.store.try_del(user_id, &Self::index_opts()).await?;
        } else if removed > 0 {
            self.store
                .try_set(user_id, &remaining, &Self::index_opts())
                .await?;
        }
        Ok(removed)
    }

    // ==================== Token blacklist ====================

    /// Revoke a token until its own expiry. Already-expired tokens are skipped.
    pub async fn blacklist_token(&self, token_id: &str, expires_at: OffsetDateTime) -> Result<bool> {
        let remaining = expires_at - self.clock.now();
        let ttl_secs = remaining.whole_seconds() + i64::from(remaining.subsec_nanoseconds() > 0);
        if ttl_secs <= 0 {
            return Ok(false);
        }
        let opts = KeyOptions::namespace(BLACKLIST_NAMESPACE)
            .with_ttl(ttl_secs as u64)
            .raw();
        self.store.try_set(token_id, "1", &opts).await?;
        tracing::info!(token_id = %token_id, ttl_secs, "Token blacklisted");
        Ok(true)
    }

    pub async fn is_token_blacklisted(&self, token_id: &str) -> Result<bool> {
        self.store
            .try_exists(token_id, &KeyOptions::namespace(BLACKLIST_NAMESPACE))
            .await
    }

    /// Validate a token id against its expiry and the blacklist.
    pub async fn check_token(&self, token_id: &str, expires_at: OffsetDateTime) -> Result<()> {
        if token_id.trim().is_empty() {
            return Err(CoordError::validation(codes::INVALID_TOKEN, "token id is empty"));
        }
        if expires_at <= self.clock.now() {
            return Err(CoordError::validation(
                codes::TOKEN_EXPIRED,
                format!("token {token_id} has expired"),
            ));
        }
        if self.is_token_blacklisted(token_id).await? {
            return Err(CoordError::validation(
                codes::TOKEN_REVOKED,
                format!("token {token_id} has been revoked"),
            ));
        }
        Ok(())
    }

    // ==================== Login attempts ====================

    fn address_key(address: &str) -> String {
        format!("ip:{address}")
    }

    fn identity_key(identity: &str) -> String {
        format!("identity:{}", identity.to_lowercase())
    }

    async fn bump_attempts(&self, subject_key: &str, now: i64) -> Result<LoginAttemptRecord> {
        let opts = self.attempt_opts();
        let mut record = self
            .store
            .try_get::<LoginAttemptRecord>(subject_key, &opts)
            .await?
            .unwrap_or_default();

        record.attempts = record.attempts.saturating_add(1);
        record.last_attempt_at = now;
        if record.attempts >= self.settings.max_login_attempts && record.locked_at(now).is_none() {
            record.locked_until = Some(now + (self.settings.lockout_secs as i64) * 1000);
        }

        self.store.try_set(subject_key, &record, &opts).await?;
        Ok(record)
    }

    /// Count a failed login for both the address and the identity.
    ///
    /// The two records are updated in separate round trips. The returned
    /// record carries the larger attempt count and the address lockout if
    /// set, otherwise the identity lockout.
    pub async fn record_login_attempt(&self, address: &str, identity: &str) -> Result<LoginAttemptRecord> {
        let now = self.clock.now_millis();
        let by_address = self.bump_attempts(&Self::address_key(address), now).await?;
        let by_identity = self.bump_attempts(&Self::identity_key(identity), now).await?;

        let locked_until = by_address.locked_at(now).or(by_identity.locked_at(now));
        if let Some(until) = locked_until {
            tracing::warn!(
                address = %address,
                identity = %identity,
                locked_until = until,
                "Login locked after repeated failures"
            );
        }

        Ok(LoginAttemptRecord {
            attempts: by_address.attempts.max(by_identity.attempts),
            last_attempt_at: now,
            locked_until,
        })
    }

    /// Reset both attempt records after a successful login.
    pub async fn clear_login_attempts(&self, address: &str, identity: &str) -> Result<()> {
        let opts = self.attempt_opts();
        self.store.try_del(&Self::address_key(address), &opts).await?;
        self.store.try_del(&Self::identity_key(identity), &opts).await?;
        Ok(())
    }

    pub async fn is_blocked(&self, address: &str, identity: &str) -> Result<BlockStatus> {
        let now = self.clock.now_millis();
        let opts = self.attempt_opts();
        let subjects = [
            (Self::address_key(address), "Too many failed login attempts from this address"),
            (Self::identity_key(identity), "Too many failed login attempts for this account"),
        ];
        for (key, reason) in subjects {
            let record = self.store.try_get::<LoginAttemptRecord>(&key, &opts).await?;
            if let Some(until) = record.as_ref().and_then(|r| r.locked_at(now)) {
                return Ok(BlockStatus {
                    blocked: true,
                    reason: Some(reason.to_string()),
                    locked_until: Some(until),
                });
            }
        }
        Ok(BlockStatus::default())
    }

    /// Reject with `ACCOUNT_LOCKED` while either subject is locked.
    pub async fn ensure_not_blocked(&self, address: &str, identity: &str) -> Result<()> {
        let status = self.is_blocked(address, identity).await?;
        if status.blocked {
            return Err(CoordError::validation(
                codes::ACCOUNT_LOCKED,
                status.reason.unwrap_or_default(),
            ));
        }
        Ok(())
    }

    // ==================== Maintenance ====================

    pub async fn session_stats(&self) -> SessionStats {
        let now = self.clock.now_millis();
        let active_sessions = self
            .store
            .keys_matching("*", &KeyOptions::namespace(SESSION_NAMESPACE))
            .await
            .len();
        let indexed_users = self
            .store
            .keys_matching("*", &KeyOptions::namespace(SESSION_INDEX_NAMESPACE))
            .await
            .len();
        let blacklisted_tokens = self
            .store
            .keys_matching("*", &KeyOptions::namespace(BLACKLIST_NAMESPACE))
            .await
            .len();

        let mut locked_subjects = 0;
        for key in self
            .store
            .keys_matching("*", &KeyOptions::namespace(LOGIN_ATTEMPTS_NAMESPACE))
            .await
        {
            let record: Option<LoginAttemptRecord> = self.store.get_key(&key, false).await;
            if record.is_some_and(|r| r.locked_at(now).is_some()) {
                locked_subjects += 1;
            }
        }

        SessionStats {
            active_sessions,
            indexed_users,
            blacklisted_tokens,
            locked_subjects,
        }
    }

    /// Drop ids of expired sessions from every user session index.
    pub async fn compact_session_indices(&self) -> CompactionReport {
        let index_opts = Self::index_opts();
        let session_opts = self.session_opts();
        let index_prefix = self.store.key("", &index_opts);
        let mut report = CompactionReport::default();

        for full_key in self.store.keys_matching("*", &index_opts).await {
            let Some(user_id) = full_key.strip_prefix(index_prefix.as_str()) else {
                continue;
            };
            report.indices_scanned += 1;

            let index: Vec<String> = self.store.get_key(&full_key, false).await.unwrap_or_default();
            let mut stale = Vec::new();
            for session_id in &index {
                if !self.store.exists(session_id, &session_opts).await {
                    stale.push(session_id.clone());
                }
            }
            if stale.is_empty() {
                continue;
            }

            match self.remove_from_index(user_id, &stale).await {
                Ok(removed) => {
                    report.removed_ids += removed;
                    if removed == index.len() {
                        report.deleted_indices += 1;
                    }
                }
                Err(e) => tracing::warn!(user_id = %user_id, error = %e, "Session index compaction failed"),
            }
        }

        tracing::info!(
            scanned = report.indices_scanned,
            removed = report.removed_ids,
            deleted = report.deleted_indices,
            "Session indices compacted"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use kinetic_core::{Clock, ManualClock};

    use super::*;

    fn coordinator() -> (SessionCoordinator, KeyValueStore, ManualClock) {
        let clock = ManualClock::at_millis(1_700_000_000_000);
        let store = KeyValueStore::in_memory(Arc::new(clock.clone()), "kinetic");
        let settings = SessionSettings {
            ttl_secs: 600,
            max_login_attempts: 3,
            lockout_secs: 900,
            attempt_window_secs: 300,
        };
        (
            SessionCoordinator::new(store.clone(), Arc::new(clock.clone()), settings),
            store,
            clock,
        )
    }

    fn login(user_id: &str) -> NewSession {
        NewSession {
            user_id: user_id.to_string(),
            tenant_id: "gym-1".to_string(),
            role: "member".to_string(),
            identity: format!("{user_id}@example.com"),
            address: "10.0.0.1".to_string(),
            user_agent: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_sliding_ttl_extends_on_read() {
        let (sessions, _, clock) = coordinator();
        let id = sessions.create_session(login("u1")).await.unwrap();

        // Reading at t+500 pushes expiry to t+1100
        clock.advance(Duration::from_secs(500));
        let record = sessions.get_session(&id, None).await.unwrap().unwrap();
        assert_eq!(record.last_activity, 1_700_000_500_000);

        clock.advance(Duration::from_secs(500));
        assert!(sessions.get_session(&id, Some("u1")).await.unwrap().is_some());

        // Not read for longer than the TTL
        clock.advance(Duration::from_secs(601));
        assert!(sessions.get_session(&id, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_session_rejects_other_owner() {
        let (sessions, _, _) = coordinator();
        let id = sessions.create_session(login("u1")).await.unwrap();
        assert!(sessions.get_session(&id, Some("u2")).await.unwrap().is_none());
        assert!(!sessions.invalidate_session(&id, Some("u2")).await.unwrap());
        assert!(sessions.get_session(&id, Some("u1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalidate_removes_index_entry_and_empty_index() {
        let (sessions, store, _) = coordinator();
        let first = sessions.create_session(login("u1")).await.unwrap();
        let second = sessions.create_session(login("u1")).await.unwrap();
        let index_opts = SessionCoordinator::index_opts();

        assert!(sessions.invalidate_session(&first, None).await.unwrap());
        let index: Vec<String> = store.get("u1", &index_opts).await.unwrap();
        assert_eq!(index, vec![second.clone()]);

        assert!(sessions.invalidate_session(&second, Some("u1")).await.unwrap());
        assert!(!store.exists("u1", &index_opts).await);
        assert!(!sessions.invalidate_session(&second, Some("u1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalidate_all_sessions() {
        let (sessions, store, _) = coordinator();
        let ids = [
            sessions.create_session(login("u1")).await.unwrap(),
            sessions.create_session(login("u1")).await.unwrap(),
            sessions.create_session(login("u1")).await.unwrap(),
        ];
        let other = sessions.create_session(login("u2")).await.unwrap();

        assert_eq!(sessions.invalidate_all_sessions("u1").await.unwrap(), 3);
        for id in &ids {
            assert!(sessions.get_session(id, None).await.unwrap().is_none());
        }
        assert!(!store.exists("u1", &SessionCoordinator::index_opts()).await);
        assert!(sessions.get_session(&other, None).await.unwrap().is_some());
        assert_eq!(sessions.invalidate_all_sessions("nobody").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_blacklist_lives_until_token_expiry() {
        let (sessions, _, clock) = coordinator();
        let now = clock.now();

        assert!(!sessions.blacklist_token("old", now - time::Duration::seconds(1)).await.unwrap());
        assert!(!sessions.is_token_blacklisted("old").await.unwrap());

        assert!(sessions.blacklist_token("jti-1", now + time::Duration::seconds(30)).await.unwrap());
        assert!(sessions.is_token_blacklisted("jti-1").await.unwrap());
        clock.advance(Duration::from_secs(31));
        assert!(!sessions.is_token_blacklisted("jti-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_check_token_codes() {
        let (sessions, _, clock) = coordinator();
        let later = clock.now() + time::Duration::minutes(5);

        assert_eq!(sessions.check_token("", later).await.unwrap_err().code(), Some(codes::INVALID_TOKEN));
        assert_eq!(
            sessions.check_token("t1", clock.now()).await.unwrap_err().code(),
            Some(codes::TOKEN_EXPIRED)
        );
        assert!(sessions.check_token("t1", later).await.is_ok());

        sessions.blacklist_token("t1", later).await.unwrap();
        assert_eq!(
            sessions.check_token("t1", later).await.unwrap_err().code(),
            Some(codes::TOKEN_REVOKED)
        );
    }

    #[tokio::test]
    async fn test_lockout_after_max_attempts() {
        let (sessions, _, clock) = coordinator();
        let now = clock.now_millis();

        for expected in 1..3 {
            let record = sessions.record_login_attempt("1.2.3.4", "a@x.io").await.unwrap();
            assert_eq!(record.attempts, expected);
            assert_eq!(record.locked_until, None);
        }
        assert!(!sessions.is_blocked("1.2.3.4", "a@x.io").await.unwrap().blocked);

        let record = sessions.record_login_attempt("1.2.3.4", "a@x.io").await.unwrap();
        assert_eq!(record.attempts, 3);
        assert_eq!(record.locked_until, Some(now + 900_000));

        let status = sessions.is_blocked("1.2.3.4", "a@x.io").await.unwrap();
        assert!(status.blocked);
        assert!(status.reason.as_deref().is_some_and(|r| !r.is_empty()));
        let err = sessions.ensure_not_blocked("1.2.3.4", "a@x.io").await.unwrap_err();
        assert_eq!(err.code(), Some(codes::ACCOUNT_LOCKED));

        // The identity is locked from any address
        assert!(sessions.is_blocked("9.9.9.9", "A@X.io").await.unwrap().blocked);

        clock.advance(Duration::from_secs(901));
        assert!(!sessions.is_blocked("1.2.3.4", "a@x.io").await.unwrap().blocked);
    }

    #[tokio::test]
    async fn test_identity_lockout_spans_addresses() {
        let (sessions, _, _) = coordinator();
        sessions.record_login_attempt("1.1.1.1", "target").await.unwrap();
        sessions.record_login_attempt("2.2.2.2", "target").await.unwrap();
        let record = sessions.record_login_attempt("3.3.3.3", "target").await.unwrap();
        assert_eq!(record.attempts, 3);
        assert!(record.locked_until.is_some());

        let status = sessions.is_blocked("4.4.4.4", "target").await.unwrap();
        assert_eq!(
            status.reason.as_deref(),
            Some("Too many failed login attempts for this account")
        );
    }

    #[tokio::test]
    async fn test_successful_login_clears_attempts() {
        let (sessions, _, _) = coordinator();
        sessions.record_login_attempt("1.2.3.4", "a@x.io").await.unwrap();
        sessions.record_login_attempt("1.2.3.4", "a@x.io").await.unwrap();
        sessions.clear_login_attempts("1.2.3.4", "a@x.io").await.unwrap();

        let record = sessions.record_login_attempt("1.2.3.4", "a@x.io").await.unwrap();
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn test_stats_and_compaction() {
        let (sessions, _, clock) = coordinator();
        let stale = sessions.create_session(login("u1")).await.unwrap();
        sessions.create_session(login("u2")).await.unwrap();
        clock.advance(Duration::from_secs(400));
        let fresh = sessions.create_session(login("u1")).await.unwrap();
        clock.advance(Duration::from_secs(300));

        let stats = sessions.session_stats().await;
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.indexed_users, 2);

        let report = sessions.compact_session_indices().await;
        assert_eq!(report.indices_scanned, 2);
        assert_eq!(report.removed_ids, 2);
        assert_eq!(report.deleted_indices, 1);

        // The expired id is gone, the live one is still indexed
        let index: Vec<String> = sessions
            .store
            .get("u1", &SessionCoordinator::index_opts())
            .await
            .unwrap();
        assert_eq!(index, vec![fresh]);
        assert!(!index.contains(&stale));

        assert_eq!(sessions.compact_session_indices().await.removed_ids, 0);
    }

    #[test]
    fn test_settings_validation() {
        assert!(SessionSettings::default().validate().is_ok());
        let settings = SessionSettings {
            ttl_secs: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
