//! Shared application state.

use std::sync::Arc;

use kinetic_coord::{JobScheduler, PresenceTracker, RateLimitGuard, SessionCoordinator};
use kinetic_core::SharedClock;
use kinetic_kv::{CacheService, KeyValueStore};

use crate::config::AppConfig;

#[derive(Clone)]
pub struct AppState {
    pub store: KeyValueStore,
    pub cache: Arc<CacheService>,
    pub rate_limit: Arc<RateLimitGuard>,
    pub sessions: Arc<SessionCoordinator>,
    pub presence: Arc<PresenceTracker>,
    pub scheduler: Arc<JobScheduler>,
    pub legacy_headers: bool,
    pub fail_open_on_error: bool,
    pub trust_identity_headers: bool,
}

impl AppState {
    /// Wire every component onto one store. The scheduler is created but not started.
    pub fn new(
        cfg: &AppConfig,
        store: KeyValueStore,
        clock: SharedClock,
        scheduler: Arc<JobScheduler>,
    ) -> Self {
        let sessions = Arc::new(SessionCoordinator::new(
            store.clone(),
            clock.clone(),
            cfg.session.clone(),
        ));
        let presence = Arc::new(PresenceTracker::new(
            store.clone(),
            clock.clone(),
            cfg.presence.clone(),
        ));
        kinetic_coord::jobs::register_builtin_jobs(
            &scheduler,
            store.clone(),
            sessions.clone(),
            presence.clone(),
        );

        Self {
            cache: Arc::new(CacheService::new(store.clone())),
            rate_limit: Arc::new(RateLimitGuard::new(store.clone(), clock, &cfg.rate_limit)),
            sessions,
            presence,
            scheduler,
            legacy_headers: cfg.rate_limit.legacy_headers,
            fail_open_on_error: cfg.rate_limit.fail_open_on_error,
            trust_identity_headers: cfg.rate_limit.trust_identity_headers,
            store,
        }
    }
}
