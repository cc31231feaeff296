//! Operational endpoints, mounted under `/admin`.
//!
//! No authorization happens here; the surrounding deployment is expected to
//! restrict access.
//!
//! # Endpoints
//!
//! - `GET /stats/sessions` - session and lockout counters
//! - `GET /stats/presence` - online users by tenant and role
//! - `GET /stats/cache` - cache hit/miss counters and store mode
//! - `GET /stats/jobs` - scheduled job status
//! - `GET /redis/info` - store server info
//! - `POST /cache/flush` - delete cache keys matching a pattern
//! - `POST /cleanup` - presence sweep plus session index compaction
//! - `POST /jobs/{id}/toggle` - enable or disable a job
//! - `POST /jobs/{id}/run` - run a job now

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use kinetic_coord::{
    CompactionReport, JobRunReport, PresenceStats, ScheduledJob, SessionStats, SweepReport,
};
use kinetic_kv::{CacheStats, KeyOptions, ServerInfo, StoreMode};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/stats/sessions", get(session_stats))
        .route("/stats/presence", get(presence_stats))
        .route("/stats/cache", get(cache_stats))
        .route("/stats/jobs", get(job_stats))
        .route("/redis/info", get(store_info))
        .route("/cache/flush", post(flush_cache))
        .route("/cleanup", post(cleanup))
        .route("/jobs/{id}/toggle", post(toggle_job))
        .route("/jobs/{id}/run", post(run_job))
}

async fn session_stats(State(state): State<AppState>) -> Json<SessionStats> {
    Json(state.sessions.session_stats().await)
}

#[derive(Debug, Deserialize)]
pub struct PresenceStatsQuery {
    pub limit: Option<usize>,
}

async fn presence_stats(
    State(state): State<AppState>,
    Query(query): Query<PresenceStatsQuery>,
) -> Json<PresenceStats> {
    Json(state.presence.get_presence_stats(query.limit).await)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatsResponse {
    pub mode: StoreMode,
    pub key_prefix: String,
    #[serde(flatten)]
    pub stats: CacheStats,
}

async fn cache_stats(State(state): State<AppState>) -> Json<CacheStatsResponse> {
    Json(CacheStatsResponse {
        mode: state.store.mode(),
        key_prefix: state.store.codec().prefix().to_string(),
        stats: state.cache.stats(),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatsResponse {
    pub running: bool,
    pub jobs: Vec<ScheduledJob>,
}

async fn job_stats(State(state): State<AppState>) -> Json<JobStatsResponse> {
    Json(JobStatsResponse {
        running: state.scheduler.is_running(),
        jobs: state.scheduler.jobs_status(),
    })
}

#[derive(Debug, Serialize)]
pub struct StoreInfoResponse {
    pub mode: StoreMode,
    pub info: ServerInfo,
}

async fn store_info(State(state): State<AppState>) -> Json<StoreInfoResponse> {
    Json(StoreInfoResponse {
        mode: state.store.mode(),
        info: state.store.info().await,
    })
}

#[derive(Debug, Deserialize)]
pub struct FlushRequest {
    pub pattern: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushResponse {
    pub pattern: String,
    pub deleted: u64,
}

async fn flush_cache(
    State(state): State<AppState>,
    Json(req): Json<FlushRequest>,
) -> ApiResult<Json<FlushResponse>> {
    let pattern = req.pattern.trim();
    if pattern.is_empty() {
        return Err(ApiError::bad_request("pattern must not be empty"));
    }
    let deleted = state
        .cache
        .invalidate_pattern(pattern, &KeyOptions::default())
        .await;
    Ok(Json(FlushResponse {
        pattern: pattern.to_string(),
        deleted,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResponse {
    pub presence: SweepReport,
    pub sessions: CompactionReport,
}

async fn cleanup(State(state): State<AppState>) -> Json<CleanupResponse> {
    let presence = state.presence.cleanup_expired_presence().await;
    let sessions = state.sessions.compact_session_indices().await;
    Json(CleanupResponse { presence, sessions })
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub enabled: bool,
}

async fn toggle_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ToggleRequest>,
) -> ApiResult<Json<ScheduledJob>> {
    Ok(Json(state.scheduler.toggle_job(&id, req.enabled)?))
}

async fn run_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobRunReport>> {
    Ok(Json(state.scheduler.execute_job_manually(&id).await?))
}
