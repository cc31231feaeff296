use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
};
use kinetic_coord::{PresenceUpdate, SessionRecord};
use kinetic_core::CoordError;
use kinetic_kv::HealthStatus;
use serde::Deserialize;

use crate::error::ApiResult;
use crate::state::AppState;

pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.store.health().await;
    let status = match health.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    };
    (status, Json(health))
}

pub async fn metrics() -> impl IntoResponse {
    match crate::metrics::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(CONTENT_TYPE, "text/plain")],
            "metrics recorder not installed".to_string(),
        ),
    }
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub user_id: Option<String>,
}

/// Validate a session and slide its expiry.
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<SessionQuery>,
) -> ApiResult<Json<SessionRecord>> {
    let session = state
        .sessions
        .get_session(&session_id, query.user_id.as_deref())
        .await?
        .ok_or_else(|| CoordError::not_found("session", &session_id))?;
    Ok(Json(session))
}

/// Record user activity. Presence writes are fail-open, so this always accepts.
pub async fn presence_heartbeat(
    State(state): State<AppState>,
    Json(update): Json<PresenceUpdate>,
) -> StatusCode {
    state.presence.heartbeat(&update).await;
    StatusCode::ACCEPTED
}
