use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::{
    Json,
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, header::RETRY_AFTER},
    middleware::Next,
    response::Response,
};
use kinetic_coord::{RateLimitDecision, RateLimitOutcome, RequestIdentity};
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

// =============================================================================
// Rate Limiting
// =============================================================================

/// Count every request against its route class.
///
/// Allowed requests get `X-RateLimit-*` headers on the handler's response.
/// Rejected requests get a 429 with the same headers plus `Retry-After`.
/// If the store cannot be reached the request fails with 503, or passes
/// through unmetered when `rate_limit.fail_open_on_error` is set.
///
/// A live session named by `X-Session-Id` supplies the caller's user,
/// tenant and role.
pub async fn rate_limit(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let mut identity = request_identity(&req, state.trust_identity_headers);
    let session_id = header_str(req.headers(), SESSION_ID_HEADER).map(str::to_string);
    if let Some(session_id) = session_id {
        attach_session(&state, &session_id, &mut identity).await;
    }

    match state.rate_limit.check(&identity).await {
        Ok(RateLimitOutcome::Bypassed { reason }) => {
            tracing::trace!(path = %identity.path, reason, "Rate limit bypassed");
            next.run(req).await
        }
        Ok(RateLimitOutcome::Decided { class, decision }) => {
            let mut res = if decision.allowed {
                next.run(req).await
            } else {
                tracing::info!(
                    class = %class,
                    ip = %identity.ip,
                    path = %identity.path,
                    retry_after_secs = decision.retry_after_secs,
                    "Request rejected by rate limiter"
                );
                too_many_requests(&decision)
            };
            set_rate_limit_headers(res.headers_mut(), &decision, state.legacy_headers);
            res
        }
        Err(e) if state.fail_open_on_error => {
            tracing::warn!(
                error = %e,
                path = %identity.path,
                "Rate limit store unavailable, allowing request"
            );
            next.run(req).await
        }
        Err(e) => {
            tracing::error!(error = %e, path = %identity.path, "Rate limit check failed");
            ApiError::from(e).into_response()
        }
    }
}

const SESSION_ID_HEADER: &str = "x-session-id";

/// Caller attributes used for bypass rules and counter identity.
///
/// The client address is the first `X-Forwarded-For` entry, then
/// `X-Real-IP`, then the socket peer address. User, tenant and role are
/// read from headers only when `trust_headers` is set.
pub fn request_identity(req: &Request<Body>, trust_headers: bool) -> RequestIdentity {
    let headers = req.headers();
    let ip = header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| header_str(headers, "x-real-ip"))
        .map(str::to_string)
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());

    let trusted = |name: &str| {
        header_str(headers, name)
            .filter(|_| trust_headers)
            .map(str::to_string)
    };

    RequestIdentity {
        ip,
        user_id: trusted("x-user-id"),
        tenant_id: trusted("x-tenant-id"),
        api_key: header_str(headers, "x-api-key").map(str::to_string),
        role: trusted("x-user-role"),
        path: req.uri().path().to_string(),
    }
}

/// Replace user, tenant and role with those of a live session.
async fn attach_session(state: &AppState, session_id: &str, identity: &mut RequestIdentity) {
    match state.sessions.get_session(session_id, None).await {
        Ok(Some(session)) => {
            identity.user_id = Some(session.user_id);
            identity.tenant_id = Some(session.tenant_id);
            identity.role = Some(session.role);
        }
        Ok(None) => {}
        Err(e) => {
            tracing::debug!(error = %e, "Session lookup failed, counting request anonymously");
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

fn set_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision, legacy: bool) {
    let reset_secs = (decision.reset_at_ms + 999).div_euclid(1000);
    let values = [
        ("x-ratelimit-limit", "x-rate-limit-limit", HeaderValue::from(decision.limit)),
        ("x-ratelimit-remaining", "x-rate-limit-remaining", HeaderValue::from(decision.remaining)),
        ("x-ratelimit-reset", "x-rate-limit-reset", HeaderValue::from(reset_secs)),
    ];

    for (name, legacy_name, value) in values {
        if legacy {
            headers.insert(HeaderName::from_static(legacy_name), value.clone());
        }
        headers.insert(HeaderName::from_static(name), value);
    }
}

fn too_many_requests(decision: &RateLimitDecision) -> Response {
    let reset_time = kinetic_core::from_millis(decision.reset_at_ms)
        .format(&Rfc3339)
        .unwrap_or_default();
    let body = json!({
        "success": false,
        "error": {
            "message": "Too many requests, please try again later.",
            "retryAfter": decision.retry_after_secs,
            "limit": decision.limit,
            "remaining": 0,
            "resetTime": reset_time,
        }
    });

    let mut res = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    res.headers_mut()
        .insert(RETRY_AFTER, HeaderValue::from(decision.retry_after_secs));
    res
}

// =============================================================================
// Request Id & Access Metrics
// =============================================================================

pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let header_name = HeaderName::from_static("x-request-id");

    // If the incoming request already has a request-id, preserve it; otherwise generate one
    let req_id_value = req
        .headers()
        .get(&header_name)
        .cloned()
        .or_else(|| HeaderValue::from_str(&Uuid::new_v4().to_string()).ok());

    let Some(req_id_value) = req_id_value else {
        return next.run(req).await;
    };

    // Add to request extensions for downstream usage (e.g., logging)
    req.extensions_mut().insert(req_id_value.clone());

    let mut res = next.run(req).await;
    res.headers_mut().insert(header_name, req_id_value);
    res
}

pub async fn http_metrics(req: Request<Body>, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let res = next.run(req).await;
    crate::metrics::record_http_request(&method, &path, res.status().as_u16(), started.elapsed());
    res
}
