//! HTTP mapping of coordination errors.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use kinetic_core::{CoordError, codes};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Coord(#[from] CoordError),

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, codes::INVALID_ARGUMENT),
            Self::Coord(e) => match e {
                CoordError::NotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                CoordError::Validation { code, .. } => {
                    let status = match *code {
                        codes::TOKEN_EXPIRED | codes::TOKEN_REVOKED | codes::INVALID_TOKEN => {
                            StatusCode::UNAUTHORIZED
                        }
                        codes::ACCOUNT_LOCKED => StatusCode::LOCKED,
                        _ => StatusCode::BAD_REQUEST,
                    };
                    (status, *code)
                }
                CoordError::StoreUnavailable(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE")
                }
                CoordError::HandlerFailure { .. }
                | CoordError::Serialization(_)
                | CoordError::Configuration(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            if let Self::Coord(e) = &self {
                tracing::warn!(error = %e, category = %e.category(), "Request failed");
            }
        }

        let body = json!({
            "success": false,
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ApiError::from(CoordError::not_found("session", "s1")), StatusCode::NOT_FOUND),
            (
                ApiError::from(CoordError::validation(codes::TOKEN_REVOKED, "revoked")),
                StatusCode::UNAUTHORIZED,
            ),
            (
                ApiError::from(CoordError::validation(codes::ACCOUNT_LOCKED, "locked")),
                StatusCode::LOCKED,
            ),
            (
                ApiError::from(CoordError::store_unavailable("down")),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (ApiError::bad_request("pattern is required"), StatusCode::BAD_REQUEST),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }
}
