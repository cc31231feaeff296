use serde::Serialize;
use thiserror::Error;

/// Validation failure codes surfaced to callers.
pub mod codes {
    pub const TOKEN_EXPIRED: &str = "TOKEN_EXPIRED";
    pub const TOKEN_REVOKED: &str = "TOKEN_REVOKED";
    pub const INVALID_TOKEN: &str = "INVALID_TOKEN";
    pub const ACCOUNT_LOCKED: &str = "ACCOUNT_LOCKED";
    pub const INVALID_CRON: &str = "INVALID_CRON";
    pub const INVALID_ARGUMENT: &str = "INVALID_ARGUMENT";
}

/// Error types for coordination-layer operations
#[derive(Debug, Error)]
pub enum CoordError {
    #[error("Key-value store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Not found: {kind}/{id}")]
    NotFound { kind: String, id: String },

    #[error("Validation failed ({code}): {message}")]
    Validation { code: &'static str, message: String },

    #[error("Job handler failed: {job_id}: {message}")]
    HandlerFailure { job_id: String, message: String },

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl CoordError {
    /// Create a new StoreUnavailable error
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable(message.into())
    }

    /// Create a new NotFound error
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Create a new Validation error with one of the [`codes`]
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    /// Create a new HandlerFailure error
    pub fn handler_failure(job_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HandlerFailure {
            job_id: job_id.into(),
            message: message.into(),
        }
    }

    /// Create a new Configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Validation code, if this is a validation failure.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::Validation { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Whether callers on fail-open paths should degrade instead of failing.
    pub fn is_degradable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Serialization(_))
    }

    /// Check if this error is a client error (4xx category)
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Validation { .. })
    }

    /// Get error category for logging/monitoring
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::StoreUnavailable(_) => ErrorCategory::StoreUnavailable,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::HandlerFailure { .. } => ErrorCategory::HandlerFailure,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Configuration(_) => ErrorCategory::Configuration,
        }
    }
}

/// Error categories for monitoring and classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    StoreUnavailable,
    NotFound,
    Validation,
    HandlerFailure,
    Serialization,
    Configuration,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StoreUnavailable => write!(f, "store_unavailable"),
            Self::NotFound => write!(f, "not_found"),
            Self::Validation => write!(f, "validation"),
            Self::HandlerFailure => write!(f, "handler_failure"),
            Self::Serialization => write!(f, "serialization"),
            Self::Configuration => write!(f, "configuration"),
        }
    }
}

/// Convenience result type for coordination operations
pub type Result<T> = std::result::Result<T, CoordError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_unavailable() {
        let err = CoordError::store_unavailable("connection refused");
        assert_eq!(
            err.to_string(),
            "Key-value store unavailable: connection refused"
        );
        assert!(err.is_degradable());
        assert!(!err.is_client_error());
        assert_eq!(err.category(), ErrorCategory::StoreUnavailable);
    }

    #[test]
    fn test_validation_carries_code() {
        let err = CoordError::validation(codes::TOKEN_EXPIRED, "token expired at 1700000000");
        assert_eq!(err.code(), Some("TOKEN_EXPIRED"));
        assert!(err.is_client_error());
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert!(err.to_string().contains("TOKEN_EXPIRED"));
    }

    #[test]
    fn test_not_found() {
        let err = CoordError::not_found("job", "presence-sweep");
        assert_eq!(err.to_string(), "Not found: job/presence-sweep");
        assert_eq!(err.code(), None);
        assert_eq!(err.category(), ErrorCategory::NotFound);
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ nope").unwrap_err();
        let err: CoordError = json_err.into();
        assert!(matches!(err, CoordError::Serialization(_)));
        assert!(err.is_degradable());
    }

    #[test]
    fn test_handler_failure_is_not_degradable() {
        let err = CoordError::handler_failure("store-stats", "boom");
        assert!(!err.is_degradable());
        assert_eq!(err.category().to_string(), "handler_failure");
    }

    #[test]
    fn test_category_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCategory::StoreUnavailable).unwrap();
        assert_eq!(json, "\"store_unavailable\"");
    }
}
