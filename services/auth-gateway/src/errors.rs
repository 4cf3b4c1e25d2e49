use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use security_core::SecurityError;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

use crate::models::AuditReason;

pub type Result<T> = std::result::Result<T, ApiError>;

/// Persistence failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Identity already registered")]
    DuplicateIdentity,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Errors surfaced at the HTTP edge.
///
/// Credential and token failures carry no detail; the reason is only logged.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Too many login attempts")]
    RateLimited { retry_after: Duration },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidCredentials | ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Label recorded in the audit trail
    pub fn reason(&self) -> &'static str {
        match self {
            ApiError::InvalidCredentials => "invalid_credentials",
            ApiError::Unauthorized => "unauthorized",
            ApiError::RateLimited { .. } => "rate_limit",
            ApiError::Validation(_) => "validation",
            ApiError::Conflict(_) => "conflict",
            ApiError::NotFound(_) => "not_found",
            ApiError::Internal(_) => "internal",
        }
    }

    fn public_message(&self) -> String {
        match self {
            ApiError::InvalidCredentials => "Invalid credentials".to_string(),
            ApiError::Unauthorized => "Unauthorized".to_string(),
            ApiError::RateLimited { retry_after } => format!(
                "Too many login attempts. Try again in {} seconds.",
                retry_secs(*retry_after)
            ),
            ApiError::Validation(msg) | ApiError::Conflict(msg) | ApiError::NotFound(msg) => {
                msg.clone()
            }
            ApiError::Internal(_) => "Internal server error".to_string(),
        }
    }
}

fn retry_secs(retry_after: Duration) -> u64 {
    // Round up so clients never retry inside the window
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            ApiError::Internal(detail) => error!("Internal error: {}", detail),
            other => debug!("Request failed: {}", other),
        }

        let body = Json(json!({
            "error": self.public_message(),
            "timestamp": Utc::now(),
        }));

        let mut response = (status, body).into_response();
        response.extensions_mut().insert(AuditReason(self.reason()));
        if let ApiError::RateLimited { retry_after } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_secs(retry_after)));
        }
        response
    }
}

impl From<SecurityError> for ApiError {
    fn from(err: SecurityError) -> Self {
        match err {
            SecurityError::InvalidCredentials => ApiError::InvalidCredentials,
            SecurityError::RateLimitExceeded { retry_after } => ApiError::RateLimited { retry_after },
            e if e.is_token_error() => ApiError::Unauthorized,
            e => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateIdentity => {
                ApiError::Conflict("Email already registered".to_string())
            }
            e => ApiError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::from(SecurityError::TokenExpired).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::from(SecurityError::TokenAlgorithmMismatch).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::from(StoreError::DuplicateIdentity).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(SecurityError::Decryption("tag".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_rate_limited_has_retry_after() {
        let response = ApiError::RateLimited {
            retry_after: Duration::from_millis(41_200),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");
    }

    #[test]
    fn test_response_tagged_with_reason() {
        let response = ApiError::InvalidCredentials.into_response();
        assert_eq!(
            response.extensions().get::<AuditReason>(),
            Some(&AuditReason("invalid_credentials"))
        );

        let response = ApiError::from(StoreError::DuplicateIdentity).into_response();
        assert_eq!(
            response.extensions().get::<AuditReason>(),
            Some(&AuditReason("conflict"))
        );
    }

    #[test]
    fn test_internal_detail_hidden() {
        let err = ApiError::Internal("connection refused at 10.0.0.3".into());
        assert_eq!(err.public_message(), "Internal server error");
    }
}
