//! The HTTP error taxonomy observed by clients, realized as a
//! single `axum::IntoResponse` type so every handler returns one concrete
//! error type instead of ad hoc status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::identity::ValidationError;
use crate::identity::store::IdentityError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed JSON, bad key format, unknown action, duration parse
    /// failure, out-of-range user-id, oversized payload, client cancellation.
    #[error("{0}")]
    BadRequest(String),
    /// Policy denial, or identity resolution failed outright. Body is always
    /// the literal `"access denied"`, never a more specific message — this
    /// variant intentionally discards whatever string it's built from.
    #[error("access denied")]
    Denied,
    /// Notice list filter set by a non-admin.
    #[error("access denied")]
    Forbidden,
    /// Unknown change/notice, or a notice belonging to another user (on a
    /// single-notice GET, to avoid leaking existence via a 403 instead).
    #[error("not found")]
    NotFound,
    #[error("method not allowed")]
    MethodNotAllowed,
    /// Enrollment already open when enroll is re-requested.
    #[error("enrollment already open")]
    Conflict,
    #[error("internal error: {0}")]
    Internal(String),
    #[error("request timed out")]
    Timeout,
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        Self::BadRequest(e.to_string())
    }
}

impl From<IdentityError> for ApiError {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::Conflict(name) => Self::BadRequest(format!("identity {name:?} already exists")),
            IdentityError::NotFound(name) => Self::BadRequest(format!("identity {name:?} not found")),
            IdentityError::Validation(v) => Self::BadRequest(v.to_string()),
            IdentityError::Io(e) => Self::Internal(e.to_string()),
            IdentityError::Serialization(e) => Self::Internal(e.to_string()),
        }
    }
}

#[derive(Serialize)]
struct Body {
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Denied => (StatusCode::UNAUTHORIZED, "access denied".to_string()),
            Self::Forbidden => (StatusCode::FORBIDDEN, "access denied".to_string()),
            Self::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            Self::MethodNotAllowed => (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string()),
            Self::Conflict => (StatusCode::CONFLICT, "enrollment already open".to_string()),
            Self::Internal(msg) => {
                log::error!("internal error: {msg}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
            Self::Timeout => (StatusCode::GATEWAY_TIMEOUT, "request timed out".to_string()),
        };

        (status, axum::Json(Body { message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn denial_body_is_the_literal_access_denied_string() {
        let response = ApiError::Denied.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Body = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.message, "access denied");
    }

    #[tokio::test]
    async fn forbidden_also_masks_to_access_denied() {
        let response = ApiError::Forbidden.into_response();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Body = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.message, "access denied");
    }
}
