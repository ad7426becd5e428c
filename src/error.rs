//! Error types for the relay
//!
//! Provides unified error handling using thiserror.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

// == Relay Error Enum ==
/// Unified error type for the relay server.
///
/// Expected conditions (cache miss, expired entry) are modelled as `Ok(None)`
/// by the components themselves; these variants cover the conditions that must
/// reach the HTTP caller with a status and a machine-readable code.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Pickup code or chunk not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Pickup code exists but its record has expired
    #[error("code expired: {0}")]
    Expired(String),

    /// Pickup code already consumed to completion
    #[error("code completed: {0}")]
    Completed(String),

    /// Pickup code reached its usage limit
    #[error("usage limit reached for code {code} ({used}/{limit})")]
    LimitReached { code: String, used: u32, limit: u32 },

    /// Upload completeness check failed; carries the exact index sets so the
    /// sender can resume instead of restarting
    #[error("upload incomplete: {} chunk(s) missing", missing.len())]
    IncompleteUpload { missing: Vec<u32>, extra: Vec<u32> },

    /// Invalid request data
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Malformed cache key (programmer error, never a user condition)
    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<crate::records::RecordError> for RelayError {
    fn from(err: crate::records::RecordError) -> Self {
        RelayError::Internal(err.to_string())
    }
}

// == IntoResponse Implementation ==
impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            RelayError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                json!({ "error": msg }),
            ),
            RelayError::Expired(code) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": self.to_string(), "code": "EXPIRED", "lookupCode": code }),
            ),
            RelayError::Completed(code) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": self.to_string(), "code": "COMPLETED", "lookupCode": code }),
            ),
            RelayError::LimitReached { used, limit, .. } => (
                StatusCode::BAD_REQUEST,
                json!({
                    "error": self.to_string(),
                    "code": "LIMIT_REACHED",
                    "usedCount": used,
                    "limitCount": limit,
                    "remaining": 0,
                }),
            ),
            RelayError::IncompleteUpload { missing, extra } => (
                StatusCode::BAD_REQUEST,
                json!({
                    "error": self.to_string(),
                    "code": "INCOMPLETE_UPLOAD",
                    "missingChunks": missing,
                    "extraChunks": extra,
                }),
            ),
            RelayError::InvalidRequest(msg) | RelayError::InvalidKey(msg) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": msg }),
            ),
            RelayError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": msg }),
            ),
        };

        (status, Json(body)).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the relay.
pub type Result<T> = std::result::Result<T, RelayError>;
