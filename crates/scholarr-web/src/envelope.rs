//! API envelopes and error mapping.
//!
//! Success: `{"data": T, "meta": {"request_id": "..."}}`.
//! Error: `{"error": {"code", "message", "details"}, "meta": {...}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use scholarr_common::ScholarrError;
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

pub type ApiResult<T> = Result<T, ApiError>;

/// Wrap handler data in the success envelope.
pub fn ok<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({
        "data": data,
        "meta": { "request_id": Uuid::new_v4() },
    }))
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", "authentication required")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4();
        if self.status.is_server_error() {
            tracing::error!(%request_id, code = %self.code, message = %self.message, "request failed");
        }
        let body = Json(json!({
            "error": {
                "code": self.code,
                "message": self.message,
                "details": self.details,
            },
            "meta": { "request_id": request_id },
        }));
        (self.status, body).into_response()
    }
}

impl From<ScholarrError> for ApiError {
    fn from(err: ScholarrError) -> Self {
        let status = match &err {
            ScholarrError::Validation(_) => StatusCode::BAD_REQUEST,
            ScholarrError::NotFound(_) => StatusCode::NOT_FOUND,
            ScholarrError::Unauthorized => StatusCode::UNAUTHORIZED,
            ScholarrError::Forbidden(_) => StatusCode::FORBIDDEN,
            ScholarrError::CooldownActive { .. } | ScholarrError::RunInProgress { .. } => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match &err {
            // Unclassified errors keep their detail in the log, not the body.
            ScholarrError::Database(_)
            | ScholarrError::Http(_)
            | ScholarrError::Serialization(_)
            | ScholarrError::Other(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, "internal error");
        }
        Self::new(status, err.code(), message)
    }
}
