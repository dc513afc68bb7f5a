//! Mapping of [`AdmitError`] onto HTTP responses.

use admitsync_shared::AdmitError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

/// Handler error. Validation maps to 400, missing entities to 404, conflicts
/// to 409 and everything else to 500.
#[derive(Debug)]
pub struct ApiError(pub AdmitError);

impl From<AdmitError> for ApiError {
    fn from(e: AdmitError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            AdmitError::Validation { .. } => StatusCode::BAD_REQUEST,
            AdmitError::NotFound(_) => StatusCode::NOT_FOUND,
            AdmitError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, kind = self.0.kind(), "request failed");
        }
        let body = json!({
            "status": "error",
            "kind": self.0.kind(),
            "error": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
