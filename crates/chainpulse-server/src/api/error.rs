use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use chainpulse_common::PulseError;

/// Newtype so `PulseError` can become a response (orphan rule).
#[derive(Debug)]
pub struct ApiError(pub PulseError);

impl From<PulseError> for ApiError {
    fn from(err: PulseError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::warn!("Request failed: {}", self.0);
        }
        let body = Json(json!({
            "error": self.0.to_string()
        }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
