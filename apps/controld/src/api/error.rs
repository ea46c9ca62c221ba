//! `FluxError` to HTTP response mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use flux_core::FluxError;

/// Wrapper giving `FluxError` an HTTP shape.
#[derive(Debug)]
pub struct ApiError(pub FluxError);

impl From<FluxError> for ApiError {
    fn from(err: FluxError) -> Self {
        Self(err)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self(FluxError::InvalidInput(err.to_string()))
    }
}

/// Status code for an error kind.
#[must_use]
pub fn status_for(err: &FluxError) -> StatusCode {
    match err {
        FluxError::NotFound { .. } => StatusCode::NOT_FOUND,
        FluxError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        FluxError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        FluxError::Conflict { .. } | FluxError::Busy { .. } => StatusCode::CONFLICT,
        FluxError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        FluxError::SchedulerRejected { .. } | FluxError::Cancelled { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        FluxError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        FluxError::Transport(_) => StatusCode::BAD_GATEWAY,
        FluxError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}
