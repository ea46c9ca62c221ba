//! Admin controls, metrics exposition, and health.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use flux_scheduler::AdmissionMode;
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::{ENQUEUE_MAX_EXECUTION, with_idempotency};
use crate::app::AppRoot;

/// Admission mode payload.
#[derive(Debug, Deserialize)]
pub struct AdmissionModePayload {
    /// The mode to switch to.
    pub mode: AdmissionMode,
}

/// `POST /admin/admission-mode`
///
/// Not persisted: a restarted replica comes back in `normal`.
pub async fn set_admission_mode(
    State(app): State<Arc<AppRoot>>,
    headers: HeaderMap,
    Json(payload): Json<AdmissionModePayload>,
) -> Result<Response, ApiError> {
    let app_for_handler = app.clone();
    with_idempotency(&app, &headers, ENQUEUE_MAX_EXECUTION, move || async move {
        app_for_handler.scheduler.mode().set(payload.mode);
        Ok((StatusCode::NO_CONTENT, serde_json::Value::Null))
    })
    .await
}

/// `GET /metrics` -- Prometheus text exposition.
pub async fn metrics(State(app): State<Arc<AppRoot>>) -> Response {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        app.metrics.render(),
    )
        .into_response()
}

/// `GET /healthz`
pub async fn healthz(State(app): State<Arc<AppRoot>>) -> Response {
    let leader = app.leader.borrow().clone();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "node": leader.node,
            "is_leader": leader.is_leader,
            "epoch": leader.epoch,
        })),
    )
        .into_response()
}
