//! Agent registration, heartbeat, and listing.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use flux_agents::AgentRegistration;
use flux_core::NodeName;
use flux_telemetry::names;
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::{STORE_WRITE_MAX_EXECUTION, tenant_from, with_idempotency};
use crate::app::AppRoot;

/// `POST /agents/register`
pub async fn register(
    State(app): State<Arc<AppRoot>>,
    headers: HeaderMap,
    Json(payload): Json<AgentRegistration>,
) -> Result<Response, ApiError> {
    let tenant = tenant_from(&headers)?;
    let app_for_handler = app.clone();
    with_idempotency(&app, &headers, STORE_WRITE_MAX_EXECUTION, move || async move {
        let agent = app_for_handler.registry.register(tenant, payload).await?;
        Ok((StatusCode::OK, serde_json::to_value(agent)?))
    })
    .await
}

/// Heartbeat payload.
#[derive(Debug, Deserialize)]
pub struct HeartbeatPayload {
    /// The agent's node name.
    pub node_id: NodeName,
}

/// `POST /agents/heartbeat`
pub async fn heartbeat(
    State(app): State<Arc<AppRoot>>,
    headers: HeaderMap,
    Json(payload): Json<HeartbeatPayload>,
) -> Result<Response, ApiError> {
    if !app.heartbeat_limiter.try_acquire() {
        return Ok(rate_limited(&app, "heartbeat"));
    }
    let tenant = tenant_from(&headers)?;
    let app_for_handler = app.clone();
    with_idempotency(&app, &headers, STORE_WRITE_MAX_EXECUTION, move || async move {
        app_for_handler
            .registry
            .heartbeat(tenant, &payload.node_id)
            .await?;
        Ok((StatusCode::NO_CONTENT, serde_json::Value::Null))
    })
    .await
}

/// `GET /agents`
pub async fn list(
    State(app): State<Arc<AppRoot>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let tenant = tenant_from(&headers)?;
    let agents = app.registry.list(tenant).await?;
    Ok((StatusCode::OK, Json(agents)).into_response())
}

/// Shared 429 shape for exhausted token buckets.
pub fn rate_limited(app: &Arc<AppRoot>, endpoint: &str) -> Response {
    app.metrics
        .counter_vec(names::API_RATE_LIMITED_TOTAL, &["endpoint"])
        .with(&[endpoint])
        .inc();
    let retry_after = app.heartbeat_limiter.retry_after_secs();
    (
        StatusCode::TOO_MANY_REQUESTS,
        [("retry-after", retry_after.to_string())],
        Json(serde_json::json!({ "error": "rate limited" })),
    )
        .into_response()
}
