//! Desired state management and reconcile triggers.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use flux_core::{FluxError, NodeName, StateId};
use flux_state::DesiredState;
use flux_store::Store;
use flux_telemetry::names;
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::{
    ENQUEUE_MAX_EXECUTION, STORE_WRITE_MAX_EXECUTION, tenant_from, with_idempotency,
};
use crate::app::AppRoot;

/// Declaration payload.
#[derive(Debug, Deserialize)]
pub struct CreateStatePayload {
    /// Target node.
    pub node_id: NodeName,
    /// Probe command.
    pub check_cmd: String,
    /// Remediation command.
    pub apply_cmd: String,
    /// Exit code the check must produce.
    #[serde(default)]
    pub desired_exit_code: i32,
}

/// `POST /states`
pub async fn create(
    State(app): State<Arc<AppRoot>>,
    headers: HeaderMap,
    Json(payload): Json<CreateStatePayload>,
) -> Result<Response, ApiError> {
    let tenant = tenant_from(&headers)?;
    if payload.check_cmd.trim().is_empty() || payload.apply_cmd.trim().is_empty() {
        return Err(FluxError::InvalidInput("check_cmd and apply_cmd are required".into()).into());
    }

    let app_for_handler = app.clone();
    with_idempotency(&app, &headers, STORE_WRITE_MAX_EXECUTION, move || async move {
        let state = DesiredState::new(
            tenant,
            payload.node_id,
            payload.check_cmd,
            payload.apply_cmd,
            payload.desired_exit_code,
        );
        let stored = app_for_handler.store.upsert_state(state).await?;
        Ok((StatusCode::CREATED, serde_json::to_value(stored)?))
    })
    .await
}

/// `GET /states`
pub async fn list(
    State(app): State<Arc<AppRoot>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let tenant = tenant_from(&headers)?;
    let states = app.store.list_states(tenant).await?;
    Ok((StatusCode::OK, Json(states)).into_response())
}

/// `GET /states/{state_id}`
pub async fn get_state(
    State(app): State<Arc<AppRoot>>,
    headers: HeaderMap,
    Path(state_id): Path<StateId>,
) -> Result<Response, ApiError> {
    let tenant = tenant_from(&headers)?;
    let state = app
        .store
        .get_state(tenant, state_id)
        .await?
        .ok_or_else(|| FluxError::not_found("DesiredState", state_id))?;
    Ok((StatusCode::OK, Json(state)).into_response())
}

/// Optional reconcile-trigger tuning.
#[derive(Debug, Default, Deserialize)]
pub struct ReconcilePayload {
    /// Base priority, 0 (most urgent) to 10. Defaults to 5.
    #[serde(default)]
    pub priority: Option<u8>,
}

/// `POST /states/{state_id}/reconcile`
pub async fn reconcile(
    State(app): State<Arc<AppRoot>>,
    headers: HeaderMap,
    Path(state_id): Path<StateId>,
    payload: Option<Json<ReconcilePayload>>,
) -> Result<Response, ApiError> {
    if !app.reconcile_limiter.try_acquire() {
        app.metrics
            .counter_vec(names::API_RATE_LIMITED_TOTAL, &["endpoint"])
            .with(&["reconcile"])
            .inc();
        let retry_after = app.reconcile_limiter.retry_after_secs();
        return Ok((
            StatusCode::TOO_MANY_REQUESTS,
            [("retry-after", retry_after.to_string())],
            Json(serde_json::json!({ "error": "rate limited" })),
        )
            .into_response());
    }

    let tenant = tenant_from(&headers)?;
    let state = app
        .store
        .get_state(tenant, state_id)
        .await?
        .ok_or_else(|| FluxError::not_found("DesiredState", state_id))?;

    let priority = payload.and_then(|Json(p)| p.priority).unwrap_or(5);
    let app_for_handler = app.clone();
    with_idempotency(&app, &headers, ENQUEUE_MAX_EXECUTION, move || async move {
        let req_id = app_for_handler.scheduler.submit(
            tenant,
            state.node.clone(),
            state.state_id,
            priority,
            Duration::from_secs(60),
        )?;
        Ok((
            StatusCode::ACCEPTED,
            serde_json::json!({ "req_id": req_id, "state_id": state.state_id }),
        ))
    })
    .await
}
