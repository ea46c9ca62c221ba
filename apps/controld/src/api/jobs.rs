//! Job result ingress and lookup.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use flux_core::{FluxError, JobId};
use flux_state::JobStatus;
use flux_store::Store;
use serde::{Deserialize, Deserializer};

use crate::api::error::ApiError;
use crate::api::{STORE_WRITE_MAX_EXECUTION, tenant_from, with_idempotency};
use crate::app::AppRoot;

/// Terminal result reported by an agent.
///
/// Unknown fields are tolerated; `finished_at` accepts RFC 3339 or Unix
/// seconds.
#[derive(Debug, Deserialize)]
pub struct JobResultPayload {
    /// Terminal status: `completed` or `failed`.
    pub status: JobStatus,
    /// Command exit code.
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Captured stdout.
    #[serde(default)]
    pub stdout: Option<String>,
    /// Captured stderr.
    #[serde(default)]
    pub stderr: Option<String>,
    /// When the command finished on the agent, if reported.
    #[serde(default, deserialize_with = "flexible_timestamp")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// `POST /jobs/{job_id}/result`
pub async fn report_result(
    State(app): State<Arc<AppRoot>>,
    headers: HeaderMap,
    Path(job_id): Path<JobId>,
    Json(payload): Json<JobResultPayload>,
) -> Result<Response, ApiError> {
    let tenant = tenant_from(&headers)?;
    if !payload.status.is_terminal() {
        return Err(FluxError::InvalidInput(format!(
            "job result status must be terminal, got {}",
            payload.status
        ))
        .into());
    }
    let app_for_handler = app.clone();
    with_idempotency(&app, &headers, STORE_WRITE_MAX_EXECUTION, move || async move {
        app_for_handler
            .store
            .update_job_status(
                tenant,
                job_id,
                payload.status,
                payload.exit_code,
                payload.stdout,
                payload.stderr,
            )
            .await?;
        Ok((StatusCode::NO_CONTENT, serde_json::Value::Null))
    })
    .await
}

/// `GET /jobs/{job_id}`
pub async fn get_job(
    State(app): State<Arc<AppRoot>>,
    headers: HeaderMap,
    Path(job_id): Path<JobId>,
) -> Result<Response, ApiError> {
    let tenant = tenant_from(&headers)?;
    let job = app
        .store
        .get_job(tenant, job_id)
        .await?
        .ok_or_else(|| FluxError::not_found("Job", job_id))?;
    Ok((StatusCode::OK, Json(job)).into_response())
}

/// Accept either an RFC 3339 string or Unix seconds.
fn flexible_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(i64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Seconds(secs)) => Ok(DateTime::from_timestamp(secs, 0)),
        Some(Raw::Text(text)) => text
            .parse::<DateTime<Utc>>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
