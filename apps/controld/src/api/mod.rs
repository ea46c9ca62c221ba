//! HTTP surface.
//!
//! Thin ingress over the core components: tenancy comes from the
//! `X-Flux-Tenant` header (standing in for the JWT middleware that owns
//! auth in front of this daemon), idempotency from
//! `X-Flux-Idempotency-Key`, and every handler maps domain errors
//! through [`error::ApiError`].

pub mod admin;
pub mod agents;
pub mod error;
pub mod jobs;
pub mod ratelimit;
pub mod states;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use flux_core::{FluxError, TenantId};
use flux_store::StoredResponse;
use tower_http::trace::TraceLayer;

use crate::app::AppRoot;
use error::ApiError;

/// Header carrying the tenant identity.
pub const TENANT_HEADER: &str = "x-flux-tenant";
/// Header carrying the client idempotency key.
pub const IDEMPOTENCY_HEADER: &str = "x-flux-idempotency-key";

/// Execution budget for handlers that only enqueue or flip in-process
/// state. The idempotency lock TTL is twice this.
pub const ENQUEUE_MAX_EXECUTION: Duration = Duration::from_secs(5);
/// Execution budget for handlers that write through the store.
pub const STORE_WRITE_MAX_EXECUTION: Duration = Duration::from_secs(15);

/// Build the router over a started [`AppRoot`].
pub fn router(app: Arc<AppRoot>) -> Router {
    Router::new()
        .route("/agents/register", post(agents::register))
        .route("/agents/heartbeat", post(agents::heartbeat))
        .route("/agents", get(agents::list))
        .route("/jobs/{job_id}/result", post(jobs::report_result))
        .route("/jobs/{job_id}", get(jobs::get_job))
        .route("/states", post(states::create).get(states::list))
        .route("/states/{state_id}", get(states::get_state))
        .route("/states/{state_id}/reconcile", post(states::reconcile))
        .route("/admin/admission-mode", post(admin::set_admission_mode))
        .route("/metrics", get(admin::metrics))
        .route("/healthz", get(admin::healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}

/// Extract the tenant from request headers.
pub fn tenant_from(headers: &HeaderMap) -> Result<TenantId, ApiError> {
    let raw = headers
        .get(TENANT_HEADER)
        .ok_or_else(|| FluxError::Unauthorized("missing tenant header".into()))?;
    let text = raw
        .to_str()
        .map_err(|_| FluxError::Unauthorized("unreadable tenant header".into()))?;
    TenantId::parse(text)
        .map_err(|_| FluxError::Unauthorized(format!("bad tenant id {text:?}")).into())
}

/// Run a mutating handler through the idempotency gate when the request
/// carries a key; otherwise run it directly. Applies to every POST
/// surface.
///
/// `max_execution` is the handler's worst-case runtime and sizes the
/// gate's lock TTL; each endpoint passes its own budget so a slow
/// handler cannot hide behind a one-size lock.
///
/// Cached responses replay byte-identical, status and content type
/// included. Handler *errors* are never cached: a retry with the same
/// key gets a fresh execution. A `Value::Null` body means "no body"
/// (204-style responses).
pub async fn with_idempotency<F, Fut>(
    app: &Arc<AppRoot>,
    headers: &HeaderMap,
    max_execution: Duration,
    run: F,
) -> Result<Response, ApiError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(StatusCode, serde_json::Value), ApiError>>,
{
    let Some(raw_key) = headers.get(IDEMPOTENCY_HEADER) else {
        let (status, body) = run().await?;
        if body.is_null() {
            return Ok(status.into_response());
        }
        return Ok((status, axum::Json(body)).into_response());
    };
    let key = raw_key
        .to_str()
        .map_err(|_| FluxError::InvalidInput("unreadable idempotency key".into()))?;

    let owner = uuid::Uuid::new_v4().to_string();
    let epoch = app.leader.borrow().epoch;
    let outcome = app
        .gate
        .execute(key, &owner, epoch, max_execution, || async {
            let (status, body) = run().await.map_err(|err| err.0)?;
            let (headers, text) = if body.is_null() {
                (Vec::new(), String::new())
            } else {
                (
                    vec![("content-type".to_owned(), "application/json".to_owned())],
                    body.to_string(),
                )
            };
            Ok(StoredResponse {
                status: status.as_u16(),
                headers,
                body: text,
            })
        })
        .await?;

    Ok(replay(outcome.into_response()))
}

/// Materialize a stored response verbatim.
fn replay(stored: StoredResponse) -> Response {
    let mut builder = Response::builder().status(stored.status);
    for (name, value) in &stored.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(stored.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn tenant_extraction_requires_header() {
        let headers = HeaderMap::new();
        assert!(tenant_from(&headers).is_err());
    }

    #[test]
    fn tenant_extraction_parses_uuid() {
        let mut headers = HeaderMap::new();
        headers.insert(
            TENANT_HEADER,
            HeaderValue::from_static("550e8400-e29b-41d4-a716-446655440000"),
        );
        let tenant = tenant_from(&headers).unwrap();
        assert_eq!(tenant.to_string(), "550e8400-e29b-41d4-a716-446655440000");
    }

    #[test]
    fn tenant_extraction_rejects_garbage() {
        let mut headers = HeaderMap::new();
        headers.insert(TENANT_HEADER, HeaderValue::from_static("not-a-uuid"));
        assert!(tenant_from(&headers).is_err());
    }

    #[test]
    fn replay_preserves_status_and_body() {
        let stored = StoredResponse {
            status: 201,
            headers: vec![("content-type".into(), "application/json".into())],
            body: "{\"ok\":true}".into(),
        };
        let response = replay(stored);
        assert_eq!(response.status(), StatusCode::CREATED);
    }
}
