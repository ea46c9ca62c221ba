//! Job delivery to agents.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flux_core::{FluxError, FluxResult};
use flux_state::{Agent, Job, JobStatus};
use flux_store::Store;
use tokio_util::sync::CancellationToken;

/// Wire transport to an agent's execute endpoint.
///
/// A port so tests (and embedded agents) can stand in for HTTP.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Deliver `{job_id, command}` to the agent. `Ok(())` means the
    /// agent acknowledged with `202 Accepted`; anything else is a
    /// dispatch failure.
    async fn send(&self, agent: &Agent, job: &Job) -> FluxResult<()>;
}

/// HTTP transport over reqwest.
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    /// Dispatch timeout applied to the whole request.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Create a transport with the default timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeout(Self::DEFAULT_TIMEOUT)
    }

    /// Create a transport with a custom timeout.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentTransport for HttpTransport {
    async fn send(&self, agent: &Agent, job: &Job) -> FluxResult<()> {
        let payload = serde_json::json!({
            "job_id": job.job_id,
            "command": job.command,
        });
        let response = self
            .client
            .post(agent.execute_url())
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|err| FluxError::Transport(format!("dispatch to {}: {err}", agent.node)))?;

        if response.status() == reqwest::StatusCode::ACCEPTED {
            Ok(())
        } else {
            Err(FluxError::Transport(format!(
                "agent {} answered {} instead of 202",
                agent.node,
                response.status()
            )))
        }
    }
}

/// Delivers jobs and records accept/reject in the store.
///
/// Terminal job transitions arrive later through the agent's result
/// callback; the dispatcher only ever moves a job to `running` (accept)
/// or `failed` (dispatch failure or cancellation).
pub struct JobDispatcher {
    store: Arc<dyn Store>,
    transport: Arc<dyn AgentTransport>,
}

impl JobDispatcher {
    /// Create a dispatcher.
    pub fn new(store: Arc<dyn Store>, transport: Arc<dyn AgentTransport>) -> Self {
        Self { store, transport }
    }

    /// Deliver `job` to `agent`.
    ///
    /// Under a cancelled `term` the job is written off as failed with
    /// the leadership-loss reason and nothing is sent.
    pub async fn dispatch(
        &self,
        term: &CancellationToken,
        agent: &Agent,
        job: &Job,
    ) -> FluxResult<()> {
        if term.is_cancelled() {
            self.store
                .update_job_status(
                    job.tenant,
                    job.job_id,
                    JobStatus::Failed,
                    None,
                    None,
                    Some("dispatch cancelled: leadership lost".into()),
                )
                .await?;
            return Err(FluxError::cancelled("leadership lost"));
        }

        match self.transport.send(agent, job).await {
            Ok(()) => {
                tracing::debug!(job_id = %job.job_id, node = %agent.node, "job accepted");
                self.store
                    .update_job_status(job.tenant, job.job_id, JobStatus::Running, None, None, None)
                    .await
            }
            Err(err) => {
                tracing::warn!(
                    job_id = %job.job_id,
                    node = %agent.node,
                    error = %err,
                    "dispatch failed"
                );
                self.store
                    .update_job_status(
                        job.tenant,
                        job.job_id,
                        JobStatus::Failed,
                        None,
                        None,
                        Some(err.to_string()),
                    )
                    .await?;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_core::{NodeName, TenantId};
    use flux_store::MemoryStore;

    struct AcceptingTransport;

    #[async_trait]
    impl AgentTransport for AcceptingTransport {
        async fn send(&self, _agent: &Agent, _job: &Job) -> FluxResult<()> {
            Ok(())
        }
    }

    struct RefusingTransport;

    #[async_trait]
    impl AgentTransport for RefusingTransport {
        async fn send(&self, agent: &Agent, _job: &Job) -> FluxResult<()> {
            Err(FluxError::Transport(format!(
                "agent {} answered 503 instead of 202",
                agent.node
            )))
        }
    }

    async fn fixtures(store: &Arc<MemoryStore>) -> (Agent, Job) {
        let tenant = TenantId::v4();
        let node = NodeName::new("web-03").unwrap();
        let agent = Agent::new(tenant, node.clone(), "web-03.internal", "10.0.0.7", 7420, "1.4");
        let job = Job::new(tenant, node, None, "uptime", "trace-1");
        store.create_job(job.clone()).await.unwrap();
        (agent, job)
    }

    #[tokio::test]
    async fn accepted_dispatch_marks_job_running() {
        let store = Arc::new(MemoryStore::new());
        let (agent, job) = fixtures(&store).await;
        let dispatcher =
            JobDispatcher::new(store.clone() as Arc<dyn Store>, Arc::new(AcceptingTransport));

        dispatcher
            .dispatch(&CancellationToken::new(), &agent, &job)
            .await
            .unwrap();

        let stored = store.get_job(job.tenant, job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert!(stored.started_at.is_some());
    }

    #[tokio::test]
    async fn refused_dispatch_marks_job_failed() {
        let store = Arc::new(MemoryStore::new());
        let (agent, job) = fixtures(&store).await;
        let dispatcher =
            JobDispatcher::new(store.clone() as Arc<dyn Store>, Arc::new(RefusingTransport));

        let err = dispatcher
            .dispatch(&CancellationToken::new(), &agent, &job)
            .await
            .unwrap_err();
        assert!(matches!(err, FluxError::Transport(_)));

        let stored = store.get_job(job.tenant, job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.stderr.contains("503"));
    }

    #[tokio::test]
    async fn cancelled_term_fails_job_without_sending() {
        let store = Arc::new(MemoryStore::new());
        let (agent, job) = fixtures(&store).await;
        let dispatcher =
            JobDispatcher::new(store.clone() as Arc<dyn Store>, Arc::new(AcceptingTransport));

        let term = CancellationToken::new();
        term.cancel();
        let err = dispatcher.dispatch(&term, &agent, &job).await.unwrap_err();
        assert!(matches!(err, FluxError::Cancelled { .. }));

        let stored = store.get_job(job.tenant, job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.stderr, "dispatch cancelled: leadership lost");
    }
}
