//! The check → apply → verify engine.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use flux_core::{FluxError, FluxResult, NodeName, StateId, TenantId};
use flux_scheduler::{ReconciliationTask, TaskDisposition, TaskRunner};
use flux_state::{Agent, DesiredState, Job, JobStatus, StateStatus};
use flux_store::Store;
use flux_telemetry::{ControlEvent, EventSink, MetricsRegistry, names};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::JobDispatcher;

/// Reconciler tuning knobs.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Hard wall-clock budget for one reconciliation pass.
    pub max_task_runtime: Duration,
    /// How long to wait for one job to reach a terminal status.
    pub job_poll_timeout: Duration,
    /// Poll interval while waiting on a job. Cancellation is observed
    /// within one tick.
    pub poll_tick: Duration,
    /// Budget for best-effort event publication.
    pub event_publish_timeout: Duration,
    /// Durable epoch resource used for fencing checks.
    pub epoch_resource: String,
    /// Shadow mode: report drift and log the would-apply, but never run
    /// the apply command.
    pub shadow_mode: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_task_runtime: Duration::from_secs(300),
            job_poll_timeout: Duration::from_secs(30),
            poll_tick: Duration::from_millis(500),
            event_publish_timeout: Duration::from_secs(2),
            epoch_resource: "leader".to_owned(),
            shadow_mode: false,
        }
    }
}

/// Terminal outcome of one dispatched job.
struct JobOutcome {
    status: JobStatus,
    exit_code: Option<i32>,
    stderr: String,
}

/// Releases the per-node single-flight slot on drop.
struct FlightGuard<'a> {
    active: &'a Mutex<HashSet<NodeName>>,
    node: NodeName,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.active.lock().remove(&self.node);
    }
}

/// Drives one `DesiredState` toward compliance.
///
/// Owns the in-process single-flight set: at most one pass per node at a
/// time on this replica. Every status write is an epoch-fenced versioned
/// compare-and-swap; a lost race ends the pass quietly and the next
/// scheduler pass re-reads.
pub struct Reconciler {
    store: Arc<dyn Store>,
    dispatcher: JobDispatcher,
    events: Arc<dyn EventSink>,
    metrics: MetricsRegistry,
    config: ReconcilerConfig,
    active: Mutex<HashSet<NodeName>>,
}

impl Reconciler {
    /// Create a reconciler.
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: JobDispatcher,
        events: Arc<dyn EventSink>,
        metrics: MetricsRegistry,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            events,
            metrics,
            config,
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Run one reconciliation pass for `state_id`.
    ///
    /// `admission_epoch` is the leadership epoch the work was admitted
    /// under; a newer durable epoch aborts the pass before any write.
    pub async fn reconcile(
        &self,
        term: &CancellationToken,
        tenant: TenantId,
        state_id: StateId,
        admission_epoch: i64,
        trace_id: &str,
    ) -> FluxResult<TaskDisposition> {
        let deadline = Instant::now() + self.config.max_task_runtime;

        let Some(mut state) = self.store.get_state(tenant, state_id).await? else {
            return Err(FluxError::not_found("DesiredState", state_id));
        };

        let Some(_guard) = self.try_acquire(&state.node) else {
            // Not an error: the run already in flight covers this drift.
            tracing::debug!(node = %state.node, %state_id, "single-flight held, skipping");
            return Ok(TaskDisposition::Skipped);
        };

        let agent = match self.store.get_agent(tenant, &state.node).await? {
            None => {
                return self
                    .fail(term, admission_epoch, &mut state, "agent not found")
                    .await;
            }
            Some(agent) if !agent.status.is_dispatchable() => {
                return self
                    .fail(
                        term,
                        admission_epoch,
                        &mut state,
                        &format!("agent {}", agent.status),
                    )
                    .await;
            }
            Some(agent) => agent,
        };

        // ── Check ───────────────────────────────────────────────────────
        let check = self
            .run_command(
                term,
                deadline,
                &state,
                &agent,
                &state.check_cmd,
                "check",
                trace_id,
            )
            .await?;

        if check.exit_code == Some(state.desired_exit_code) {
            if !self
                .transition(term, admission_epoch, &mut state, StateStatus::Compliant, None, true)
                .await?
            {
                return Ok(TaskDisposition::Skipped);
            }
            self.emit_terminal(&state, "check matched").await;
            return Ok(TaskDisposition::Reconciled);
        }

        if !self
            .transition(term, admission_epoch, &mut state, StateStatus::Drifted, None, true)
            .await?
        {
            return Ok(TaskDisposition::Skipped);
        }

        if self.config.shadow_mode {
            tracing::info!(
                %state_id,
                node = %state.node,
                apply_cmd = %state.apply_cmd,
                "shadow mode: drift detected, apply suppressed"
            );
            if !self
                .transition(term, admission_epoch, &mut state, StateStatus::Compliant, None, false)
                .await?
            {
                return Ok(TaskDisposition::Skipped);
            }
            self.emit_terminal(&state, "shadow mode").await;
            return Ok(TaskDisposition::Reconciled);
        }

        // ── Apply ───────────────────────────────────────────────────────
        if !self
            .transition(term, admission_epoch, &mut state, StateStatus::Applying, None, false)
            .await?
        {
            return Ok(TaskDisposition::Skipped);
        }

        let apply = self
            .run_command(
                term,
                deadline,
                &state,
                &agent,
                &state.apply_cmd,
                "apply",
                trace_id,
            )
            .await?;
        if apply.status != JobStatus::Completed {
            let reason = if apply.stderr.is_empty() {
                format!("apply failed with exit {:?}", apply.exit_code)
            } else {
                format!("apply failed: {}", apply.stderr)
            };
            return self.fail(term, admission_epoch, &mut state, &reason).await;
        }

        // ── Verify ──────────────────────────────────────────────────────
        let verify = self
            .run_command(
                term,
                deadline,
                &state,
                &agent,
                &state.check_cmd,
                "verify",
                trace_id,
            )
            .await?;

        if verify.exit_code == Some(state.desired_exit_code) {
            if !self
                .transition(term, admission_epoch, &mut state, StateStatus::Compliant, None, true)
                .await?
            {
                return Ok(TaskDisposition::Skipped);
            }
            self.emit_terminal(&state, "applied and verified").await;
            Ok(TaskDisposition::Reconciled)
        } else {
            self.fail(term, admission_epoch, &mut state, "drift persisted")
                .await
        }
    }

    fn try_acquire(&self, node: &NodeName) -> Option<FlightGuard<'_>> {
        let mut active = self.active.lock();
        if active.insert(node.clone()) {
            Some(FlightGuard {
                active: &self.active,
                node: node.clone(),
            })
        } else {
            None
        }
    }

    /// Transition to `failed` with a reason and emit the terminal event.
    async fn fail(
        &self,
        term: &CancellationToken,
        admission_epoch: i64,
        state: &mut DesiredState,
        reason: &str,
    ) -> FluxResult<TaskDisposition> {
        if !self
            .transition(
                term,
                admission_epoch,
                state,
                StateStatus::Failed,
                Some(reason.to_owned()),
                false,
            )
            .await?
        {
            return Ok(TaskDisposition::Skipped);
        }
        self.emit_terminal(state, reason).await;
        Ok(TaskDisposition::Failed)
    }

    /// One epoch-fenced versioned write. `Ok(true)` means applied;
    /// `Ok(false)` means a concurrent writer won and the pass should end
    /// quietly.
    async fn transition(
        &self,
        term: &CancellationToken,
        admission_epoch: i64,
        state: &mut DesiredState,
        new_status: StateStatus,
        last_error: Option<String>,
        stamp_checked: bool,
    ) -> FluxResult<bool> {
        if term.is_cancelled() {
            return Err(FluxError::cancelled("leadership lost"));
        }
        self.ensure_epoch(admission_epoch).await?;

        let last_checked = stamp_checked.then(Utc::now);
        match self
            .store
            .update_state_status(
                state.tenant,
                state.state_id,
                new_status,
                last_error.clone(),
                last_checked,
                state.version,
            )
            .await
        {
            Ok(new_version) => {
                tracing::debug!(
                    state_id = %state.state_id,
                    from = %state.status,
                    to = %new_status,
                    version = new_version,
                    "state transition"
                );
                state.version = new_version;
                state.status = new_status;
                state.last_error = last_error;
                Ok(true)
            }
            Err(err) if err.is_conflict() => {
                tracing::warn!(
                    state_id = %state.state_id,
                    to = %new_status,
                    error = %err,
                    "versioned write lost, another writer advanced the state"
                );
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Fencing: a pass admitted under an older epoch must not write.
    async fn ensure_epoch(&self, admission_epoch: i64) -> FluxResult<()> {
        let current = self
            .store
            .current_durable_epoch(&self.config.epoch_resource)
            .await?;
        if current != admission_epoch {
            self.metrics
                .counter(names::RECONCILIATION_EPOCH_ABORT_TOTAL)
                .inc();
            tracing::warn!(admission_epoch, current, "epoch moved mid-reconciliation, aborting");
            return Err(FluxError::cancelled("epoch superseded"));
        }
        Ok(())
    }

    /// Create, dispatch, and await one job.
    async fn run_command(
        &self,
        term: &CancellationToken,
        deadline: Instant,
        state: &DesiredState,
        agent: &Agent,
        command: &str,
        phase: &str,
        trace_id: &str,
    ) -> FluxResult<JobOutcome> {
        let job = Job::new(
            state.tenant,
            state.node.clone(),
            Some(state.state_id),
            command,
            trace_id,
        );
        self.store.create_job(job.clone()).await?;
        self.dispatcher.dispatch(term, agent, &job).await?;

        let poll_deadline = (Instant::now() + self.config.job_poll_timeout).min(deadline);
        loop {
            tokio::select! {
                () = term.cancelled() => {
                    return Err(FluxError::cancelled("leadership lost"));
                }
                () = tokio::time::sleep(self.config.poll_tick) => {}
            }

            if let Some(current) = self.store.get_job(state.tenant, job.job_id).await? {
                if current.status.is_terminal() {
                    return Ok(JobOutcome {
                        status: current.status,
                        exit_code: current.exit_code,
                        stderr: current.stderr,
                    });
                }
            }

            if Instant::now() >= poll_deadline {
                let reason = if Instant::now() >= deadline {
                    "task_deadline"
                } else {
                    "job_poll"
                };
                self.metrics
                    .counter_vec(
                        names::TASK_TIMEOUTS_TOTAL,
                        &["state_id", "phase", "timeout_reason"],
                    )
                    .with(&[&state.state_id.to_string(), phase, reason])
                    .inc();
                return Err(FluxError::timeout(
                    format!("{phase} job {}", job.job_id),
                    self.config.job_poll_timeout,
                ));
            }
        }
    }

    /// Best-effort terminal event. Failures are counted and dropped;
    /// events are observability, not control flow.
    async fn emit_terminal(&self, state: &DesiredState, reason: &str) {
        let event = ControlEvent::StateTransition {
            state_id: state.state_id,
            node: state.node.clone(),
            new_status: state.status.to_string(),
            reason: reason.to_owned(),
            ts: Utc::now(),
        };
        let event_type = event.type_label();
        let outcome =
            tokio::time::timeout(self.config.event_publish_timeout, self.events.publish(event))
                .await;
        let failure_reason = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(_)) => "error",
            Err(_) => "timeout",
        };
        self.metrics
            .counter_vec(
                names::EVENT_PUBLISH_FAILURES_TOTAL,
                &["event_type", "reason"],
            )
            .with(&[event_type, failure_reason])
            .inc();
    }
}

#[async_trait]
impl TaskRunner for Reconciler {
    async fn run(
        &self,
        term: CancellationToken,
        task: ReconciliationTask,
    ) -> FluxResult<TaskDisposition> {
        self.reconcile(
            &term,
            task.tenant,
            task.state_id,
            task.admission_epoch,
            &task.req_id.to_string(),
        )
        .await
    }
}
