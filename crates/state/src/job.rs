//! Job records and their status machine.

use chrono::{DateTime, Utc};
use flux_core::{FluxError, JobId, NodeName, StateId, TenantId};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a dispatched job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet accepted by the agent.
    Queued,
    /// Accepted by the agent (202), executing.
    Running,
    /// Agent reported success.
    Completed,
    /// Agent reported failure, or dispatch failed.
    Failed,
}

impl JobStatus {
    /// Returns `true` once the job can never change again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Returns `true` if the transition from `from` to `to` is valid.
///
/// `queued → failed` covers dispatch failures that never reach the agent.
#[must_use]
pub fn can_transition_job(from: JobStatus, to: JobStatus) -> bool {
    matches!(
        (from, to),
        (JobStatus::Queued, JobStatus::Running)
            | (JobStatus::Queued, JobStatus::Failed)
            | (JobStatus::Running, JobStatus::Completed)
            | (JobStatus::Running, JobStatus::Failed)
    )
}

/// Validate a job status transition. Jobs are immutable after terminal,
/// so a write against a terminal job fails with `Conflict`.
pub fn validate_job_transition(job_id: JobId, from: JobStatus, to: JobStatus) -> Result<(), FluxError> {
    if can_transition_job(from, to) {
        Ok(())
    } else {
        Err(FluxError::InvalidInput(format!(
            "job {job_id}: invalid transition {from} -> {to}"
        )))
    }
}

/// One command execution on one agent.
///
/// Created by the reconciler (or direct submission), flipped to `running`
/// by the dispatcher on agent accept, finished by the agent's result
/// callback. Immutable after reaching a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Globally unique identifier.
    pub job_id: JobId,
    /// Owning tenant.
    pub tenant: TenantId,
    /// Target agent.
    pub node: NodeName,
    /// Desired state this job reconciles, if any.
    #[serde(default)]
    pub state_id: Option<StateId>,
    /// Shell command the agent runs.
    pub command: String,
    /// Current status.
    pub status: JobStatus,
    /// Exit code, present once terminal.
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Captured stdout.
    #[serde(default)]
    pub stdout: String,
    /// Captured stderr.
    #[serde(default)]
    pub stderr: String,
    /// Correlation id threaded through logs and events.
    pub trace_id: String,
    /// When the job record was created.
    pub created_at: DateTime<Utc>,
    /// When the agent accepted the job.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the agent reported a terminal result.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a queued job.
    #[must_use]
    pub fn new(
        tenant: TenantId,
        node: NodeName,
        state_id: Option<StateId>,
        command: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            job_id: JobId::v4(),
            tenant,
            node,
            state_id,
            command: command.into(),
            status: JobStatus::Queued,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            trace_id: trace_id.into(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Apply a status transition, stamping started/finished times.
    pub fn transition_to(&mut self, status: JobStatus) -> Result<(), FluxError> {
        validate_job_transition(self.job_id, self.status, status)?;
        self.status = status;
        if status == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if status.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }
}
