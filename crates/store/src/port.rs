//! The store port.
//!
//! Backend drivers implement [`Store`] to provide durable, tenant-scoped
//! persistence with optimistic concurrency. Record operations are scoped
//! to a tenant; epochs, leases, locks, and idempotency entries are
//! cluster-global by design.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flux_core::{FluxResult, JobId, NodeName, StateId, TenantId};
use flux_state::{Agent, DesiredState, Job, JobStatus, StateStatus};
use serde::{Deserialize, Serialize};

/// A cached HTTP response kept for idempotent replay.
///
/// Stored byte-for-byte so every duplicate submitter observes an
/// identical response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers worth replaying (content type et al).
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Raw response body.
    pub body: String,
}

/// Current phase of an idempotency entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyState {
    /// A holder is executing; others wait.
    Locked {
        /// Identity of the executing holder.
        owner: String,
        /// When the lock lapses if the holder crashes.
        expires_at: DateTime<Utc>,
    },
    /// Execution finished; the response is cached.
    Result(StoredResponse),
}

/// A fencing lock entry, surfaced for janitor scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    /// Lock key.
    pub key: String,
    /// Holder identity.
    pub owner: String,
    /// Leadership epoch the holder was minted under.
    pub owner_epoch: i64,
    /// When the lock lapses on its own.
    pub expires_at: DateTime<Utc>,
}

/// Persistence and coordination interface for the control plane.
///
/// # Atomicity
///
/// [`update_state_status`](Store::update_state_status) and every lease,
/// lock, and idempotency primitive must execute as one logical
/// transaction with no read-then-write window. Acceptable shapes: a
/// transactional `UPDATE ... WHERE version = ? RETURNING`, or a
/// server-side atomic script in a key-value backend.
///
/// # Failure semantics
///
/// Lookups of missing records return `Ok(None)`, never an error.
/// Transport failures propagate as `FluxError::Transport`. Version
/// mismatches fail with `FluxError::Conflict` carrying both versions so
/// the caller can refetch.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Agents ──────────────────────────────────────────────────────────

    /// Insert or replace an agent record.
    async fn upsert_agent(&self, agent: Agent) -> FluxResult<()>;

    /// Fetch one agent.
    async fn get_agent(&self, tenant: TenantId, node: &NodeName) -> FluxResult<Option<Agent>>;

    /// List a tenant's agents.
    async fn list_agents(&self, tenant: TenantId) -> FluxResult<Vec<Agent>>;

    /// List every agent across tenants. Used by the liveness monitor.
    async fn list_all_agents(&self) -> FluxResult<Vec<Agent>>;

    /// Stamp an agent's heartbeat, reviving it from `offline` if needed.
    async fn update_agent_heartbeat(
        &self,
        tenant: TenantId,
        node: &NodeName,
        at: DateTime<Utc>,
    ) -> FluxResult<()>;

    // ── Desired states ──────────────────────────────────────────────────

    /// Insert or replace a desired state, bumping its version by one.
    /// Returns the stored record.
    async fn upsert_state(&self, state: DesiredState) -> FluxResult<DesiredState>;

    /// Fetch one state.
    async fn get_state(
        &self,
        tenant: TenantId,
        state_id: StateId,
    ) -> FluxResult<Option<DesiredState>>;

    /// Fetch the state targeting a node, if any.
    async fn get_state_by_node(
        &self,
        tenant: TenantId,
        node: &NodeName,
    ) -> FluxResult<Option<DesiredState>>;

    /// List a tenant's states.
    async fn list_states(&self, tenant: TenantId) -> FluxResult<Vec<DesiredState>>;

    /// List states in `status` across tenants, filtered to the shard that
    /// owns each state's node (`fnv1a32(node) % shard_count ==
    /// shard_index`). Used for leader rehydration and partitioned scans.
    async fn list_states_by_status(
        &self,
        status: StateStatus,
        shard_index: u32,
        shard_count: u32,
    ) -> FluxResult<Vec<DesiredState>>;

    /// Count states in `status` across tenants.
    async fn count_states_by_status(&self, status: StateStatus) -> FluxResult<usize>;

    /// Compare-and-swap status transition.
    ///
    /// Succeeds only if the stored version equals `expected_version`; the
    /// stored version then becomes `expected_version + 1`, which is
    /// returned. A mismatch fails with `Conflict` and changes nothing.
    async fn update_state_status(
        &self,
        tenant: TenantId,
        state_id: StateId,
        new_status: StateStatus,
        last_error: Option<String>,
        last_checked: Option<DateTime<Utc>>,
        expected_version: u64,
    ) -> FluxResult<u64>;

    // ── Jobs ────────────────────────────────────────────────────────────

    /// Persist a new job record.
    async fn create_job(&self, job: Job) -> FluxResult<()>;

    /// Apply a job status transition with result fields. Terminal jobs
    /// are immutable; writes against them fail.
    async fn update_job_status(
        &self,
        tenant: TenantId,
        job_id: JobId,
        status: JobStatus,
        exit_code: Option<i32>,
        stdout: Option<String>,
        stderr: Option<String>,
    ) -> FluxResult<()>;

    /// Fetch one job.
    async fn get_job(&self, tenant: TenantId, job_id: JobId) -> FluxResult<Option<Job>>;

    /// List a tenant's jobs.
    async fn list_jobs(&self, tenant: TenantId) -> FluxResult<Vec<Job>>;

    // ── Epochs ──────────────────────────────────────────────────────────

    /// Atomically bump and return the durable epoch for `resource`.
    /// Monotonic across restarts.
    async fn increment_durable_epoch(&self, resource: &str) -> FluxResult<i64>;

    /// Read the durable epoch for `resource` without bumping it.
    async fn current_durable_epoch(&self, resource: &str) -> FluxResult<i64>;

    // ── Leases ──────────────────────────────────────────────────────────

    /// Acquire `key` iff it is empty (or expired). `value` carries the
    /// owner identity. Returns `true` on acquisition.
    async fn acquire_lease(&self, key: &str, value: &str, ttl: Duration) -> FluxResult<bool>;

    /// Extend the lease iff the stored value equals `value`.
    async fn renew_lease(&self, key: &str, value: &str, ttl: Duration) -> FluxResult<bool>;

    /// Delete the lease iff the stored value equals `value`.
    async fn release_lease(&self, key: &str, value: &str) -> FluxResult<bool>;

    // ── Idempotency and fencing locks ───────────────────────────────────

    /// Read the current idempotency entry for `key`, if any. Expired
    /// locks read as absent.
    async fn get_idempotency_state(&self, key: &str) -> FluxResult<Option<IdempotencyState>>;

    /// Cache a response for `key` with `ttl`, atomically clearing any
    /// lock held on it.
    async fn store_idempotency_result(
        &self,
        key: &str,
        response: StoredResponse,
        ttl: Duration,
    ) -> FluxResult<()>;

    /// Acquire the execution lock for `key`. At most one concurrent
    /// caller per key succeeds. Returns `true` on acquisition.
    async fn acquire_lock(
        &self,
        key: &str,
        owner: &str,
        owner_epoch: i64,
        ttl: Duration,
    ) -> FluxResult<bool>;

    /// Extend the lock iff held by `owner`.
    async fn renew_lock(&self, key: &str, owner: &str, ttl: Duration) -> FluxResult<bool>;

    /// Delete the lock iff held by `owner`.
    async fn release_lock(&self, key: &str, owner: &str) -> FluxResult<bool>;

    /// Snapshot all live locks. Used by the lock janitor.
    async fn list_locks(&self) -> FluxResult<Vec<LockInfo>>;

    /// Unconditionally delete a lock. Janitor-only.
    async fn delete_lock(&self, key: &str) -> FluxResult<bool>;
}
