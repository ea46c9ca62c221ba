//! In-memory store driver.
//!
//! Backs every [`Store`] primitive with [`DashMap`]s. Mutations run under
//! the map's per-key entry guard, which makes each primitive a single
//! critical section -- the same atomicity a networked driver must provide
//! with server-side scripts. TTLs are evaluated lazily on access: an
//! expired lease, lock, or cached result behaves exactly as absent.
//!
//! Suitable for single-process deployments and tests. Durability across
//! restarts is the one contract point it cannot honor.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use flux_core::{FluxError, FluxResult, JobId, NodeName, StateId, TenantId};
use flux_state::{Agent, AgentStatus, DesiredState, Job, JobStatus, StateStatus, owns_shard};
use flux_telemetry::{MetricsRegistry, names};

use crate::port::{IdempotencyState, LockInfo, Store, StoredResponse};

#[derive(Debug, Clone)]
struct LeaseEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct LockEntry {
    owner: String,
    owner_epoch: i64,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct ResultEntry {
    response: StoredResponse,
    expires_at: DateTime<Utc>,
}

/// DashMap-backed [`Store`] implementation.
pub struct MemoryStore {
    agents: DashMap<(TenantId, NodeName), Agent>,
    states: DashMap<(TenantId, StateId), DesiredState>,
    jobs: DashMap<(TenantId, JobId), Job>,
    epochs: DashMap<String, i64>,
    leases: DashMap<String, LeaseEntry>,
    locks: DashMap<String, LockEntry>,
    results: DashMap<String, ResultEntry>,
    metrics: MetricsRegistry,
}

impl MemoryStore {
    /// Create an empty store with its own private metrics registry.
    #[must_use]
    pub fn new() -> Self {
        Self::with_metrics(MetricsRegistry::new())
    }

    /// Create an empty store recording versioned-write counters into the
    /// given registry.
    #[must_use]
    pub fn with_metrics(metrics: MetricsRegistry) -> Self {
        Self {
            agents: DashMap::new(),
            states: DashMap::new(),
            jobs: DashMap::new(),
            epochs: DashMap::new(),
            leases: DashMap::new(),
            locks: DashMap::new(),
            results: DashMap::new(),
            metrics,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    // ── Agents ──────────────────────────────────────────────────────────

    async fn upsert_agent(&self, mut agent: Agent) -> FluxResult<()> {
        let key = (agent.tenant, agent.node.clone());
        agent.updated_at = Self::now();
        match self.agents.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                agent.created_at = occupied.get().created_at;
                occupied.insert(agent);
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(agent);
            }
        }
        Ok(())
    }

    async fn get_agent(&self, tenant: TenantId, node: &NodeName) -> FluxResult<Option<Agent>> {
        Ok(self
            .agents
            .get(&(tenant, node.clone()))
            .map(|entry| entry.clone()))
    }

    async fn list_agents(&self, tenant: TenantId) -> FluxResult<Vec<Agent>> {
        Ok(self
            .agents
            .iter()
            .filter(|entry| entry.key().0 == tenant)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn list_all_agents(&self) -> FluxResult<Vec<Agent>> {
        Ok(self.agents.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn update_agent_heartbeat(
        &self,
        tenant: TenantId,
        node: &NodeName,
        at: DateTime<Utc>,
    ) -> FluxResult<()> {
        let mut entry = self
            .agents
            .get_mut(&(tenant, node.clone()))
            .ok_or_else(|| FluxError::not_found("Agent", node))?;
        entry.last_heartbeat = at;
        entry.updated_at = Self::now();
        if entry.status == AgentStatus::Offline {
            entry.status = AgentStatus::Active;
        }
        Ok(())
    }

    // ── Desired states ──────────────────────────────────────────────────

    async fn upsert_state(&self, mut state: DesiredState) -> FluxResult<DesiredState> {
        let key = (state.tenant, state.state_id);
        state.updated_at = Self::now();
        match self.states.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                state.created_at = occupied.get().created_at;
                state.version = occupied.get().version + 1;
                occupied.insert(state.clone());
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                state.version += 1;
                vacant.insert(state.clone());
            }
        }
        Ok(state)
    }

    async fn get_state(
        &self,
        tenant: TenantId,
        state_id: StateId,
    ) -> FluxResult<Option<DesiredState>> {
        Ok(self
            .states
            .get(&(tenant, state_id))
            .map(|entry| entry.clone()))
    }

    async fn get_state_by_node(
        &self,
        tenant: TenantId,
        node: &NodeName,
    ) -> FluxResult<Option<DesiredState>> {
        Ok(self
            .states
            .iter()
            .find(|entry| entry.key().0 == tenant && entry.value().node == *node)
            .map(|entry| entry.value().clone()))
    }

    async fn list_states(&self, tenant: TenantId) -> FluxResult<Vec<DesiredState>> {
        Ok(self
            .states
            .iter()
            .filter(|entry| entry.key().0 == tenant)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn list_states_by_status(
        &self,
        status: StateStatus,
        shard_index: u32,
        shard_count: u32,
    ) -> FluxResult<Vec<DesiredState>> {
        Ok(self
            .states
            .iter()
            .filter(|entry| {
                entry.value().status == status
                    && owns_shard(&entry.value().node, shard_index, shard_count)
            })
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn count_states_by_status(&self, status: StateStatus) -> FluxResult<usize> {
        Ok(self
            .states
            .iter()
            .filter(|entry| entry.value().status == status)
            .count())
    }

    async fn update_state_status(
        &self,
        tenant: TenantId,
        state_id: StateId,
        new_status: StateStatus,
        last_error: Option<String>,
        last_checked: Option<DateTime<Utc>>,
        expected_version: u64,
    ) -> FluxResult<u64> {
        // Entry guard held for the whole compare-and-swap: no window for
        // another writer to interleave.
        let mut entry = self
            .states
            .get_mut(&(tenant, state_id))
            .ok_or_else(|| FluxError::not_found("DesiredState", state_id))?;

        if entry.version != expected_version {
            self.metrics
                .counter(names::VERSIONED_WRITE_CONFLICT_TOTAL)
                .inc();
            return Err(FluxError::conflict(
                "DesiredState",
                state_id,
                expected_version,
                entry.version,
            ));
        }

        entry.status = new_status;
        entry.last_error = last_error;
        if last_checked.is_some() {
            entry.last_checked = last_checked;
        }
        entry.version = expected_version + 1;
        entry.updated_at = Self::now();

        self.metrics
            .counter(names::VERSIONED_WRITE_SUCCESS_TOTAL)
            .inc();
        Ok(entry.version)
    }

    // ── Jobs ────────────────────────────────────────────────────────────

    async fn create_job(&self, job: Job) -> FluxResult<()> {
        self.jobs.insert((job.tenant, job.job_id), job);
        Ok(())
    }

    async fn update_job_status(
        &self,
        tenant: TenantId,
        job_id: JobId,
        status: JobStatus,
        exit_code: Option<i32>,
        stdout: Option<String>,
        stderr: Option<String>,
    ) -> FluxResult<()> {
        let mut entry = self
            .jobs
            .get_mut(&(tenant, job_id))
            .ok_or_else(|| FluxError::not_found("Job", job_id))?;
        entry.transition_to(status)?;
        if exit_code.is_some() {
            entry.exit_code = exit_code;
        }
        if let Some(out) = stdout {
            entry.stdout = out;
        }
        if let Some(err) = stderr {
            entry.stderr = err;
        }
        Ok(())
    }

    async fn get_job(&self, tenant: TenantId, job_id: JobId) -> FluxResult<Option<Job>> {
        Ok(self.jobs.get(&(tenant, job_id)).map(|entry| entry.clone()))
    }

    async fn list_jobs(&self, tenant: TenantId) -> FluxResult<Vec<Job>> {
        Ok(self
            .jobs
            .iter()
            .filter(|entry| entry.key().0 == tenant)
            .map(|entry| entry.value().clone())
            .collect())
    }

    // ── Epochs ──────────────────────────────────────────────────────────

    async fn increment_durable_epoch(&self, resource: &str) -> FluxResult<i64> {
        let mut entry = self.epochs.entry(resource.to_owned()).or_insert(0);
        *entry += 1;
        Ok(*entry)
    }

    async fn current_durable_epoch(&self, resource: &str) -> FluxResult<i64> {
        Ok(self.epochs.get(resource).map_or(0, |entry| *entry))
    }

    // ── Leases ──────────────────────────────────────────────────────────

    async fn acquire_lease(&self, key: &str, value: &str, ttl: Duration) -> FluxResult<bool> {
        let now = Self::now();
        let mut entry = self.leases.entry(key.to_owned()).or_insert(LeaseEntry {
            value: String::new(),
            expires_at: now,
        });
        let vacant = entry.value.is_empty() || entry.expires_at <= now;
        if vacant {
            entry.value = value.to_owned();
            entry.expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
            return Ok(true);
        }
        Ok(false)
    }

    async fn renew_lease(&self, key: &str, value: &str, ttl: Duration) -> FluxResult<bool> {
        let now = Self::now();
        match self.leases.get_mut(key) {
            Some(mut entry) if entry.value == value && entry.expires_at > now => {
                entry.expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, key: &str, value: &str) -> FluxResult<bool> {
        Ok(self
            .leases
            .remove_if(key, |_, entry| entry.value == value)
            .is_some())
    }

    // ── Idempotency and fencing locks ───────────────────────────────────

    async fn get_idempotency_state(&self, key: &str) -> FluxResult<Option<IdempotencyState>> {
        let now = Self::now();
        // Results are checked before locks so a reader racing
        // store_idempotency_result never observes "neither".
        if let Some(entry) = self.results.get(key) {
            if entry.expires_at > now {
                return Ok(Some(IdempotencyState::Result(entry.response.clone())));
            }
        }
        if let Some(entry) = self.locks.get(key) {
            if entry.expires_at > now {
                return Ok(Some(IdempotencyState::Locked {
                    owner: entry.owner.clone(),
                    expires_at: entry.expires_at,
                }));
            }
        }
        Ok(None)
    }

    async fn store_idempotency_result(
        &self,
        key: &str,
        response: StoredResponse,
        ttl: Duration,
    ) -> FluxResult<()> {
        let expires_at = Self::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        // Result lands before the lock clears; see get_idempotency_state.
        self.results.insert(
            key.to_owned(),
            ResultEntry {
                response,
                expires_at,
            },
        );
        self.locks.remove(key);
        Ok(())
    }

    async fn acquire_lock(
        &self,
        key: &str,
        owner: &str,
        owner_epoch: i64,
        ttl: Duration,
    ) -> FluxResult<bool> {
        let now = Self::now();
        let mut entry = self.locks.entry(key.to_owned()).or_insert(LockEntry {
            owner: String::new(),
            owner_epoch: 0,
            expires_at: now,
        });
        let vacant = entry.owner.is_empty() || entry.expires_at <= now;
        if vacant {
            entry.owner = owner.to_owned();
            entry.owner_epoch = owner_epoch;
            entry.expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
            return Ok(true);
        }
        Ok(false)
    }

    async fn renew_lock(&self, key: &str, owner: &str, ttl: Duration) -> FluxResult<bool> {
        let now = Self::now();
        match self.locks.get_mut(key) {
            Some(mut entry) if entry.owner == owner && entry.expires_at > now => {
                entry.expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, key: &str, owner: &str) -> FluxResult<bool> {
        Ok(self
            .locks
            .remove_if(key, |_, entry| entry.owner == owner)
            .is_some())
    }

    async fn list_locks(&self) -> FluxResult<Vec<LockInfo>> {
        let now = Self::now();
        Ok(self
            .locks
            .iter()
            .filter(|entry| entry.expires_at > now && !entry.owner.is_empty())
            .map(|entry| LockInfo {
                key: entry.key().clone(),
                owner: entry.owner.clone(),
                owner_epoch: entry.owner_epoch,
                expires_at: entry.expires_at,
            })
            .collect())
    }

    async fn delete_lock(&self, key: &str) -> FluxResult<bool> {
        Ok(self.locks.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_agent(tenant: TenantId, name: &str) -> Agent {
        Agent::new(
            tenant,
            NodeName::new(name).unwrap(),
            format!("{name}.internal"),
            "10.0.0.7",
            7420,
            "1.4.2",
        )
    }

    fn make_state(tenant: TenantId, node: &str) -> DesiredState {
        DesiredState::new(
            tenant,
            NodeName::new(node).unwrap(),
            "test -f /tmp/x",
            "touch /tmp/x",
            0,
        )
    }

    // ── Agents ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn upsert_and_get_agent() {
        let store = MemoryStore::new();
        let tenant = TenantId::v4();
        let agent = make_agent(tenant, "web-03");
        store.upsert_agent(agent.clone()).await.unwrap();

        let fetched = store.get_agent(tenant, &agent.node).await.unwrap().unwrap();
        assert_eq!(fetched.hostname, "web-03.internal");
    }

    #[tokio::test]
    async fn get_missing_agent_returns_none() {
        let store = MemoryStore::new();
        let node = NodeName::new("ghost").unwrap();
        assert!(store.get_agent(TenantId::v4(), &node).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_agents_is_tenant_scoped() {
        let store = MemoryStore::new();
        let t1 = TenantId::v4();
        let t2 = TenantId::v4();
        store.upsert_agent(make_agent(t1, "a1")).await.unwrap();
        store.upsert_agent(make_agent(t1, "a2")).await.unwrap();
        store.upsert_agent(make_agent(t2, "b1")).await.unwrap();

        assert_eq!(store.list_agents(t1).await.unwrap().len(), 2);
        assert_eq!(store.list_agents(t2).await.unwrap().len(), 1);
        assert_eq!(store.list_all_agents().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn heartbeat_revives_offline_agent() {
        let store = MemoryStore::new();
        let tenant = TenantId::v4();
        let mut agent = make_agent(tenant, "web-03");
        agent.status = AgentStatus::Offline;
        let node = agent.node.clone();
        store.upsert_agent(agent).await.unwrap();

        store
            .update_agent_heartbeat(tenant, &node, Utc::now())
            .await
            .unwrap();
        let fetched = store.get_agent(tenant, &node).await.unwrap().unwrap();
        assert_eq!(fetched.status, AgentStatus::Active);
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_agent_fails() {
        let store = MemoryStore::new();
        let node = NodeName::new("ghost").unwrap();
        let err = store
            .update_agent_heartbeat(TenantId::v4(), &node, Utc::now())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    // ── Desired states ──────────────────────────────────────────────────

    #[tokio::test]
    async fn upsert_state_bumps_version() {
        let store = MemoryStore::new();
        let tenant = TenantId::v4();
        let state = make_state(tenant, "web-03");

        let stored = store.upsert_state(state.clone()).await.unwrap();
        assert_eq!(stored.version, 1);

        let again = store.upsert_state(stored.clone()).await.unwrap();
        assert_eq!(again.version, 2);

        let fetched = store
            .get_state(tenant, state.state_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.version, 2);
    }

    #[tokio::test]
    async fn cas_success_bumps_to_expected_plus_one() {
        let store = MemoryStore::new();
        let tenant = TenantId::v4();
        let stored = store.upsert_state(make_state(tenant, "web-03")).await.unwrap();

        let new_version = store
            .update_state_status(
                tenant,
                stored.state_id,
                StateStatus::Drifted,
                None,
                Some(Utc::now()),
                stored.version,
            )
            .await
            .unwrap();
        assert_eq!(new_version, stored.version + 1);

        let fetched = store.get_state(tenant, stored.state_id).await.unwrap().unwrap();
        assert_eq!(fetched.status, StateStatus::Drifted);
        assert!(fetched.last_checked.is_some());
    }

    #[tokio::test]
    async fn cas_mismatch_fails_and_changes_nothing() {
        let store = MemoryStore::new();
        let tenant = TenantId::v4();
        let stored = store.upsert_state(make_state(tenant, "web-03")).await.unwrap();

        let err = store
            .update_state_status(
                tenant,
                stored.state_id,
                StateStatus::Failed,
                Some("boom".into()),
                None,
                stored.version + 7,
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let fetched = store.get_state(tenant, stored.state_id).await.unwrap().unwrap();
        assert_eq!(fetched.status, StateStatus::Pending);
        assert_eq!(fetched.version, stored.version);
    }

    #[tokio::test]
    async fn cas_counters_are_recorded() {
        let metrics = MetricsRegistry::new();
        let store = MemoryStore::with_metrics(metrics.clone());
        let tenant = TenantId::v4();
        let stored = store.upsert_state(make_state(tenant, "web-03")).await.unwrap();

        store
            .update_state_status(tenant, stored.state_id, StateStatus::Drifted, None, None, 1)
            .await
            .unwrap();
        let _ = store
            .update_state_status(tenant, stored.state_id, StateStatus::Failed, None, None, 1)
            .await;

        assert_eq!(metrics.counter(names::VERSIONED_WRITE_SUCCESS_TOTAL).get(), 1);
        assert_eq!(metrics.counter(names::VERSIONED_WRITE_CONFLICT_TOTAL).get(), 1);
    }

    #[tokio::test]
    async fn list_states_by_status_filters_by_shard() {
        let store = MemoryStore::new();
        let tenant = TenantId::v4();
        for i in 0..10 {
            store
                .upsert_state(make_state(tenant, &format!("node-{i}")))
                .await
                .unwrap();
        }

        let shard_count = 4;
        let mut total = 0;
        for index in 0..shard_count {
            let shard = store
                .list_states_by_status(StateStatus::Pending, index, shard_count)
                .await
                .unwrap();
            for state in &shard {
                assert!(owns_shard(&state.node, index, shard_count));
            }
            total += shard.len();
        }
        assert_eq!(total, 10);

        let all = store
            .list_states_by_status(StateStatus::Pending, 0, 1)
            .await
            .unwrap();
        assert_eq!(all.len(), 10);
    }

    #[tokio::test]
    async fn get_state_by_node() {
        let store = MemoryStore::new();
        let tenant = TenantId::v4();
        store.upsert_state(make_state(tenant, "web-03")).await.unwrap();

        let node = NodeName::new("web-03").unwrap();
        let found = store.get_state_by_node(tenant, &node).await.unwrap().unwrap();
        assert_eq!(found.node, node);

        // Scoped to the tenant and the node.
        let other = NodeName::new("web-04").unwrap();
        assert!(store.get_state_by_node(tenant, &other).await.unwrap().is_none());
        assert!(
            store
                .get_state_by_node(TenantId::v4(), &node)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn count_states_by_status() {
        let store = MemoryStore::new();
        let tenant = TenantId::v4();
        let s1 = store.upsert_state(make_state(tenant, "a")).await.unwrap();
        store.upsert_state(make_state(tenant, "b")).await.unwrap();

        store
            .update_state_status(tenant, s1.state_id, StateStatus::Compliant, None, None, 1)
            .await
            .unwrap();

        assert_eq!(store.count_states_by_status(StateStatus::Pending).await.unwrap(), 1);
        assert_eq!(
            store.count_states_by_status(StateStatus::Compliant).await.unwrap(),
            1
        );
    }

    // ── Jobs ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn job_lifecycle() {
        let store = MemoryStore::new();
        let tenant = TenantId::v4();
        let job = Job::new(
            tenant,
            NodeName::new("web-03").unwrap(),
            None,
            "uptime",
            "trace-1",
        );
        let job_id = job.job_id;
        store.create_job(job).await.unwrap();

        store
            .update_job_status(tenant, job_id, JobStatus::Running, None, None, None)
            .await
            .unwrap();
        store
            .update_job_status(
                tenant,
                job_id,
                JobStatus::Completed,
                Some(0),
                Some("ok".into()),
                None,
            )
            .await
            .unwrap();

        let fetched = store.get_job(tenant, job_id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Completed);
        assert_eq!(fetched.exit_code, Some(0));
        assert_eq!(fetched.stdout, "ok");
    }

    #[tokio::test]
    async fn terminal_job_rejects_updates() {
        let store = MemoryStore::new();
        let tenant = TenantId::v4();
        let job = Job::new(tenant, NodeName::new("web-03").unwrap(), None, "true", "t");
        let job_id = job.job_id;
        store.create_job(job).await.unwrap();

        store
            .update_job_status(tenant, job_id, JobStatus::Failed, Some(1), None, None)
            .await
            .unwrap();
        let err = store
            .update_job_status(tenant, job_id, JobStatus::Running, None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, FluxError::InvalidInput(_)));
    }

    // ── Epochs ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn epoch_is_monotonic_per_resource() {
        let store = MemoryStore::new();
        assert_eq!(store.increment_durable_epoch("leader").await.unwrap(), 1);
        assert_eq!(store.increment_durable_epoch("leader").await.unwrap(), 2);
        assert_eq!(store.increment_durable_epoch("other").await.unwrap(), 1);
        assert_eq!(store.current_durable_epoch("leader").await.unwrap(), 2);
        assert_eq!(store.current_durable_epoch("unknown").await.unwrap(), 0);
    }

    // ── Leases ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn lease_acquire_is_exclusive() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);
        assert!(store.acquire_lease("leader:cp", "replica-1", ttl).await.unwrap());
        assert!(!store.acquire_lease("leader:cp", "replica-2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn lease_renew_requires_matching_value() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);
        store.acquire_lease("leader:cp", "replica-1", ttl).await.unwrap();

        assert!(store.renew_lease("leader:cp", "replica-1", ttl).await.unwrap());
        assert!(!store.renew_lease("leader:cp", "replica-2", ttl).await.unwrap());
        assert!(!store.renew_lease("missing", "replica-1", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_reacquired() {
        let store = MemoryStore::new();
        store
            .acquire_lease("leader:cp", "replica-1", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(
            store
                .acquire_lease("leader:cp", "replica-2", Duration::from_secs(30))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn release_lease_requires_ownership() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);
        store.acquire_lease("leader:cp", "replica-1", ttl).await.unwrap();

        assert!(!store.release_lease("leader:cp", "replica-2").await.unwrap());
        assert!(store.release_lease("leader:cp", "replica-1").await.unwrap());
        assert!(store.acquire_lease("leader:cp", "replica-2", ttl).await.unwrap());
    }

    // ── Idempotency ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn lock_then_result_lifecycle() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        assert!(store.acquire_lock("idem:k1", "req-1", 3, ttl).await.unwrap());
        assert!(!store.acquire_lock("idem:k1", "req-2", 3, ttl).await.unwrap());

        match store.get_idempotency_state("idem:k1").await.unwrap() {
            Some(IdempotencyState::Locked { owner, .. }) => assert_eq!(owner, "req-1"),
            other => panic!("expected Locked, got {other:?}"),
        }

        let response = StoredResponse {
            status: 201,
            headers: vec![("content-type".into(), "application/json".into())],
            body: "{\"ok\":true}".into(),
        };
        store
            .store_idempotency_result("idem:k1", response.clone(), Duration::from_secs(600))
            .await
            .unwrap();

        // Result wins; the lock is gone.
        match store.get_idempotency_state("idem:k1").await.unwrap() {
            Some(IdempotencyState::Result(cached)) => assert_eq!(cached, response),
            other => panic!("expected Result, got {other:?}"),
        }
        assert!(store.acquire_lock("idem:k1", "req-3", 3, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_reads_as_absent() {
        let store = MemoryStore::new();
        store
            .acquire_lock("idem:k1", "req-1", 1, Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(store.get_idempotency_state("idem:k1").await.unwrap().is_none());
        assert!(
            store
                .acquire_lock("idem:k1", "req-2", 1, Duration::from_secs(60))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn janitor_sees_live_locks() {
        let store = MemoryStore::new();
        store
            .acquire_lock("idem:k1", "req-1", 2, Duration::from_secs(60))
            .await
            .unwrap();
        store
            .acquire_lock("idem:k2", "req-2", 5, Duration::from_secs(60))
            .await
            .unwrap();

        let locks = store.list_locks().await.unwrap();
        assert_eq!(locks.len(), 2);
        let stale: Vec<_> = locks.iter().filter(|l| l.owner_epoch < 5).collect();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].key, "idem:k1");

        assert!(store.delete_lock("idem:k1").await.unwrap());
        assert!(!store.delete_lock("idem:k1").await.unwrap());
    }
}
