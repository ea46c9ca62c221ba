//! The scheduler: admission, ordering, and the worker pool.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use flux_core::{FluxError, FluxResult, NodeName, RejectReason, RequestId, StateId, TenantId};
use flux_coordination::LeaderState;
use flux_state::StateStatus;
use flux_store::Store;
use flux_telemetry::{MetricsRegistry, names};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use crate::mode::ModeSwitch;
use crate::task::{PriorityQueue, ReconciliationTask};
use crate::window::FailureWindow;

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker pool size.
    pub max_concurrency: usize,
    /// Queue capacity; submissions beyond it are rejected.
    pub queue_capacity: usize,
    /// Seconds of waiting that buy one priority level.
    pub aging_factor: Duration,
    /// Concurrent tasks allowed per tenant.
    pub per_tenant_cap: usize,
    /// Minimum rolling success fraction for a node to be dispatched to.
    pub node_health_threshold: f64,
    /// Rolling window length for health scoring.
    pub failure_window: Duration,
    /// How long a task backs off when its node is busy or unhealthy.
    pub requeue_penalty: Duration,
    /// Main loop tick.
    pub tick: Duration,
    /// Global circuit breaker settings (per-node breakers share them).
    pub breaker: BreakerConfig,
    /// This replica's shard for rehydration scans.
    pub shard_index: u32,
    /// Total shards participating in scans.
    pub shard_count: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            queue_capacity: 1000,
            aging_factor: Duration::from_secs(10),
            per_tenant_cap: 4,
            node_health_threshold: 0.5,
            failure_window: Duration::from_secs(60),
            requeue_penalty: Duration::from_millis(250),
            tick: Duration::from_millis(50),
            breaker: BreakerConfig::default(),
            shard_index: 0,
            shard_count: 1,
        }
    }
}

impl SchedulerConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> FluxResult<()> {
        if self.max_concurrency == 0 {
            return Err(FluxError::InvalidInput(
                "max_concurrency must be greater than 0".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(FluxError::InvalidInput(
                "queue_capacity must be greater than 0".into(),
            ));
        }
        if self.aging_factor.is_zero() {
            return Err(FluxError::InvalidInput(
                "aging_factor must be greater than 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.node_health_threshold) {
            return Err(FluxError::InvalidInput(
                "node_health_threshold must be within 0..=1".into(),
            ));
        }
        if self.shard_count > 0 && self.shard_index >= self.shard_count {
            return Err(FluxError::InvalidInput(
                "shard_index must be below shard_count".into(),
            ));
        }
        self.breaker.validate()
    }
}

/// How a runner finished a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskDisposition {
    /// The protocol reached `compliant`.
    Reconciled,
    /// The protocol reached `failed`: the node did not converge.
    Failed,
    /// Nothing to do: single-flight was held, the state vanished, or a
    /// concurrent writer won. Neutral for health accounting.
    Skipped,
}

/// The port the scheduler drives. The reconciler implements it; holding
/// the trait here instead of the reconciler itself keeps the dependency
/// arrow pointing one way.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Run one task. `term` is cancelled when leadership is lost; the
    /// runner must stop writing and return promptly.
    async fn run(
        &self,
        term: CancellationToken,
        task: ReconciliationTask,
    ) -> FluxResult<TaskDisposition>;
}

/// Per-tenant integrity accounting: every submitted task must be queued,
/// active, or terminal. Skew is a fatal-grade signal, surfaced, never
/// silently repaired.
#[derive(Default)]
struct Ledger {
    counts: Mutex<HashMap<TenantId, TenantCounts>>,
}

#[derive(Default, Clone, Copy)]
struct TenantCounts {
    submitted: i64,
    queued: i64,
    active: i64,
    terminal: i64,
}

impl Ledger {
    fn on_submitted(&self, tenant: TenantId, metrics: &MetricsRegistry) {
        let mut counts = self.counts.lock();
        let entry = counts.entry(tenant).or_default();
        entry.submitted += 1;
        entry.queued += 1;
        Self::publish(tenant, *entry, metrics);
    }

    fn on_dispatched(&self, tenant: TenantId, metrics: &MetricsRegistry) {
        let mut counts = self.counts.lock();
        let entry = counts.entry(tenant).or_default();
        entry.queued -= 1;
        entry.active += 1;
        Self::publish(tenant, *entry, metrics);
    }

    fn on_terminal_from_active(&self, tenant: TenantId, metrics: &MetricsRegistry) {
        let mut counts = self.counts.lock();
        let entry = counts.entry(tenant).or_default();
        entry.active -= 1;
        entry.terminal += 1;
        Self::publish(tenant, *entry, metrics);
    }

    fn on_terminal_from_queue(&self, tenant: TenantId, metrics: &MetricsRegistry) {
        let mut counts = self.counts.lock();
        let entry = counts.entry(tenant).or_default();
        entry.queued -= 1;
        entry.terminal += 1;
        Self::publish(tenant, *entry, metrics);
    }

    fn publish(tenant: TenantId, counts: TenantCounts, metrics: &MetricsRegistry) {
        let skew = counts.submitted - counts.queued - counts.active - counts.terminal;
        if skew != 0 {
            tracing::error!(
                tenant = %tenant,
                skew,
                "task accounting skew detected, operator attention required"
            );
        }
        metrics
            .gauge_vec(names::INTEGRITY_SKEW_COUNT, &["tenant"])
            .with(&[&tenant.to_string()])
            .set(skew);
    }
}

struct Shared {
    config: SchedulerConfig,
    metrics: MetricsRegistry,
    mode: Arc<ModeSwitch>,
    breaker: CircuitBreaker,
    leader: watch::Receiver<LeaderState>,
    tx: mpsc::Sender<ReconciliationTask>,
    ledger: Ledger,
}

impl Shared {
    fn reject(&self, reason: RejectReason) -> FluxError {
        self.metrics
            .counter_vec(names::SCHEDULER_REJECTIONS_TOTAL, &["reason"])
            .with(&[reason.as_str()])
            .inc();
        FluxError::rejected(reason)
    }

    fn publish_circuit_state(&self) {
        self.metrics
            .gauge_vec(names::SCHEDULER_CIRCUIT_STATE, &["state"])
            .set_exclusive(&[&self.breaker.state().to_string()]);
    }

    fn enqueue(&self, task: ReconciliationTask) -> FluxResult<RequestId> {
        if !self.mode.get().accepts_submissions() {
            return Err(self.reject(RejectReason::ModeClosed));
        }
        if self.breaker.state() == CircuitState::Open {
            self.publish_circuit_state();
            return Err(self.reject(RejectReason::CircuitOpen));
        }
        let req_id = task.req_id;
        let tenant = task.tenant;
        self.tx
            .try_send(task)
            .map_err(|_| self.reject(RejectReason::QueueFull))?;
        self.ledger.on_submitted(tenant, &self.metrics);
        Ok(req_id)
    }
}

/// Handle for submitting work to a running scheduler.
pub struct SchedulerHandle {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Submit a reconciliation task.
    ///
    /// Rejections come back as `SchedulerRejected` with the reason:
    /// `not_leader`, `mode_closed`, `circuit_open`, or `queue_full`.
    pub fn submit(
        &self,
        tenant: TenantId,
        node: NodeName,
        state_id: StateId,
        priority: u8,
        ttl: Duration,
    ) -> FluxResult<RequestId> {
        let leader = self.shared.leader.borrow().clone();
        if !leader.is_leader {
            return Err(self.shared.reject(RejectReason::NotLeader));
        }
        let task = ReconciliationTask::new(tenant, node, state_id, priority, ttl, leader.epoch);
        self.shared.enqueue(task)
    }

    /// Current admission mode switch.
    #[must_use]
    pub fn mode(&self) -> &ModeSwitch {
        &self.shared.mode
    }

    /// Wait for the scheduler task to finish (after shutdown).
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

struct Done {
    task: ReconciliationTask,
    started: Instant,
    result: FluxResult<TaskDisposition>,
}

/// The scheduler. Build with [`new`](Self::new), start with
/// [`spawn`](Self::spawn).
pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<dyn Store>,
    runner: Arc<dyn TaskRunner>,
    mode: Arc<ModeSwitch>,
    metrics: MetricsRegistry,
    leader: watch::Receiver<LeaderState>,
}

impl Scheduler {
    /// Create a scheduler.
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn Store>,
        runner: Arc<dyn TaskRunner>,
        mode: Arc<ModeSwitch>,
        metrics: MetricsRegistry,
        leader: watch::Receiver<LeaderState>,
    ) -> Self {
        Self {
            config,
            store,
            runner,
            mode,
            metrics,
            leader,
        }
    }

    /// Start the scheduler. The main loop dispatches only while the
    /// replica leads; on leadership loss it drops queued work (the next
    /// leader rehydrates) and waits for the next term.
    pub fn spawn(self, shutdown: CancellationToken) -> SchedulerHandle {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let shared = Arc::new(Shared {
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            mode: self.mode.clone(),
            breaker: CircuitBreaker::new(self.config.breaker.clone()),
            leader: self.leader.clone(),
            tx,
            ledger: Ledger::default(),
        });
        shared.publish_circuit_state();

        let loop_shared = shared.clone();
        let task = tokio::spawn(run_loop(
            loop_shared,
            rx,
            self.store,
            self.runner,
            self.leader,
            shutdown,
        ));
        SchedulerHandle { shared, task }
    }
}

async fn run_loop(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<ReconciliationTask>,
    store: Arc<dyn Store>,
    runner: Arc<dyn TaskRunner>,
    mut leader: watch::Receiver<LeaderState>,
    shutdown: CancellationToken,
) {
    loop {
        let state = leader.borrow().clone();
        if shutdown.is_cancelled() {
            return;
        }
        if !state.is_leader {
            tokio::select! {
                () = shutdown.cancelled() => return,
                changed = leader.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            continue;
        }

        let term = state.term_token();
        if term.is_cancelled() {
            // Demotion already in flight; wait for the follower state to
            // land instead of re-entering a dead term.
            tokio::select! {
                () = shutdown.cancelled() => return,
                changed = leader.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            continue;
        }
        tracing::info!(epoch = state.epoch, "scheduler entering leader term");
        rehydrate(&shared, &store, state.epoch).await;
        lead(&shared, &mut rx, &runner, &term).await;
        tracing::info!(epoch = state.epoch, "scheduler left leader term");
    }
}

/// Enqueue a task for every pending or drifted state in our shard. This
/// recovers in-flight intent after failover without any queue
/// durability.
async fn rehydrate(shared: &Arc<Shared>, store: &Arc<dyn Store>, epoch: i64) {
    let mut recovered = 0usize;
    for status in [StateStatus::Pending, StateStatus::Drifted] {
        let states = match store
            .list_states_by_status(status, shared.config.shard_index, shared.config.shard_count)
            .await
        {
            Ok(states) => states,
            Err(err) => {
                tracing::warn!(error = %err, %status, "rehydration scan failed");
                continue;
            }
        };
        for state in states {
            let task = ReconciliationTask::new(
                state.tenant,
                state.node.clone(),
                state.state_id,
                5,
                Duration::from_secs(60),
                epoch,
            );
            match shared.enqueue(task) {
                Ok(_) => recovered += 1,
                Err(err) => {
                    tracing::warn!(error = %err, state_id = %state.state_id, "rehydration enqueue refused");
                }
            }
        }
    }
    if recovered > 0 {
        tracing::info!(recovered, "rehydrated states into the queue");
    }
}

#[allow(clippy::too_many_lines)]
async fn lead(
    shared: &Arc<Shared>,
    rx: &mut mpsc::Receiver<ReconciliationTask>,
    runner: &Arc<dyn TaskRunner>,
    term: &CancellationToken,
) {
    let config = &shared.config;
    let metrics = &shared.metrics;

    let mut queue = PriorityQueue::new(config.aging_factor);
    let mut deferred: Vec<(Instant, ReconciliationTask)> = Vec::new();
    let mut busy: HashSet<NodeName> = HashSet::new();
    let mut node_windows: HashMap<NodeName, FailureWindow> = HashMap::new();
    let mut tenant_windows: HashMap<TenantId, FailureWindow> = HashMap::new();
    let mut node_breakers: HashMap<NodeName, CircuitBreaker> = HashMap::new();
    let mut active_per_tenant: HashMap<TenantId, usize> = HashMap::new();
    let mut active = 0usize;
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Done>();

    loop {
        tokio::select! {
            () = term.cancelled() => {
                // Leadership lost: queued intent is dropped here and
                // rediscovered by the next leader's rehydration pass.
                while let Some(task) = queue.pop() {
                    shared.ledger.on_terminal_from_queue(task.tenant, metrics);
                }
                for (_, task) in deferred.drain(..) {
                    shared.ledger.on_terminal_from_queue(task.tenant, metrics);
                }
                while let Ok(task) = rx.try_recv() {
                    shared.ledger.on_terminal_from_queue(task.tenant, metrics);
                }
                metrics.gauge(names::SCHEDULER_QUEUE_DEPTH).set(0);
                metrics.gauge(names::SCHEDULER_WORKER_SATURATION).set(0);
                return;
            }
            maybe_task = rx.recv() => {
                if let Some(task) = maybe_task {
                    queue.push(task);
                }
            }
            maybe_done = done_rx.recv() => {
                if let Some(done) = maybe_done {
                    handle_done(
                        shared,
                        done,
                        &mut busy,
                        &mut node_windows,
                        &mut tenant_windows,
                        &mut node_breakers,
                        &mut active_per_tenant,
                        &mut active,
                    );
                }
            }
            () = tokio::time::sleep(config.tick) => {}
        }

        // Pull everything already sitting in the channel.
        while let Ok(task) = rx.try_recv() {
            queue.push(task);
        }

        // Return deferred tasks whose backoff has lapsed.
        let now = Instant::now();
        let mut still_deferred = Vec::new();
        for (not_before, task) in deferred.drain(..) {
            if not_before <= now {
                queue.push(task);
            } else {
                still_deferred.push((not_before, task));
            }
        }
        deferred = still_deferred;

        if shared.mode.get().dispatches() {
            dispatch(
                shared,
                runner,
                term,
                &done_tx,
                &mut queue,
                &mut deferred,
                &mut busy,
                &mut node_windows,
                &mut node_breakers,
                &mut active_per_tenant,
                &mut active,
            );
        }

        publish_gauges(shared, &queue, &deferred, active);
    }
}

#[allow(clippy::too_many_arguments)]
fn dispatch(
    shared: &Arc<Shared>,
    runner: &Arc<dyn TaskRunner>,
    term: &CancellationToken,
    done_tx: &mpsc::UnboundedSender<Done>,
    queue: &mut PriorityQueue,
    deferred: &mut Vec<(Instant, ReconciliationTask)>,
    busy: &mut HashSet<NodeName>,
    node_windows: &mut HashMap<NodeName, FailureWindow>,
    node_breakers: &mut HashMap<NodeName, CircuitBreaker>,
    active_per_tenant: &mut HashMap<TenantId, usize>,
    active: &mut usize,
) {
    let config = &shared.config;
    let metrics = &shared.metrics;
    let now = Instant::now();

    while *active < config.max_concurrency {
        let Some(task) = queue.pop() else {
            break;
        };

        if task.expired(now) {
            metrics
                .counter_vec(
                    names::TASK_TIMEOUTS_TOTAL,
                    &["state_id", "phase", "timeout_reason"],
                )
                .with(&[&task.state_id.to_string(), "admission", "deadline"])
                .inc();
            tracing::debug!(state_id = %task.state_id, "dropping expired task");
            shared.ledger.on_terminal_from_queue(task.tenant, metrics);
            continue;
        }

        if busy.contains(&task.node) {
            metrics.counter(names::TASK_RETRIES_TOTAL).inc();
            deferred.push((now + config.requeue_penalty, task));
            continue;
        }

        let node_window = node_windows
            .entry(task.node.clone())
            .or_insert_with(|| FailureWindow::new(config.failure_window));
        if node_window.health_score() < config.node_health_threshold {
            metrics.counter(names::TASK_RETRIES_TOTAL).inc();
            deferred.push((now + config.requeue_penalty, task));
            continue;
        }

        let node_breaker = node_breakers
            .entry(task.node.clone())
            .or_insert_with(|| CircuitBreaker::new(config.breaker.clone()));
        if !node_breaker.try_acquire() {
            metrics.counter(names::TASK_RETRIES_TOTAL).inc();
            deferred.push((now + config.requeue_penalty, task));
            continue;
        }

        if active_per_tenant.get(&task.tenant).copied().unwrap_or(0) >= config.per_tenant_cap {
            metrics.counter(names::TASK_RETRIES_TOTAL).inc();
            deferred.push((now + config.requeue_penalty, task));
            continue;
        }

        if !shared.breaker.try_acquire() {
            shared.publish_circuit_state();
            metrics.counter(names::TASK_RETRIES_TOTAL).inc();
            deferred.push((now + config.requeue_penalty, task));
            continue;
        }

        busy.insert(task.node.clone());
        *active += 1;
        *active_per_tenant.entry(task.tenant).or_insert(0) += 1;
        shared.ledger.on_dispatched(task.tenant, metrics);

        let runner = runner.clone();
        let done_tx = done_tx.clone();
        let worker_term = term.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let result = tokio::select! {
                result = runner.run(worker_term.clone(), task.clone()) => result,
                () = worker_term.cancelled() => Err(FluxError::cancelled("leadership lost")),
            };
            // The loop may already be gone on shutdown; nothing to do then.
            let _ = done_tx.send(Done {
                task,
                started,
                result,
            });
        });
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_done(
    shared: &Arc<Shared>,
    done: Done,
    busy: &mut HashSet<NodeName>,
    node_windows: &mut HashMap<NodeName, FailureWindow>,
    tenant_windows: &mut HashMap<TenantId, FailureWindow>,
    node_breakers: &mut HashMap<NodeName, CircuitBreaker>,
    active_per_tenant: &mut HashMap<TenantId, usize>,
    active: &mut usize,
) {
    let config = &shared.config;
    let metrics = &shared.metrics;
    let Done {
        task,
        started,
        result,
    } = done;

    busy.remove(&task.node);
    *active = active.saturating_sub(1);
    if let Some(count) = active_per_tenant.get_mut(&task.tenant) {
        *count = count.saturating_sub(1);
    }
    shared.ledger.on_terminal_from_active(task.tenant, metrics);

    metrics
        .histogram(names::TASK_RUNTIME_SECONDS)
        .observe(started.elapsed().as_secs_f64());

    // Busy, conflict, cancellation, and vanished states are neutral:
    // they say nothing about the node's health.
    let verdict = match &result {
        Ok(TaskDisposition::Reconciled) => Some(true),
        Ok(TaskDisposition::Failed) => Some(false),
        Ok(TaskDisposition::Skipped) => None,
        Err(FluxError::Busy { .. } | FluxError::Cancelled { .. } | FluxError::Conflict { .. }) => {
            None
        }
        Err(err) if err.is_not_found() => None,
        Err(_) => Some(false),
    };

    match verdict {
        Some(true) => {
            metrics.counter(names::TASK_SUCCESS_TOTAL).inc();
            shared.breaker.on_success();
            node_breakers
                .entry(task.node.clone())
                .or_insert_with(|| CircuitBreaker::new(config.breaker.clone()))
                .on_success();
            node_windows
                .entry(task.node.clone())
                .or_insert_with(|| FailureWindow::new(config.failure_window))
                .record(true);
            tenant_windows
                .entry(task.tenant)
                .or_insert_with(|| FailureWindow::new(config.failure_window))
                .record(true);
        }
        Some(false) => {
            if let Err(err) = &result {
                tracing::warn!(
                    state_id = %task.state_id,
                    node = %task.node,
                    error = %err,
                    "task failed"
                );
            }
            shared.breaker.on_failure();
            node_breakers
                .entry(task.node.clone())
                .or_insert_with(|| CircuitBreaker::new(config.breaker.clone()))
                .on_failure();
            node_windows
                .entry(task.node.clone())
                .or_insert_with(|| FailureWindow::new(config.failure_window))
                .record(false);
            tenant_windows
                .entry(task.tenant)
                .or_insert_with(|| FailureWindow::new(config.failure_window))
                .record(false);
        }
        None => {
            // Every breaker this task acquired must still hear back, or
            // a half-open probe stays in flight forever. Neutral is not
            // success: the failure streaks are left untouched.
            shared.breaker.on_neutral();
            if let Some(node_breaker) = node_breakers.get(&task.node) {
                node_breaker.on_neutral();
            }
        }
    }
    shared.publish_circuit_state();
}

fn publish_gauges(
    shared: &Arc<Shared>,
    queue: &PriorityQueue,
    deferred: &[(Instant, ReconciliationTask)],
    active: usize,
) {
    let metrics = &shared.metrics;
    let depth = queue.len() + deferred.len();
    metrics
        .gauge(names::SCHEDULER_QUEUE_DEPTH)
        .set(depth as i64);

    let saturation_pct = if shared.config.max_concurrency == 0 {
        0
    } else {
        (active * 100 / shared.config.max_concurrency) as i64
    };
    metrics
        .gauge(names::SCHEDULER_WORKER_SATURATION)
        .set(saturation_pct);

    let oldest_age = queue
        .oldest_submission()
        .map_or(0, |at| at.elapsed().as_secs() as i64);
    metrics.gauge(names::INTENT_AGE_SECONDS).set(oldest_age);
}
