//! End-to-end scheduler behavior against a live elector and fake runners.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use flux_core::{FluxError, FluxResult, NodeName, RejectReason, StateId, TenantId};
use flux_coordination::{ElectionConfig, LeaderElector, LeaderHandle};
use flux_scheduler::{
    AdmissionMode, BreakerConfig, ModeSwitch, ReconciliationTask, Scheduler, SchedulerConfig,
    SchedulerHandle, TaskDisposition, TaskRunner,
};
use flux_state::DesiredState;
use flux_store::{MemoryStore, Store};
use flux_telemetry::{MetricsRegistry, names};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Runner that records every task it sees and succeeds after a small
/// configurable delay.
struct RecordingRunner {
    delay: Duration,
    runs: AtomicU32,
    per_node_inflight: Mutex<HashMap<NodeName, u32>>,
    max_node_overlap: AtomicU32,
}

impl RecordingRunner {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            runs: AtomicU32::new(0),
            per_node_inflight: Mutex::new(HashMap::new()),
            max_node_overlap: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl TaskRunner for RecordingRunner {
    async fn run(
        &self,
        _term: CancellationToken,
        task: ReconciliationTask,
    ) -> FluxResult<TaskDisposition> {
        {
            let mut inflight = self.per_node_inflight.lock();
            let count = inflight.entry(task.node.clone()).or_insert(0);
            *count += 1;
            self.max_node_overlap.fetch_max(*count, Ordering::SeqCst);
        }
        tokio::time::sleep(self.delay).await;
        {
            let mut inflight = self.per_node_inflight.lock();
            if let Some(count) = inflight.get_mut(&task.node) {
                *count -= 1;
            }
        }
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(TaskDisposition::Reconciled)
    }
}

/// Runner that always fails with a transport error.
struct FailingRunner;

#[async_trait]
impl TaskRunner for FailingRunner {
    async fn run(
        &self,
        _term: CancellationToken,
        _task: ReconciliationTask,
    ) -> FluxResult<TaskDisposition> {
        Err(FluxError::Transport("agent unreachable".into()))
    }
}

/// Runner whose outcome is chosen by node name: `busy-*` nodes resolve
/// neutrally (single-flight held elsewhere), everything else fails.
struct MixedRunner;

#[async_trait]
impl TaskRunner for MixedRunner {
    async fn run(
        &self,
        _term: CancellationToken,
        task: ReconciliationTask,
    ) -> FluxResult<TaskDisposition> {
        if task.node.as_str().starts_with("busy") {
            Err(FluxError::busy(&task.node))
        } else {
            Err(FluxError::Transport("agent unreachable".into()))
        }
    }
}

struct Harness {
    handle: SchedulerHandle,
    elector: LeaderHandle,
    metrics: MetricsRegistry,
    shutdown: CancellationToken,
    tenant: TenantId,
}

async fn start(runner: Arc<dyn TaskRunner>, config: SchedulerConfig) -> Harness {
    let metrics = MetricsRegistry::new();
    let store = Arc::new(MemoryStore::with_metrics(metrics.clone()));
    let shutdown = CancellationToken::new();

    let election = ElectionConfig {
        lease_ttl: Duration::from_millis(90),
        ..ElectionConfig::new("replica-under-test")
    };
    let elector = LeaderElector::new(election, store.clone(), metrics.clone())
        .spawn(shutdown.clone());
    let mut leader_rx = elector.state();
    leader_rx.wait_for(|s| s.is_leader).await.unwrap();

    let mode = Arc::new(ModeSwitch::new(metrics.clone()));
    let handle = Scheduler::new(
        config,
        store.clone() as Arc<dyn Store>,
        runner,
        mode,
        metrics.clone(),
        elector.state(),
    )
    .spawn(shutdown.clone());

    Harness {
        handle,
        elector,
        metrics,
        shutdown,
        tenant: TenantId::v4(),
    }
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        tick: Duration::from_millis(5),
        requeue_penalty: Duration::from_millis(10),
        ..SchedulerConfig::default()
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, deadline: Duration, check: F) {
    let start = tokio::time::Instant::now();
    while !check() {
        assert!(
            start.elapsed() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn teardown(harness: Harness) {
    harness.shutdown.cancel();
    harness.handle.join().await;
    harness.elector.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn submitted_task_runs_to_success() {
    let runner = Arc::new(RecordingRunner::new(Duration::from_millis(5)));
    let harness = start(runner.clone(), fast_config()).await;

    harness
        .handle
        .submit(
            harness.tenant,
            NodeName::new("web-01").unwrap(),
            StateId::v4(),
            5,
            Duration::from_secs(60),
        )
        .unwrap();

    let metrics = harness.metrics.clone();
    wait_for("task completion", Duration::from_secs(5), || {
        metrics.counter(names::TASK_SUCCESS_TOTAL).get() == 1
    })
    .await;
    assert_eq!(runner.runs.load(Ordering::SeqCst), 1);

    // Integrity: nothing unaccounted for.
    let skew = harness
        .metrics
        .gauge_vec(names::INTEGRITY_SKEW_COUNT, &["tenant"])
        .with(&[&harness.tenant.to_string()])
        .get();
    assert_eq!(skew, 0);

    teardown(harness).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_node_tasks_never_overlap() {
    let runner = Arc::new(RecordingRunner::new(Duration::from_millis(30)));
    let harness = start(runner.clone(), fast_config()).await;
    let node = NodeName::new("web-01").unwrap();

    for _ in 0..4 {
        harness
            .handle
            .submit(
                harness.tenant,
                node.clone(),
                StateId::v4(),
                5,
                Duration::from_secs(60),
            )
            .unwrap();
    }

    let metrics = harness.metrics.clone();
    wait_for("all tasks", Duration::from_secs(10), || {
        metrics.counter(names::TASK_SUCCESS_TOTAL).get() == 4
    })
    .await;

    assert_eq!(
        runner.max_node_overlap.load(Ordering::SeqCst),
        1,
        "two reconciliations overlapped on one node"
    );
    teardown(harness).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn freeze_rejects_new_tasks_but_finishes_inflight() {
    let runner = Arc::new(RecordingRunner::new(Duration::from_millis(40)));
    let harness = start(runner.clone(), fast_config()).await;

    // T1 under normal admission.
    harness
        .handle
        .submit(
            harness.tenant,
            NodeName::new("web-01").unwrap(),
            StateId::v4(),
            5,
            Duration::from_secs(60),
        )
        .unwrap();

    // Give the loop a moment to dispatch T1, then freeze.
    tokio::time::sleep(Duration::from_millis(20)).await;
    harness.handle.mode().set(AdmissionMode::Freeze);

    // T2 is refused at the door.
    let err = harness
        .handle
        .submit(
            harness.tenant,
            NodeName::new("web-02").unwrap(),
            StateId::v4(),
            5,
            Duration::from_secs(60),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        FluxError::SchedulerRejected {
            reason: RejectReason::ModeClosed
        }
    ));

    // T1 still runs to completion.
    let metrics = harness.metrics.clone();
    wait_for("inflight task", Duration::from_secs(5), || {
        metrics.counter(names::TASK_SUCCESS_TOTAL).get() == 1
    })
    .await;
    assert_eq!(
        harness.metrics.gauge(names::SCHEDULER_QUEUE_DEPTH).get(),
        0
    );
    teardown(harness).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn circuit_opens_after_consecutive_failures() {
    let config = SchedulerConfig {
        breaker: BreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
            max_cooldown_factor: 8,
        },
        ..fast_config()
    };
    let harness = start(Arc::new(FailingRunner), config).await;

    for i in 0..3 {
        harness
            .handle
            .submit(
                harness.tenant,
                NodeName::new(format!("web-{i}")).unwrap(),
                StateId::v4(),
                5,
                Duration::from_secs(60),
            )
            .unwrap();
    }

    // Wait for the breaker to trip, then the next submit is refused.
    let metrics = harness.metrics.clone();
    wait_for("circuit open", Duration::from_secs(5), || {
        metrics
            .gauge_vec(names::SCHEDULER_CIRCUIT_STATE, &["state"])
            .with(&["open"])
            .get()
            == 1
    })
    .await;

    let err = harness
        .handle
        .submit(
            harness.tenant,
            NodeName::new("web-9").unwrap(),
            StateId::v4(),
            5,
            Duration::from_secs(60),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        FluxError::SchedulerRejected {
            reason: RejectReason::CircuitOpen
        }
    ));

    let rejections = harness
        .metrics
        .counter_vec(names::SCHEDULER_REJECTIONS_TOTAL, &["reason"])
        .with(&["circuit_open"])
        .get();
    assert_eq!(rejections, 1);
    teardown(harness).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn neutral_outcomes_do_not_reset_the_failure_streak() {
    let config = SchedulerConfig {
        breaker: BreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
            max_cooldown_factor: 8,
        },
        ..fast_config()
    };
    let harness = start(Arc::new(MixedRunner), config).await;

    // Busy collisions interleave with the failing nodes, the way
    // single-flight hits and CAS races do under real concurrent load.
    for i in 0..3 {
        for prefix in ["busy", "web"] {
            harness
                .handle
                .submit(
                    harness.tenant,
                    NodeName::new(format!("{prefix}-{i}")).unwrap(),
                    StateId::v4(),
                    5,
                    Duration::from_secs(60),
                )
                .unwrap();
        }
    }

    // Three genuine failures must trip the breaker regardless of how
    // the neutral completions interleave with them.
    let metrics = harness.metrics.clone();
    wait_for("circuit open", Duration::from_secs(5), || {
        metrics
            .gauge_vec(names::SCHEDULER_CIRCUIT_STATE, &["state"])
            .with(&["open"])
            .get()
            == 1
    })
    .await;

    let err = harness
        .handle
        .submit(
            harness.tenant,
            NodeName::new("web-9").unwrap(),
            StateId::v4(),
            5,
            Duration::from_secs(60),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        FluxError::SchedulerRejected {
            reason: RejectReason::CircuitOpen
        }
    ));
    teardown(harness).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expired_tasks_are_dropped_not_run() {
    let runner = Arc::new(RecordingRunner::new(Duration::from_millis(5)));
    let harness = start(runner.clone(), fast_config()).await;

    harness
        .handle
        .submit(
            harness.tenant,
            NodeName::new("web-01").unwrap(),
            StateId::v4(),
            5,
            Duration::ZERO,
        )
        .unwrap();

    let metrics = harness.metrics.clone();
    wait_for("deadline drop", Duration::from_secs(5), || {
        metrics
            .counter_vec(
                names::TASK_TIMEOUTS_TOTAL,
                &["state_id", "phase", "timeout_reason"],
            )
            .total()
            > 0
    })
    .await;
    assert_eq!(runner.runs.load(Ordering::SeqCst), 0);
    teardown(harness).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rehydration_enqueues_pending_states() {
    // Seed pending states before the scheduler starts.
    let metrics = MetricsRegistry::new();
    let store = Arc::new(MemoryStore::with_metrics(metrics.clone()));
    for i in 0..3 {
        store
            .upsert_state(DesiredState::new(
                TenantId::v4(),
                NodeName::new(format!("node-{i}")).unwrap(),
                "test -f /tmp/x",
                "touch /tmp/x",
                0,
            ))
            .await
            .unwrap();
    }

    let shutdown = CancellationToken::new();
    let election = ElectionConfig {
        lease_ttl: Duration::from_millis(90),
        ..ElectionConfig::new("replica-under-test")
    };
    let elector =
        LeaderElector::new(election, store.clone(), metrics.clone()).spawn(shutdown.clone());
    let runner = Arc::new(RecordingRunner::new(Duration::from_millis(5)));
    let mode = Arc::new(ModeSwitch::new(metrics.clone()));
    let handle = Scheduler::new(
        fast_config(),
        store.clone() as Arc<dyn Store>,
        runner.clone(),
        mode,
        metrics.clone(),
        elector.state(),
    )
    .spawn(shutdown.clone());

    let metrics_probe = metrics.clone();
    wait_for("rehydrated tasks", Duration::from_secs(5), || {
        metrics_probe.counter(names::TASK_SUCCESS_TOTAL).get() == 3
    })
    .await;
    assert_eq!(runner.runs.load(Ordering::SeqCst), 3);

    shutdown.cancel();
    handle.join().await;
    elector.join().await;
}
