//! Application root: owns every component and wires them together.
//!
//! There are no global singletons; the registry, event bus, and store
//! flow into components through constructors, and tests build their own
//! root against the same wiring.

use std::sync::Arc;

use chrono::Utc;
use flux_agents::{AgentRegistry, LivenessConfig, LivenessMonitor};
use flux_core::FluxResult;
use flux_coordination::{ElectionConfig, LeaderElector, LeaderHandle, LeaderState, LockJanitor};
use flux_idempotency::IdempotencyGate;
use flux_reconciler::{AgentTransport, HttpTransport, JobDispatcher, Reconciler, ReconcilerConfig};
use flux_scheduler::{ModeSwitch, Scheduler, SchedulerConfig, SchedulerHandle};
use flux_store::{MemoryStore, Store};
use flux_telemetry::{BroadcastSink, ControlEvent, EventBus, MetricsRegistry};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::ratelimit::TokenBucket;
use crate::config::ControldConfig;

/// Everything a running replica consists of.
pub struct AppRoot {
    /// Daemon configuration.
    pub config: ControldConfig,
    /// The store driver. Concrete so tests can seed it directly.
    pub store: Arc<MemoryStore>,
    /// Process-local metrics.
    pub metrics: MetricsRegistry,
    /// Lifecycle event bus.
    pub events: Arc<EventBus>,
    /// Agent registration and heartbeat operations.
    pub registry: AgentRegistry,
    /// Idempotent-request gate.
    pub gate: IdempotencyGate,
    /// Scheduler submission handle.
    pub scheduler: SchedulerHandle,
    /// Leadership state of this replica.
    pub leader: watch::Receiver<LeaderState>,
    /// Heartbeat storm protection.
    pub heartbeat_limiter: TokenBucket,
    /// Manual-reconcile storm protection.
    pub reconcile_limiter: TokenBucket,
    shutdown: CancellationToken,
    elector: LeaderHandle,
    janitors: Vec<JoinHandle<()>>,
}

impl AppRoot {
    /// Build and start a replica with the default HTTP transport.
    pub fn start(config: ControldConfig) -> FluxResult<Self> {
        Self::start_with_transport(config, Arc::new(HttpTransport::new()))
    }

    /// Build and start a replica with a custom agent transport (tests
    /// plug a simulated agent in here).
    pub fn start_with_transport(
        config: ControldConfig,
        transport: Arc<dyn AgentTransport>,
    ) -> FluxResult<Self> {
        config.validate()?;
        let election = ElectionConfig {
            lease_ttl: config.lease_ttl,
            ..ElectionConfig::new(config.node_id.clone())
        };
        election.validate()?;
        let scheduler_config = SchedulerConfig {
            max_concurrency: config.max_concurrency,
            queue_capacity: config.queue_capacity,
            shard_index: config.shard_index,
            shard_count: config.shard_count,
            ..SchedulerConfig::default()
        };
        scheduler_config.validate()?;

        let shutdown = CancellationToken::new();
        let metrics = MetricsRegistry::new();
        let store = Arc::new(MemoryStore::with_metrics(metrics.clone()));
        let events = Arc::new(EventBus::new(256));

        let elector = LeaderElector::new(
            election,
            store.clone() as Arc<dyn Store>,
            metrics.clone(),
        )
        .spawn(shutdown.clone());
        let leader = elector.state();

        spawn_leadership_announcer(leader.clone(), events.clone(), shutdown.clone());

        let dispatcher = JobDispatcher::new(store.clone() as Arc<dyn Store>, transport);
        let reconciler = Arc::new(Reconciler::new(
            store.clone() as Arc<dyn Store>,
            dispatcher,
            Arc::new(BroadcastSink::new(events.clone())),
            metrics.clone(),
            ReconcilerConfig {
                max_task_runtime: config.max_task_runtime,
                shadow_mode: config.shadow_mode,
                ..ReconcilerConfig::default()
            },
        ));

        let mode = Arc::new(ModeSwitch::new(metrics.clone()));
        let scheduler = Scheduler::new(
            scheduler_config,
            store.clone() as Arc<dyn Store>,
            reconciler,
            mode,
            metrics.clone(),
            leader.clone(),
        )
        .spawn(shutdown.clone());

        let janitors = vec![
            LockJanitor::new(
                store.clone() as Arc<dyn Store>,
                "leader",
                LockJanitor::DEFAULT_PERIOD,
            )
            .spawn(leader.clone(), shutdown.clone()),
            LivenessMonitor::new(
                store.clone() as Arc<dyn Store>,
                events.clone(),
                LivenessConfig {
                    period: config.liveness_period,
                    staleness_threshold: config.liveness_threshold,
                },
            )
            .spawn(leader.clone(), shutdown.clone()),
        ];

        let registry = AgentRegistry::new(store.clone() as Arc<dyn Store>);
        let gate = IdempotencyGate::new(store.clone() as Arc<dyn Store>);
        let heartbeat_limiter =
            TokenBucket::new(config.heartbeat_burst as f64, config.heartbeat_rps);
        let reconcile_limiter =
            TokenBucket::new(config.reconcile_burst as f64, config.reconcile_rps);

        Ok(Self {
            config,
            store,
            metrics,
            events,
            registry,
            gate,
            scheduler,
            leader,
            heartbeat_limiter,
            reconcile_limiter,
            shutdown,
            elector,
            janitors,
        })
    }

    /// The shutdown token shared by every component.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop every component and wait for them.
    pub async fn stop(self) {
        self.shutdown.cancel();
        self.scheduler.join().await;
        self.elector.join().await;
        for janitor in self.janitors {
            let _ = janitor.await;
        }
    }
}

/// Mirror leadership transitions onto the event bus for subscribers.
fn spawn_leadership_announcer(
    mut leader: watch::Receiver<LeaderState>,
    events: Arc<EventBus>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut last_is_leader = leader.borrow().is_leader;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return,
                changed = leader.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            let state = leader.borrow().clone();
            if state.is_leader != last_is_leader {
                last_is_leader = state.is_leader;
                events.emit(ControlEvent::LeadershipChanged {
                    node: state.node.clone(),
                    is_leader: state.is_leader,
                    epoch: state.epoch,
                    ts: Utc::now(),
                });
            }
        }
    });
}
