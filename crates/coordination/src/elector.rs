//! Leader election loop.
//!
//! Every replica runs one [`LeaderElector`]. The elector serializes
//! election through the store's lease primitive and publishes a totally
//! ordered sequence of epochs: the durable epoch is bumped exactly once
//! per successful acquisition, never on renewals.

use std::sync::Arc;
use std::time::Duration;

use flux_core::FluxResult;
use flux_store::Store;
use flux_telemetry::{MetricsRegistry, names};
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::coordinator::LeaseCoordinator;

/// Validated election configuration.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Lease key the replicas compete for.
    pub lease_key: String,
    /// This replica's identity, written into the lease value.
    pub node: String,
    /// Lease TTL. Renewals run at TTL/3; follower polls at TTL/3 with
    /// jitter. The two-leader window under clock skew is bounded by
    /// skew < TTL/3, which is a stated assumption, not a guarantee.
    pub lease_ttl: Duration,
    /// Durable epoch resource name.
    pub epoch_resource: String,
}

impl ElectionConfig {
    /// Config with the given replica identity and default timings.
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            lease_key: "leader:control-plane".to_owned(),
            node: node.into(),
            lease_ttl: Duration::from_secs(30),
            epoch_resource: "leader".to_owned(),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> FluxResult<()> {
        if self.node.is_empty() {
            return Err(flux_core::FluxError::InvalidInput(
                "election node identity must not be empty".into(),
            ));
        }
        if self.lease_ttl < Duration::from_millis(3) {
            return Err(flux_core::FluxError::InvalidInput(
                "lease_ttl too small to subdivide into renew intervals".into(),
            ));
        }
        Ok(())
    }

    fn renew_interval(&self) -> Duration {
        self.lease_ttl / 3
    }
}

/// Published leadership state of one replica.
#[derive(Debug, Clone)]
pub struct LeaderState {
    /// Whether this replica currently holds the lease.
    pub is_leader: bool,
    /// Epoch minted at the most recent acquisition (0 before the first).
    pub epoch: i64,
    /// Replica identity.
    pub node: String,
    /// Number of leadership transitions observed by this replica.
    pub transitions: u64,
    term: CancellationToken,
}

impl LeaderState {
    fn follower(node: String, epoch: i64, transitions: u64) -> Self {
        let term = CancellationToken::new();
        term.cancel();
        Self {
            is_leader: false,
            epoch,
            node,
            transitions,
            term,
        }
    }

    /// Token cancelled when this leadership term ends. For follower
    /// states the token is already cancelled.
    #[must_use]
    pub fn term_token(&self) -> CancellationToken {
        self.term.clone()
    }
}

/// Handle to a running elector.
pub struct LeaderHandle {
    state: watch::Receiver<LeaderState>,
    task: JoinHandle<()>,
}

impl LeaderHandle {
    /// Watch channel carrying the replica's leadership state.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<LeaderState> {
        self.state.clone()
    }

    /// Snapshot: is this replica currently the leader?
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.state.borrow().is_leader
    }

    /// Wait for the election task to finish (after shutdown).
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// The election loop.
pub struct LeaderElector {
    config: ElectionConfig,
    store: Arc<dyn Store>,
    metrics: MetricsRegistry,
}

impl LeaderElector {
    /// Create an elector. Call [`spawn`](Self::spawn) to start it.
    pub fn new(config: ElectionConfig, store: Arc<dyn Store>, metrics: MetricsRegistry) -> Self {
        Self {
            config,
            store,
            metrics,
        }
    }

    /// Start the election loop. It runs until `shutdown` is cancelled,
    /// releasing the lease on the way out if held.
    pub fn spawn(self, shutdown: CancellationToken) -> LeaderHandle {
        let (tx, rx) = watch::channel(LeaderState::follower(self.config.node.clone(), 0, 0));
        let task = tokio::spawn(self.run(tx, shutdown));
        LeaderHandle { state: rx, task }
    }

    async fn run(self, tx: watch::Sender<LeaderState>, shutdown: CancellationToken) {
        let coordinator = LeaseCoordinator::new(
            self.store.clone(),
            self.config.lease_key.clone(),
            self.config.node.clone(),
            self.config.lease_ttl,
        );
        let mut transitions: u64 = 0;
        let mut last_epoch: i64 = 0;

        loop {
            if shutdown.is_cancelled() {
                return;
            }

            match coordinator.acquire().await {
                Ok(true) => {
                    let epoch = match self.store.increment_durable_epoch(&self.config.epoch_resource).await {
                        Ok(epoch) => epoch,
                        Err(err) => {
                            // Holding a lease without an epoch would defeat
                            // fencing. Back out and retry from follower.
                            tracing::warn!(error = %err, "epoch mint failed, releasing lease");
                            let _ = coordinator.release().await;
                            self.follower_wait(&shutdown).await;
                            continue;
                        }
                    };
                    last_epoch = epoch;
                    transitions += 1;
                    let term = shutdown.child_token();

                    tracing::info!(
                        node = %self.config.node,
                        epoch,
                        transitions,
                        "leadership acquired"
                    );
                    self.record_transition(epoch, true, "elected");
                    let _ = tx.send(LeaderState {
                        is_leader: true,
                        epoch,
                        node: self.config.node.clone(),
                        transitions,
                        term: term.clone(),
                    });

                    let lost_to_shutdown = self.lead(&coordinator, &shutdown).await;

                    // Demotion: the term token is cancelled and the
                    // follower state published before the next acquire
                    // attempt can start.
                    term.cancel();
                    transitions += 1;
                    let event = if lost_to_shutdown { "shutdown" } else { "demoted" };
                    tracing::warn!(
                        node = %self.config.node,
                        epoch,
                        event,
                        "leadership lost"
                    );
                    self.record_transition(epoch, false, event);
                    let _ = tx.send(LeaderState::follower(
                        self.config.node.clone(),
                        last_epoch,
                        transitions,
                    ));

                    if lost_to_shutdown {
                        let _ = coordinator.release().await;
                        return;
                    }
                }
                Ok(false) => self.follower_wait(&shutdown).await,
                Err(err) => {
                    tracing::debug!(error = %err, "lease acquire failed");
                    self.follower_wait(&shutdown).await;
                }
            }
        }
    }

    /// Renew until renewal fails or shutdown. Returns `true` if the term
    /// ended because of shutdown rather than a lost lease.
    async fn lead(&self, coordinator: &LeaseCoordinator, shutdown: &CancellationToken) -> bool {
        let interval = self.config.renew_interval();
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return true,
                () = tokio::time::sleep(interval) => {
                    match coordinator.renew().await {
                        Ok(true) => {}
                        Ok(false) => return false,
                        Err(err) => {
                            // A store error is indistinguishable from a
                            // lost lease; demote immediately.
                            tracing::warn!(error = %err, "lease renew errored");
                            return false;
                        }
                    }
                }
            }
        }
    }

    async fn follower_wait(&self, shutdown: &CancellationToken) {
        let jitter = rand::rng().random_range(0.8..1.2);
        let wait = self.config.renew_interval().mul_f64(jitter);
        tokio::select! {
            () = shutdown.cancelled() => {}
            () = tokio::time::sleep(wait) => {}
        }
    }

    fn record_transition(&self, epoch: i64, is_leader: bool, event: &str) {
        self.metrics
            .gauge(names::LEADER_STATUS)
            .set(i64::from(is_leader));
        self.metrics
            .gauge_vec(names::LEADER_EPOCH, &["node_id"])
            .with(&[&self.config.node])
            .set(epoch);
        self.metrics
            .counter_vec(names::LEADER_TRANSITIONS_TOTAL, &["node_id", "event"])
            .with(&[&self.config.node, event])
            .inc();
    }
}
