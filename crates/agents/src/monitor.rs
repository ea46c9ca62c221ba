//! Agent liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flux_core::FluxResult;
use flux_coordination::LeaderState;
use flux_state::AgentStatus;
use flux_store::Store;
use flux_telemetry::{ControlEvent, EventBus};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Liveness monitor timing.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// How often the monitor scans.
    pub period: Duration,
    /// Heartbeat age beyond which an agent is considered dead.
    pub staleness_threshold: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(5),
            staleness_threshold: Duration::from_secs(10),
        }
    }
}

/// Marks agents offline when their heartbeats go stale.
///
/// Scans every tenant's agents on each tick. Only `active` agents are
/// eligible: `quarantined` agents are an operator decision the monitor
/// must not touch, and `offline` agents are already parked.
pub struct LivenessMonitor {
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    config: LivenessConfig,
}

impl LivenessMonitor {
    /// Create a monitor.
    pub fn new(store: Arc<dyn Store>, events: Arc<EventBus>, config: LivenessConfig) -> Self {
        Self {
            store,
            events,
            config,
        }
    }

    /// Run one scan. Returns the number of agents parked.
    pub async fn sweep(&self) -> FluxResult<usize> {
        let threshold = chrono::Duration::from_std(self.config.staleness_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(10));
        let now = Utc::now();
        let mut parked = 0;

        for mut agent in self.store.list_all_agents().await? {
            if agent.status != AgentStatus::Active || !agent.is_stale(threshold, now) {
                continue;
            }
            tracing::warn!(
                node = %agent.node,
                last_heartbeat = %agent.last_heartbeat,
                "agent heartbeat stale, marking offline"
            );
            agent.status = AgentStatus::Offline;
            let node = agent.node.clone();
            self.store.upsert_agent(agent).await?;
            self.events.emit(ControlEvent::AgentOffline { node, ts: now });
            parked += 1;
        }
        Ok(parked)
    }

    /// Spawn the periodic scan task. Scans only while `leader` reports
    /// leadership; stops when `shutdown` is cancelled.
    pub fn spawn(
        self,
        leader: watch::Receiver<LeaderState>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    () = tokio::time::sleep(self.config.period) => {
                        if !leader.borrow().is_leader {
                            continue;
                        }
                        if let Err(err) = self.sweep().await {
                            tracing::warn!(error = %err, "liveness sweep failed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_core::{NodeName, TenantId};
    use flux_state::Agent;
    use flux_store::MemoryStore;

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

    fn monitor(store: &Arc<MemoryStore>, events: &Arc<EventBus>) -> LivenessMonitor {
        LivenessMonitor::new(
            store.clone() as Arc<dyn Store>,
            events.clone(),
            LivenessConfig {
                period: Duration::from_millis(10),
                staleness_threshold: Duration::from_secs(10),
            },
        )
    }

    #[tokio::test]
    async fn fresh_agents_are_left_alone() {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(EventBus::new(16));
        let tenant = TenantId::v4();
        store.upsert_agent(make_agent(tenant, "web-03")).await.unwrap();

        let parked = monitor(&store, &events).sweep().await.unwrap();
        assert_eq!(parked, 0);
    }

    #[tokio::test]
    async fn stale_agents_are_parked_and_announced() {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(EventBus::new(16));
        let mut sub = events.subscribe();
        let tenant = TenantId::v4();

        let mut agent = make_agent(tenant, "web-03");
        agent.last_heartbeat = Utc::now() - chrono::Duration::seconds(60);
        let node = agent.node.clone();
        store.upsert_agent(agent).await.unwrap();

        let parked = monitor(&store, &events).sweep().await.unwrap();
        assert_eq!(parked, 1);

        let fetched = store.get_agent(tenant, &node).await.unwrap().unwrap();
        assert_eq!(fetched.status, AgentStatus::Offline);
        assert!(matches!(
            sub.try_recv(),
            Some(ControlEvent::AgentOffline { .. })
        ));
    }

    #[tokio::test]
    async fn quarantined_agents_are_not_touched() {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(EventBus::new(16));
        let tenant = TenantId::v4();

        let mut agent = make_agent(tenant, "web-03");
        agent.status = AgentStatus::Quarantined;
        agent.last_heartbeat = Utc::now() - chrono::Duration::seconds(60);
        let node = agent.node.clone();
        store.upsert_agent(agent).await.unwrap();

        let parked = monitor(&store, &events).sweep().await.unwrap();
        assert_eq!(parked, 0);
        let fetched = store.get_agent(tenant, &node).await.unwrap().unwrap();
        assert_eq!(fetched.status, AgentStatus::Quarantined);
    }

    #[tokio::test]
    async fn sweep_spans_tenants() {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(EventBus::new(16));

        for tenant in [TenantId::v4(), TenantId::v4()] {
            let mut agent = make_agent(tenant, "web-03");
            agent.last_heartbeat = Utc::now() - chrono::Duration::seconds(60);
            store.upsert_agent(agent).await.unwrap();
        }

        let parked = monitor(&store, &events).sweep().await.unwrap();
        assert_eq!(parked, 2);
    }

    #[tokio::test]
    async fn heartbeat_revival_after_parking() {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(EventBus::new(16));
        let tenant = TenantId::v4();

        let mut agent = make_agent(tenant, "web-03");
        agent.last_heartbeat = Utc::now() - chrono::Duration::seconds(60);
        let node = agent.node.clone();
        store.upsert_agent(agent).await.unwrap();

        monitor(&store, &events).sweep().await.unwrap();
        store
            .update_agent_heartbeat(tenant, &node, Utc::now())
            .await
            .unwrap();

        let fetched = store.get_agent(tenant, &node).await.unwrap().unwrap();
        assert_eq!(fetched.status, AgentStatus::Active);
    }
}
