//! Agent registration and heartbeat operations.

use std::sync::Arc;

use chrono::Utc;
use flux_core::{FluxResult, NodeName, TenantId};
use flux_state::{Agent, AgentStatus, AgentTier};
use flux_store::Store;
use serde::{Deserialize, Serialize};

/// Registration payload an agent sends when it comes up.
///
/// Unknown metadata fields are carried through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    /// Tenant-unique name the agent chose for itself.
    pub node_id: NodeName,
    /// Self-reported hostname.
    pub hostname: String,
    /// Address the dispatcher connects to.
    pub ip_address: String,
    /// Execute endpoint port.
    pub port: u16,
    /// Agent software version.
    pub version: String,
    /// Requested service tier.
    #[serde(default)]
    pub tier: AgentTier,
    /// Free-form agent-supplied metadata.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Registry operations over the store.
pub struct AgentRegistry {
    store: Arc<dyn Store>,
}

impl AgentRegistry {
    /// Create a registry over the given store.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Register (or re-register) an agent.
    ///
    /// A fresh registration comes up `active`. Re-registration of a
    /// quarantined agent keeps the quarantine: only an operator lifts it.
    pub async fn register(
        &self,
        tenant: TenantId,
        registration: AgentRegistration,
    ) -> FluxResult<Agent> {
        let mut agent = Agent::new(
            tenant,
            registration.node_id.clone(),
            registration.hostname,
            registration.ip_address,
            registration.port,
            registration.version,
        );
        agent.tier = registration.tier;
        agent.metadata = registration.metadata;

        if let Some(existing) = self.store.get_agent(tenant, &registration.node_id).await? {
            if existing.status == AgentStatus::Quarantined {
                agent.status = AgentStatus::Quarantined;
            }
        }

        self.store.upsert_agent(agent.clone()).await?;
        tracing::info!(
            node = %agent.node,
            tier = %agent.tier,
            status = %agent.status,
            "agent registered"
        );
        Ok(agent)
    }

    /// Record a heartbeat. Revives `offline` agents; unknown agents fail
    /// with `NotFound` so they know to re-register.
    pub async fn heartbeat(&self, tenant: TenantId, node: &NodeName) -> FluxResult<()> {
        self.store
            .update_agent_heartbeat(tenant, node, Utc::now())
            .await
    }

    /// Fetch one agent.
    pub async fn get(&self, tenant: TenantId, node: &NodeName) -> FluxResult<Option<Agent>> {
        self.store.get_agent(tenant, node).await
    }

    /// List a tenant's agents.
    pub async fn list(&self, tenant: TenantId) -> FluxResult<Vec<Agent>> {
        self.store.list_agents(tenant).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_store::MemoryStore;

    fn registration(name: &str) -> AgentRegistration {
        AgentRegistration {
            node_id: NodeName::new(name).unwrap(),
            hostname: format!("{name}.internal"),
            ip_address: "10.0.0.7".into(),
            port: 7420,
            version: "1.4.2".into(),
            tier: AgentTier::Standard,
            metadata: serde_json::Map::new(),
        }
    }

    fn registry(store: &Arc<MemoryStore>) -> AgentRegistry {
        AgentRegistry::new(store.clone() as Arc<dyn Store>)
    }

    #[tokio::test]
    async fn register_creates_active_agent() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let tenant = TenantId::v4();

        let agent = registry.register(tenant, registration("web-03")).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Active);

        let fetched = registry
            .get(tenant, &NodeName::new("web-03").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.hostname, "web-03.internal");
    }

    #[tokio::test]
    async fn reregistration_updates_attributes() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let tenant = TenantId::v4();

        registry.register(tenant, registration("web-03")).await.unwrap();
        let mut updated = registration("web-03");
        updated.version = "1.5.0".into();
        updated.port = 7421;
        registry.register(tenant, updated).await.unwrap();

        let fetched = registry
            .get(tenant, &NodeName::new("web-03").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.version, "1.5.0");
        assert_eq!(fetched.port, 7421);
    }

    #[tokio::test]
    async fn reregistration_keeps_quarantine() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let tenant = TenantId::v4();

        let mut agent = registry.register(tenant, registration("web-03")).await.unwrap();
        agent.status = AgentStatus::Quarantined;
        store.upsert_agent(agent).await.unwrap();

        let back = registry.register(tenant, registration("web-03")).await.unwrap();
        assert_eq!(back.status, AgentStatus::Quarantined);
    }

    #[tokio::test]
    async fn heartbeat_unknown_agent_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let err = registry
            .heartbeat(TenantId::v4(), &NodeName::new("ghost").unwrap())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn registration_payload_tolerates_unknown_fields() {
        let json = serde_json::json!({
            "node_id": "web-03",
            "hostname": "web-03.internal",
            "ip_address": "10.0.0.7",
            "port": 7420,
            "version": "1.4.2",
            "tier": "premium",
            "metadata": {"zone": "eu-west-1b"},
            "something_new": true
        });
        let reg: AgentRegistration = serde_json::from_value(json).unwrap();
        assert_eq!(reg.tier, AgentTier::Premium);
        assert_eq!(reg.metadata["zone"], serde_json::json!("eu-west-1b"));
    }
}
