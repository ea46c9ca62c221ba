//! Agent registration records.

use chrono::{DateTime, Duration, Utc};
use flux_core::{NodeName, TenantId};
use serde::{Deserialize, Serialize};

/// Service tier an agent is enrolled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentTier {
    /// Shared-capacity default tier.
    Standard,
    /// Higher scheduling priority.
    Premium,
    /// Reserved capacity.
    Dedicated,
}

impl Default for AgentTier {
    fn default() -> Self {
        Self::Standard
    }
}

impl std::fmt::Display for AgentTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::Premium => write!(f, "premium"),
            Self::Dedicated => write!(f, "dedicated"),
        }
    }
}

/// Liveness status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Heartbeating and eligible for dispatch.
    Active,
    /// Heartbeat went stale; the liveness monitor parked it.
    Offline,
    /// Manually fenced off by an operator. The monitor leaves it alone.
    Quarantined,
}

impl AgentStatus {
    /// Returns `true` if jobs may be dispatched to this agent.
    #[must_use]
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Offline => write!(f, "offline"),
            Self::Quarantined => write!(f, "quarantined"),
        }
    }
}

/// A remote execution node owned by a tenant.
///
/// Identified by `(tenant, node)`. Created by registration upsert, mutated
/// by heartbeats and the liveness monitor; never deleted by the core
/// (going dark only flips `status` to [`AgentStatus::Offline`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Owning tenant.
    pub tenant: TenantId,
    /// Tenant-unique node name, chosen by the agent.
    pub node: NodeName,
    /// Self-reported hostname.
    pub hostname: String,
    /// Address the dispatcher connects to.
    pub ip_address: String,
    /// Port the agent's execute endpoint listens on.
    pub port: u16,
    /// Agent software version.
    pub version: String,
    /// Service tier.
    #[serde(default)]
    pub tier: AgentTier,
    /// Liveness status.
    pub status: AgentStatus,
    /// Last heartbeat receipt.
    pub last_heartbeat: DateTime<Utc>,
    /// Free-form agent-supplied metadata. Unknown fields are tolerated on
    /// ingress and preserved on egress.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// When the record was first created.
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    /// Create a freshly registered, active agent.
    #[must_use]
    pub fn new(
        tenant: TenantId,
        node: NodeName,
        hostname: impl Into<String>,
        ip_address: impl Into<String>,
        port: u16,
        version: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            tenant,
            node,
            hostname: hostname.into(),
            ip_address: ip_address.into(),
            port,
            version: version.into(),
            tier: AgentTier::Standard,
            status: AgentStatus::Active,
            last_heartbeat: now,
            metadata: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// The agent's execute endpoint.
    #[must_use]
    pub fn execute_url(&self) -> String {
        format!("http://{}:{}/execute", self.ip_address, self.port)
    }

    /// Returns `true` if the last heartbeat is older than `threshold`
    /// relative to `now`.
    #[must_use]
    pub fn is_stale(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        now - self.last_heartbeat > threshold
    }
}
