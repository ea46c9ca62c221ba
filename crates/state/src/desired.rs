//! Desired state declarations.

use chrono::{DateTime, Utc};
use flux_core::{NodeName, StateId, TenantId};
use serde::{Deserialize, Serialize};

/// Reconciliation status of a desired state.
///
/// Transitions are driven by the reconciler and serialized by version
/// compare-and-swap at the store, not by a local transition table: any
/// status may re-enter `pending` on operator update, and a `compliant`
/// revisit is an idempotent no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateStatus {
    /// Declared, not yet checked.
    Pending,
    /// Check ran and disagreed with the declaration.
    Drifted,
    /// Apply command is in flight.
    Applying,
    /// Check agrees with the declaration.
    Compliant,
    /// Reconciliation gave up; see `last_error`.
    Failed,
}

impl StateStatus {
    /// Returns `true` if this status ends a reconciliation pass.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Compliant | Self::Failed)
    }

    /// Returns `true` if the leader should pick this state up on
    /// rehydration after failover.
    #[must_use]
    pub fn needs_reconciliation(&self) -> bool {
        matches!(self, Self::Pending | Self::Drifted)
    }
}

impl std::fmt::Display for StateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Drifted => write!(f, "drifted"),
            Self::Applying => write!(f, "applying"),
            Self::Compliant => write!(f, "compliant"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A declaration that running `check_cmd` on `node` should exit with
/// `desired_exit_code`; if not, `apply_cmd` is run to make it so.
///
/// `version` is the optimistic-concurrency token: every status write goes
/// through compare-and-swap on `(state_id, expected_version)` and bumps it
/// by exactly one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesiredState {
    /// Unique identifier.
    pub state_id: StateId,
    /// Owning tenant.
    pub tenant: TenantId,
    /// Target agent.
    pub node: NodeName,
    /// Probe command; its exit code is compared to `desired_exit_code`.
    pub check_cmd: String,
    /// Remediation command run when the check disagrees.
    pub apply_cmd: String,
    /// Exit code the check must produce for compliance.
    pub desired_exit_code: i32,
    /// Monotonic version, bumped on every write.
    pub version: u64,
    /// Current reconciliation status.
    pub status: StateStatus,
    /// When the check last ran.
    #[serde(default)]
    pub last_checked: Option<DateTime<Utc>>,
    /// Failure detail from the most recent failed pass.
    #[serde(default)]
    pub last_error: Option<String>,
    /// When the declaration was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

impl DesiredState {
    /// Create a new pending declaration at version zero. The first store
    /// upsert bumps it to one.
    #[must_use]
    pub fn new(
        tenant: TenantId,
        node: NodeName,
        check_cmd: impl Into<String>,
        apply_cmd: impl Into<String>,
        desired_exit_code: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            state_id: StateId::v4(),
            tenant,
            node,
            check_cmd: check_cmd.into(),
            apply_cmd: apply_cmd.into(),
            desired_exit_code,
            version: 0,
            status: StateStatus::Pending,
            last_checked: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns `true` if `exit_code` satisfies the declaration.
    #[must_use]
    pub fn is_satisfied_by(&self, exit_code: i32) -> bool {
        exit_code == self.desired_exit_code
    }
}
