//! Error types shared across the control plane.
//!
//! Every component returns `Result<_, FluxError>` at its public seams.
//! Drivers and collaborators map their internal failures into these
//! variants so callers can make retry and surfacing decisions without
//! inspecting error strings.

use std::time::Duration;

/// Result alias used throughout the workspace.
pub type FluxResult<T> = Result<T, FluxError>;

/// Reason a task submission was refused by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// This replica is not the leader.
    NotLeader,
    /// Admission mode is `drain` or `freeze`.
    ModeClosed,
    /// The circuit breaker is open.
    CircuitOpen,
    /// The queue is at capacity.
    QueueFull,
}

impl RejectReason {
    /// Stable label value for metrics and responses.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotLeader => "not_leader",
            Self::ModeClosed => "mode_closed",
            Self::CircuitOpen => "circuit_open",
            Self::QueueFull => "queue_full",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error type for all control-plane operations.
///
/// Distinguishes retryable failures (transport, timeout, busy) from
/// permanent ones (not found, invalid input, conflict) so loops can apply
/// retry policy uniformly.
#[derive(Debug, thiserror::Error)]
pub enum FluxError {
    /// Entity not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity (e.g. "Agent", "DesiredState").
        entity: String,
        /// Identifier that was looked up.
        id: String,
    },

    /// A request payload or parameter failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Missing or unusable tenant identity.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Optimistic concurrency conflict on a versioned write.
    #[error("{entity} {id}: expected version {expected_version}, got {actual_version}")]
    Conflict {
        /// Kind of entity.
        entity: String,
        /// Identifier of the conflicting entity.
        id: String,
        /// Version the caller expected.
        expected_version: u64,
        /// Version currently stored.
        actual_version: u64,
    },

    /// A single-flight slot is already held for this node.
    #[error("node {node} already has a reconciliation in flight")]
    Busy {
        /// The node whose slot is held.
        node: String,
    },

    /// A rate limit was exhausted.
    #[error("rate limited")]
    RateLimited {
        /// Suggested wait before retrying.
        retry_after: Option<Duration>,
    },

    /// The scheduler refused a task submission.
    #[error("scheduler rejected: {reason}")]
    SchedulerRejected {
        /// Why the submission was refused.
        reason: RejectReason,
    },

    /// Operation exceeded its deadline.
    #[error("timeout: {operation} after {duration:?}")]
    Timeout {
        /// Name of the operation that timed out.
        operation: String,
        /// How long was waited before giving up.
        duration: Duration,
    },

    /// The operation was cancelled (leadership loss or shutdown).
    #[error("cancelled: {reason}")]
    Cancelled {
        /// Why the operation was abandoned.
        reason: String,
    },

    /// Downstream I/O failure (store backend, agent endpoint).
    #[error("transport error: {0}")]
    Transport(String),

    /// Invariant violation. Never auto-recovered; a human intervenes.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl FluxError {
    /// Convenience constructor for [`FluxError::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`FluxError::Conflict`].
    pub fn conflict(
        entity: impl Into<String>,
        id: impl ToString,
        expected: u64,
        actual: u64,
    ) -> Self {
        Self::Conflict {
            entity: entity.into(),
            id: id.to_string(),
            expected_version: expected,
            actual_version: actual,
        }
    }

    /// Convenience constructor for [`FluxError::Busy`].
    pub fn busy(node: impl ToString) -> Self {
        Self::Busy {
            node: node.to_string(),
        }
    }

    /// Convenience constructor for [`FluxError::Timeout`].
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Convenience constructor for [`FluxError::Cancelled`].
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for [`FluxError::SchedulerRejected`].
    #[must_use]
    pub fn rejected(reason: RejectReason) -> Self {
        Self::SchedulerRejected { reason }
    }

    /// Returns `true` for transient errors that the caller may retry.
    ///
    /// `Busy` counts: the in-flight run covers the caller's intent and the
    /// next scheduler pass re-reads fresh state.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout { .. } | Self::Busy { .. } | Self::RateLimited { .. }
        )
    }

    /// Returns `true` if this error indicates a version-CAS conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns `true` if this error indicates a missing entity.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for FluxError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidInput(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // ── Construction ────────────────────────────────────────────────────

    #[test]
    fn not_found_convenience() {
        let err = FluxError::not_found("Agent", "web-03");
        match &err {
            FluxError::NotFound { entity, id } => {
                assert_eq!(entity, "Agent");
                assert_eq!(id, "web-03");
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn conflict_convenience() {
        let err = FluxError::conflict("DesiredState", "s-1", 3, 5);
        match &err {
            FluxError::Conflict {
                expected_version,
                actual_version,
                ..
            } => {
                assert_eq!(*expected_version, 3);
                assert_eq!(*actual_version, 5);
            }
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    // ── Classification ──────────────────────────────────────────────────

    #[test]
    fn transport_and_timeout_are_retryable() {
        assert!(FluxError::Transport("refused".into()).is_retryable());
        assert!(FluxError::timeout("dispatch", Duration::from_secs(5)).is_retryable());
    }

    #[test]
    fn busy_is_retryable() {
        assert!(FluxError::busy("web-03").is_retryable());
    }

    #[test]
    fn conflict_is_not_retryable() {
        let err = FluxError::conflict("DesiredState", "s-1", 1, 2);
        assert!(!err.is_retryable());
        assert!(err.is_conflict());
    }

    #[test]
    fn fatal_is_not_retryable() {
        assert!(!FluxError::Fatal("two leaders".into()).is_retryable());
    }

    #[test]
    fn cancelled_is_not_retryable() {
        assert!(!FluxError::cancelled("leadership lost").is_retryable());
    }

    // ── Display ─────────────────────────────────────────────────────────

    #[test]
    fn display_not_found() {
        let err = FluxError::not_found("Agent", "web-03");
        assert_eq!(err.to_string(), "Agent not found: web-03");
    }

    #[test]
    fn display_conflict() {
        let err = FluxError::conflict("DesiredState", "s-1", 2, 4);
        assert_eq!(
            err.to_string(),
            "DesiredState s-1: expected version 2, got 4"
        );
    }

    #[test]
    fn display_scheduler_rejected() {
        let err = FluxError::rejected(RejectReason::CircuitOpen);
        assert_eq!(err.to_string(), "scheduler rejected: circuit_open");
    }

    #[test]
    fn reject_reason_labels_are_stable() {
        assert_eq!(RejectReason::NotLeader.as_str(), "not_leader");
        assert_eq!(RejectReason::ModeClosed.as_str(), "mode_closed");
        assert_eq!(RejectReason::CircuitOpen.as_str(), "circuit_open");
        assert_eq!(RejectReason::QueueFull.as_str(), "queue_full");
    }

    #[test]
    fn reject_reason_serde_uses_snake_case() {
        let json = serde_json::to_string(&RejectReason::QueueFull).unwrap();
        assert_eq!(json, "\"queue_full\"");
    }
}
