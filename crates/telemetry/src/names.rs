//! Metric family names.
//!
//! These names are consumed by dashboards and alert rules; changing one is
//! a breaking change to the operational contract.

/// Tasks currently queued in the scheduler.
pub const SCHEDULER_QUEUE_DEPTH: &str = "flux_scheduler_queue_depth";
/// Active workers as a percentage of the concurrency limit.
pub const SCHEDULER_WORKER_SATURATION: &str = "flux_scheduler_worker_saturation";
/// Refused submissions, labeled by `reason`.
pub const SCHEDULER_REJECTIONS_TOTAL: &str = "flux_scheduler_rejections_total";
/// Circuit breaker state, labeled by `state` (1 = current state).
pub const SCHEDULER_CIRCUIT_STATE: &str = "flux_scheduler_circuit_state";
/// Wall-clock seconds per reconciliation task.
pub const TASK_RUNTIME_SECONDS: &str = "flux_task_runtime_seconds";
/// Task timeouts, labeled by `state_id`, `phase`, and `timeout_reason`.
pub const TASK_TIMEOUTS_TOTAL: &str = "flux_task_timeouts_total";
/// Tasks requeued for a later pass.
pub const TASK_RETRIES_TOTAL: &str = "flux_task_retries_total";
/// Tasks that reached a compliant terminal state.
pub const TASK_SUCCESS_TOTAL: &str = "flux_task_success_total";
/// Age of the oldest queued task, in seconds.
pub const INTENT_AGE_SECONDS: &str = "flux_intent_age_seconds";
/// 1 while this replica holds the leader lease.
pub const LEADER_STATUS: &str = "flux_leader_status";
/// Current leadership epoch, labeled by `node_id`.
pub const LEADER_EPOCH: &str = "flux_leader_epoch";
/// Leadership transitions, labeled by `node_id` and `event`.
pub const LEADER_TRANSITIONS_TOTAL: &str = "flux_leader_transitions_total";
/// Reconciliations aborted because the epoch moved mid-flight.
pub const RECONCILIATION_EPOCH_ABORT_TOTAL: &str = "flux_reconciliation_epoch_abort_total";
/// Successful versioned compare-and-swap writes.
pub const VERSIONED_WRITE_SUCCESS_TOTAL: &str = "flux_versioned_write_success_total";
/// Versioned writes refused on version mismatch.
pub const VERSIONED_WRITE_CONFLICT_TOTAL: &str = "flux_versioned_write_conflict_total";
/// Dropped event publishes, labeled by `event_type` and `reason`.
pub const EVENT_PUBLISH_FAILURES_TOTAL: &str = "flux_event_publish_failures_total";
/// HTTP 429s served, labeled by `endpoint`.
pub const API_RATE_LIMITED_TOTAL: &str = "flux_api_rate_limited_total";
/// Admission mode, labeled by `mode` (1 = current mode).
pub const RUNTIME_MODE: &str = "flux_runtime_mode";
/// Tasks unaccounted for across queue, active, and terminal sets,
/// labeled by `tenant`. Zero at steady state.
pub const INTEGRITY_SKEW_COUNT: &str = "flux_integrity_skew_count";
