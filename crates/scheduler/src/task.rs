//! Reconciliation tasks and the aged priority queue.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use flux_core::{NodeName, RequestId, StateId, TenantId};

/// One unit of scheduler work: reconcile one desired state.
///
/// Lives only inside the scheduler; nothing here is persisted. Recovery
/// after failover comes from rehydration, not from queue durability.
#[derive(Debug, Clone)]
pub struct ReconciliationTask {
    /// Request correlation id.
    pub req_id: RequestId,
    /// Owning tenant.
    pub tenant: TenantId,
    /// Target node.
    pub node: NodeName,
    /// The state to reconcile.
    pub state_id: StateId,
    /// Base priority, 0 (most urgent) to 10.
    pub priority: u8,
    /// When the task entered the scheduler.
    pub submitted_at: Instant,
    /// Drop the task if it has not started by this point.
    pub deadline: Instant,
    /// Leadership epoch the task was admitted under. Writes performed on
    /// its behalf are fenced against a newer epoch.
    pub admission_epoch: i64,
}

/// Priority ceiling: tasks submit in `0..=MAX_PRIORITY`.
pub const MAX_PRIORITY: u8 = 10;

impl ReconciliationTask {
    /// Create a task with the given base priority and time-to-live.
    #[must_use]
    pub fn new(
        tenant: TenantId,
        node: NodeName,
        state_id: StateId,
        priority: u8,
        ttl: Duration,
        admission_epoch: i64,
    ) -> Self {
        let now = Instant::now();
        Self {
            req_id: RequestId::v4(),
            tenant,
            node,
            state_id,
            priority: priority.min(MAX_PRIORITY),
            submitted_at: now,
            deadline: now + ttl,
            admission_epoch,
        }
    }

    /// Effective priority at `now`: `base - wait_seconds / aging_factor`.
    /// Lower is more urgent; a P10 task waiting `10 x aging_factor`
    /// seconds has aged to P0.
    #[must_use]
    pub fn effective_priority(&self, now: Instant, aging_factor: Duration) -> f64 {
        let waited = now.saturating_duration_since(self.submitted_at).as_secs_f64();
        f64::from(self.priority) - waited / aging_factor.as_secs_f64()
    }

    /// Returns `true` once the deadline has passed.
    #[must_use]
    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// Heap entry carrying a precomputed sort key.
///
/// Two queued tasks age at the same rate, so their relative order never
/// changes after submission: `effective(a) - effective(b)` is constant.
/// That lets the queue sort once at insert on
/// `base + submit_offset / aging_factor` instead of re-keying the heap
/// every tick.
struct QueuedTask {
    key: f64,
    seq: u64,
    task: ReconciliationTask,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the smallest key (most
        // urgent) pops first. Ties break on submission order.
        other
            .key
            .total_cmp(&self.key)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-queue over effective priority with earliest-submit tie-breaking.
pub struct PriorityQueue {
    heap: BinaryHeap<QueuedTask>,
    origin: Instant,
    aging_factor: Duration,
    seq: u64,
}

impl PriorityQueue {
    /// Create a queue with the given aging factor.
    #[must_use]
    pub fn new(aging_factor: Duration) -> Self {
        Self {
            heap: BinaryHeap::new(),
            origin: Instant::now(),
            aging_factor,
            seq: 0,
        }
    }

    /// Insert a task.
    pub fn push(&mut self, task: ReconciliationTask) {
        // Signed offset from the queue origin: a task that already waited
        // before entering the queue keeps the urgency it earned.
        let offset = if task.submitted_at >= self.origin {
            task.submitted_at.duration_since(self.origin).as_secs_f64()
        } else {
            -self.origin.duration_since(task.submitted_at).as_secs_f64()
        };
        let key = f64::from(task.priority) + offset / self.aging_factor.as_secs_f64();
        self.seq += 1;
        self.heap.push(QueuedTask {
            key,
            seq: self.seq,
            task,
        });
    }

    /// Remove and return the most urgent task.
    pub fn pop(&mut self) -> Option<ReconciliationTask> {
        self.heap.pop().map(|entry| entry.task)
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Submission time of the oldest queued task, if any.
    #[must_use]
    pub fn oldest_submission(&self) -> Option<Instant> {
        self.heap.iter().map(|entry| entry.task.submitted_at).min()
    }
}
