#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Flux Scheduler
//!
//! The admission and drain layer between the API surface and the
//! reconciler: a bounded priority queue with aging, per-node and
//! per-tenant isolation, admission modes, a consecutive-failure circuit
//! breaker, and the worker pool that drives the [`TaskRunner`] port.
//!
//! The queue, busy set, and rolling failure windows are mutated only by
//! the scheduler's own task family; submissions cross over through a
//! bounded channel and completions come back the same way.

pub mod breaker;
pub mod mode;
pub mod scheduler;
pub mod task;
pub mod window;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use mode::{AdmissionMode, ModeSwitch};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle, TaskDisposition, TaskRunner};
pub use task::{PriorityQueue, ReconciliationTask};
pub use window::FailureWindow;
