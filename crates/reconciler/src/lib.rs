#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Flux Reconciler
//!
//! The reconciliation engine: drives one `DesiredState` through
//! check → apply → verify against its agent, with per-node
//! single-flight, a hard task deadline, and epoch-fenced versioned
//! writes. Implements the scheduler's `TaskRunner` port, which keeps the
//! scheduler → reconciler dependency one-directional.
//!
//! The state machine lives in the store, not in suspended call stacks:
//! each invocation is a straight-line pass that loads the state, runs
//! jobs, and compare-and-swaps status transitions. A lost race or a lost
//! leadership term simply ends the pass; the next pass re-reads.

pub mod dispatcher;
pub mod reconciler;

pub use dispatcher::{AgentTransport, HttpTransport, JobDispatcher};
pub use reconciler::{Reconciler, ReconcilerConfig};
