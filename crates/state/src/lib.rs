#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Flux State
//!
//! Durable domain records for the FluxForge control plane: [`Agent`],
//! [`Job`], and [`DesiredState`], their status machines, and the stable
//! shard hash that partitions global scans across replicas.
//!
//! These types are plain data. Persistence, versioned compare-and-swap,
//! and concurrency live behind the store port; the reconciliation state
//! machine itself lives in the store, not in suspended call stacks.

pub mod agent;
pub mod desired;
pub mod job;
pub mod shard;

pub use agent::{Agent, AgentStatus, AgentTier};
pub use desired::{DesiredState, StateStatus};
pub use job::{Job, JobStatus, validate_job_transition};
pub use shard::{fnv1a32, owns_shard};
