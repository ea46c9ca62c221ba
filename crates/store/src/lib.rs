#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Flux Store
//!
//! The persistence and coordination port for the FluxForge control plane,
//! plus the in-memory driver that ships with it.
//!
//! [`Store`] covers four concerns:
//! - **Records**: tenant-scoped agents, jobs, and desired states
//! - **Versioned state**: compare-and-swap status transitions
//! - **Epochs**: the durable monotonic counter behind leader fencing
//! - **Leases and locks**: TTL'd ownership primitives for election and
//!   request idempotency
//!
//! Every primitive here must be a single logical transaction. The memory
//! driver mutates under per-key entry locks; a networked driver must
//! express the same operations as one server-side atomic script each --
//! read-then-write across two round trips does not conform.

pub mod memory;
pub mod port;

pub use memory::MemoryStore;
pub use port::{IdempotencyState, LockInfo, Store, StoredResponse};
