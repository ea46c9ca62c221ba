#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Flux Coordination
//!
//! Leader election and fencing for the FluxForge control plane.
//!
//! Each replica runs a [`LeaderElector`] over the store's lease
//! primitive. Winning the lease mints a fresh durable epoch, which every
//! leader-scoped write carries as a fencing token; losing the lease
//! cancels the term's [`CancellationToken`] before another acquisition
//! attempt can begin, so lose-handling always completes before the next
//! become-handling starts on the same replica.
//!
//! The [`LockJanitor`] runs on the leader and deletes locks whose owner
//! epoch predates the current durable epoch.

pub mod coordinator;
pub mod elector;
pub mod janitor;

pub use coordinator::LeaseCoordinator;
pub use elector::{ElectionConfig, LeaderElector, LeaderHandle, LeaderState};
pub use janitor::LockJanitor;
