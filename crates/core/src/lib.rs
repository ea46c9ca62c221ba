#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Flux Core
//!
//! Shared identifiers and the cross-crate error type for the FluxForge
//! control plane.
//!
//! Every other crate in the workspace depends on this one and nothing
//! else inside the workspace, so it stays deliberately small: typed IDs,
//! the [`FluxError`] kind taxonomy, and the [`FluxResult`] alias.

pub mod error;
pub mod id;

pub use error::{FluxError, FluxResult, RejectReason};
pub use id::{JobId, NodeName, NodeNameError, RequestId, StateId, TenantId};
