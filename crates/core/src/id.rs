//! Unique identifiers for FluxForge entities.
//!
//! UUID-backed identifiers use [`domain-key`](https://crates.io/crates/domain-key)
//! `Uuid<D>` wrappers parameterized by a domain marker, so a `JobId` can
//! never be passed where a `StateId` is expected. All of them are `Copy`
//! (16 bytes), support `v4()` / `nil()` / `parse(&str)`, and serialize as
//! UUID strings.
//!
//! [`NodeName`] is different: agents name themselves at registration time
//! ("web-03", "build.agent-7"), so it is a validated string newtype rather
//! than a UUID.

use std::fmt;
use std::str::FromStr;

use domain_key::define_uuid;
use serde::{Deserialize, Serialize};

// Re-export for downstream parse error handling
pub use domain_key::UuidParseError;

// Entity identifiers: UUID-based, Copy, 16 bytes each
define_uuid!(pub TenantIdDomain => TenantId);
define_uuid!(pub StateIdDomain => StateId);
define_uuid!(pub JobIdDomain => JobId);
define_uuid!(pub RequestIdDomain => RequestId);

/// Maximum accepted length of an agent-supplied node name.
pub const NODE_NAME_MAX_LEN: usize = 128;

/// A tenant-unique agent name.
///
/// Supplied by the agent itself at registration. Restricted to
/// `[A-Za-z0-9._-]`, 1 to [`NODE_NAME_MAX_LEN`] characters, so names are
/// safe to embed in lease keys and metric labels without escaping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeName(String);

/// Error returned when a node name fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeNameError {
    /// The name was empty.
    #[error("node name must not be empty")]
    Empty,
    /// The name exceeded [`NODE_NAME_MAX_LEN`] characters.
    #[error("node name exceeds {NODE_NAME_MAX_LEN} characters")]
    TooLong,
    /// The name contained a character outside `[A-Za-z0-9._-]`.
    #[error("node name contains invalid character {0:?}")]
    InvalidChar(char),
}

impl NodeName {
    /// Validate and wrap a node name.
    pub fn new(name: impl Into<String>) -> Result<Self, NodeNameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(NodeNameError::Empty);
        }
        if name.len() > NODE_NAME_MAX_LEN {
            return Err(NodeNameError::TooLong);
        }
        if let Some(bad) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(NodeNameError::InvalidChar(bad));
        }
        Ok(Self(name))
    }

    /// The underlying name string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeName {
    type Err = NodeNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for NodeName {
    type Error = NodeNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodeName> for String {
    fn from(name: NodeName) -> Self {
        name.0
    }
}
