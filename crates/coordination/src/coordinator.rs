//! Lease coordination over the store.

use std::sync::Arc;
use std::time::Duration;

use flux_core::FluxResult;
use flux_store::Store;

/// Owner-fenced lease operations on a single key.
///
/// The lease value carries the owner identity, so a spurious holder can
/// neither renew nor release a lease it does not own. Acquisition
/// succeeds only when the key is empty or its previous holder's TTL has
/// lapsed.
pub struct LeaseCoordinator {
    store: Arc<dyn Store>,
    key: String,
    owner: String,
    ttl: Duration,
}

impl LeaseCoordinator {
    /// Create a coordinator for `key`, held as `owner`.
    pub fn new(
        store: Arc<dyn Store>,
        key: impl Into<String>,
        owner: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            owner: owner.into(),
            ttl,
        }
    }

    /// The owner identity this coordinator writes into the lease.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Attempt to take the lease. Returns `true` on success.
    pub async fn acquire(&self) -> FluxResult<bool> {
        self.store
            .acquire_lease(&self.key, &self.owner, self.ttl)
            .await
    }

    /// Extend the lease. Fails (returns `false`) if the stored value is
    /// not this owner or the TTL already lapsed.
    pub async fn renew(&self) -> FluxResult<bool> {
        self.store
            .renew_lease(&self.key, &self.owner, self.ttl)
            .await
    }

    /// Drop the lease if held by this owner.
    pub async fn release(&self) -> FluxResult<bool> {
        self.store.release_lease(&self.key, &self.owner).await
    }
}
