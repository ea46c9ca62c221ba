//! Epoch-fenced lock cleanup.

use std::sync::Arc;
use std::time::Duration;

use flux_core::FluxResult;
use flux_store::Store;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::elector::LeaderState;

/// Deletes locks whose owner epoch predates the current durable epoch.
///
/// Such locks belong to holders that were fenced off by a leadership
/// change and will never release cleanly. TTL expiry would eventually
/// reclaim them; the janitor just shortens the wait. Leader-only: ticks
/// on followers are no-ops.
pub struct LockJanitor {
    store: Arc<dyn Store>,
    epoch_resource: String,
    period: Duration,
}

impl LockJanitor {
    /// Default sweep period.
    pub const DEFAULT_PERIOD: Duration = Duration::from_secs(60);

    /// Create a janitor sweeping every `period`.
    pub fn new(store: Arc<dyn Store>, epoch_resource: impl Into<String>, period: Duration) -> Self {
        Self {
            store,
            epoch_resource: epoch_resource.into(),
            period,
        }
    }

    /// Run one sweep. Returns the number of locks deleted.
    pub async fn sweep(&self) -> FluxResult<usize> {
        let current_epoch = self.store.current_durable_epoch(&self.epoch_resource).await?;
        let mut deleted = 0;
        for lock in self.store.list_locks().await? {
            if lock.owner_epoch < current_epoch && self.store.delete_lock(&lock.key).await? {
                tracing::info!(
                    key = %lock.key,
                    owner = %lock.owner,
                    owner_epoch = lock.owner_epoch,
                    current_epoch,
                    "deleted stale lock"
                );
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Spawn the periodic sweep task. Sweeps only while `leader` reports
    /// leadership; stops when `shutdown` is cancelled.
    pub fn spawn(
        self,
        leader: watch::Receiver<LeaderState>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    () = tokio::time::sleep(self.period) => {
                        if !leader.borrow().is_leader {
                            continue;
                        }
                        if let Err(err) = self.sweep().await {
                            tracing::warn!(error = %err, "lock sweep failed");
                        }
                    }
                }
            }
        })
    }
}
