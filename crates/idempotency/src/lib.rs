#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Flux Idempotency
//!
//! The two-phase LOCK → RESULT gate behind the `X-Flux-Idempotency-Key`
//! header.
//!
//! For M concurrent submissions of the same key, exactly one executes the
//! handler body; the rest wait for (or immediately read) the cached
//! response and receive it byte-identical. A crashed holder is detected
//! when its lock lapses without a result appearing, bounded by the lock
//! TTL.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use flux_core::{FluxError, FluxResult};
use flux_store::{IdempotencyState, Store, StoredResponse};

/// Gate timing knobs.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Lock TTL as a multiple of the expected handler execution time.
    /// Two means a holder gets double its budget before being presumed
    /// dead.
    pub lock_ttl_factor: u32,
    /// How long a non-holder polls for the result before giving up.
    pub wait_timeout: Duration,
    /// Initial poll backoff while waiting on another holder.
    pub initial_backoff: Duration,
    /// Poll backoff cap.
    pub max_backoff: Duration,
    /// How long cached responses are replayable.
    pub result_ttl: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            lock_ttl_factor: 2,
            wait_timeout: Duration::from_secs(30),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            result_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// How the gate satisfied a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// This call executed the handler.
    Executed(StoredResponse),
    /// The response came from the cache (or another holder's execution).
    Replayed(StoredResponse),
}

impl GateOutcome {
    /// The response either way.
    #[must_use]
    pub fn response(&self) -> &StoredResponse {
        match self {
            Self::Executed(r) | Self::Replayed(r) => r,
        }
    }

    /// Consume into the response.
    #[must_use]
    pub fn into_response(self) -> StoredResponse {
        match self {
            Self::Executed(r) | Self::Replayed(r) => r,
        }
    }

    /// Returns `true` if this call ran the handler body.
    #[must_use]
    pub fn was_executed(&self) -> bool {
        matches!(self, Self::Executed(_))
    }
}

/// The idempotency gate.
pub struct IdempotencyGate {
    store: Arc<dyn Store>,
    config: GateConfig,
}

impl IdempotencyGate {
    /// Create a gate with default timings.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_config(store, GateConfig::default())
    }

    /// Create a gate with custom timings.
    pub fn with_config(store: Arc<dyn Store>, config: GateConfig) -> Self {
        Self { store, config }
    }

    /// Run `handler` at most once per `key`.
    ///
    /// `owner` identifies this request attempt in the lock; `owner_epoch`
    /// is the leadership epoch it was admitted under, which the lock
    /// janitor uses to reap locks orphaned by fenced-off replicas.
    /// `max_execution` sizes the lock TTL.
    ///
    /// A handler failure releases the lock without caching anything, so
    /// a later retry with the same key can execute.
    pub async fn execute<F, Fut>(
        &self,
        key: &str,
        owner: &str,
        owner_epoch: i64,
        max_execution: Duration,
        handler: F,
    ) -> FluxResult<GateOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FluxResult<StoredResponse>>,
    {
        if let Some(IdempotencyState::Result(cached)) = self.store.get_idempotency_state(key).await?
        {
            tracing::debug!(key, "idempotent replay from cache");
            return Ok(GateOutcome::Replayed(cached));
        }

        let lock_ttl = max_execution * self.config.lock_ttl_factor;
        if self
            .store
            .acquire_lock(key, owner, owner_epoch, lock_ttl)
            .await?
        {
            // The previous holder may have finished between our cache
            // check and this acquisition; the result always lands before
            // the lock clears, so one re-check decides it.
            if let Some(IdempotencyState::Result(cached)) =
                self.store.get_idempotency_state(key).await?
            {
                let _ = self.store.release_lock(key, owner).await;
                return Ok(GateOutcome::Replayed(cached));
            }
            let response = match handler().await {
                Ok(response) => response,
                Err(err) => {
                    let _ = self.store.release_lock(key, owner).await;
                    return Err(err);
                }
            };
            self.store
                .store_idempotency_result(key, response.clone(), self.config.result_ttl)
                .await?;
            return Ok(GateOutcome::Executed(response));
        }

        self.wait_for_result(key).await.map(GateOutcome::Replayed)
    }

    /// Poll for another holder's result with exponential backoff.
    async fn wait_for_result(&self, key: &str) -> FluxResult<StoredResponse> {
        let deadline = tokio::time::Instant::now() + self.config.wait_timeout;
        let mut backoff = self.config.initial_backoff;

        loop {
            match self.store.get_idempotency_state(key).await? {
                Some(IdempotencyState::Result(cached)) => return Ok(cached),
                Some(IdempotencyState::Locked { .. }) => {
                    // Holder is still executing.
                }
                None => {
                    // The lock lapsed and no result ever landed: the
                    // holder crashed mid-execution.
                    return Err(FluxError::Transport(format!(
                        "idempotent execution failed for key {key}: prior holder crashed"
                    )));
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(FluxError::timeout(
                    "waiting for idempotent request",
                    self.config.wait_timeout,
                ));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }
}
