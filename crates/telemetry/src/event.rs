//! Event bus for reconciliation lifecycle events.
//!
//! Uses [`tokio::sync::broadcast`] for fan-out delivery to multiple
//! subscribers (WebSocket hubs, audit pipelines). Events are
//! fire-and-forget projections -- dropping them is acceptable and must
//! never stall control flow.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flux_core::{FluxError, NodeName, StateId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Control-plane lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    /// A desired state reached a terminal status for this pass.
    StateTransition {
        /// The state that transitioned.
        state_id: StateId,
        /// The node it targets.
        node: NodeName,
        /// The new status label.
        new_status: String,
        /// Human-readable cause.
        reason: String,
        /// When the transition was observed.
        ts: DateTime<Utc>,
    },
    /// This replica gained or lost leadership.
    LeadershipChanged {
        /// Replica identity.
        node: String,
        /// Whether it is now the leader.
        is_leader: bool,
        /// The epoch in effect.
        epoch: i64,
        /// When the change was observed.
        ts: DateTime<Utc>,
    },
    /// An agent was marked offline by the liveness monitor.
    AgentOffline {
        /// The agent that went dark.
        node: NodeName,
        /// When staleness was detected.
        ts: DateTime<Utc>,
    },
}

impl ControlEvent {
    /// Stable label for the `event_type` metric dimension.
    #[must_use]
    pub fn type_label(&self) -> &'static str {
        match self {
            Self::StateTransition { .. } => "state_transition",
            Self::LeadershipChanged { .. } => "leadership_changed",
            Self::AgentOffline { .. } => "agent_offline",
        }
    }
}

/// Pluggable event publisher.
///
/// The reconciler wraps `publish` in a short timeout and counts failures;
/// implementations must not assume callers wait forever.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one event.
    async fn publish(&self, event: ControlEvent) -> Result<(), FluxError>;
}

/// Broadcast-based event bus.
///
/// Delivers events to all active subscribers. With no subscribers,
/// events are silently dropped.
pub struct EventBus {
    sender: broadcast::Sender<ControlEvent>,
    emitted: AtomicU64,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    ///
    /// When the channel is full the oldest events are dropped; lagging
    /// subscribers observe `RecvError::Lagged` and skip ahead.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            emitted: AtomicU64::new(0),
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: ControlEvent) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
        // Ignore send error (no active receivers).
        let _ = self.sender.send(event);
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            receiver: self.sender.subscribe(),
        }
    }

    /// Total number of events emitted since creation.
    #[must_use]
    pub fn total_emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Subscription handle for receiving events from the [`EventBus`].
pub struct EventSubscriber {
    receiver: broadcast::Receiver<ControlEvent>,
}

impl EventSubscriber {
    /// Receive the next event, waiting asynchronously.
    ///
    /// Returns `None` once the sender is gone. Lagged gaps are skipped.
    pub async fn recv(&mut self) -> Option<ControlEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<ControlEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// [`EventSink`] backed by an in-process [`EventBus`].
pub struct BroadcastSink {
    bus: std::sync::Arc<EventBus>,
}

impl BroadcastSink {
    /// Wrap an event bus.
    #[must_use]
    pub fn new(bus: std::sync::Arc<EventBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl EventSink for BroadcastSink {
    async fn publish(&self, event: ControlEvent) -> Result<(), FluxError> {
        self.bus.emit(event);
        Ok(())
    }
}
