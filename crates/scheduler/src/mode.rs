//! Admission modes.

use arc_swap::ArcSwap;
use flux_telemetry::{MetricsRegistry, names};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Global scheduler admission switch.
///
/// Resets to `normal` on restart; operators flip it at runtime and no
/// persistence is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionMode {
    /// All tasks accepted.
    Normal,
    /// No new tasks; queued work drains.
    Drain,
    /// No new tasks and workers pause. In-flight tasks run to their
    /// natural end; the queue is kept.
    Freeze,
}

impl AdmissionMode {
    /// Returns `true` if new submissions are accepted.
    #[must_use]
    pub fn accepts_submissions(&self) -> bool {
        matches!(self, Self::Normal)
    }

    /// Returns `true` if workers may pick up queued tasks.
    #[must_use]
    pub fn dispatches(&self) -> bool {
        matches!(self, Self::Normal | Self::Drain)
    }

    /// Stable label value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Drain => "drain",
            Self::Freeze => "freeze",
        }
    }
}

impl std::fmt::Display for AdmissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Atomically swappable admission mode with metric exposure.
pub struct ModeSwitch {
    mode: ArcSwap<AdmissionMode>,
    metrics: MetricsRegistry,
}

impl ModeSwitch {
    /// Create a switch starting in `normal`.
    #[must_use]
    pub fn new(metrics: MetricsRegistry) -> Self {
        let switch = Self {
            mode: ArcSwap::from_pointee(AdmissionMode::Normal),
            metrics,
        };
        switch.publish(AdmissionMode::Normal);
        switch
    }

    /// Current mode.
    #[must_use]
    pub fn get(&self) -> AdmissionMode {
        **self.mode.load()
    }

    /// Swap the mode.
    pub fn set(&self, mode: AdmissionMode) {
        let previous = **self.mode.load();
        self.mode.store(Arc::new(mode));
        if previous != mode {
            tracing::info!(from = %previous, to = %mode, "admission mode changed");
        }
        self.publish(mode);
    }

    fn publish(&self, mode: AdmissionMode) {
        self.metrics
            .gauge_vec(names::RUNTIME_MODE, &["mode"])
            .set_exclusive(&[mode.as_str()]);
    }
}
