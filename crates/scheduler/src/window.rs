//! Rolling failure-rate windows.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Rolling window of operation outcomes used for health scoring.
///
/// Keeps outcomes for a fixed duration; the health score is the success
/// fraction over the retained window. An empty window scores 1.0 --
/// absence of evidence is not treated as illness.
#[derive(Debug)]
pub struct FailureWindow {
    window: Duration,
    outcomes: VecDeque<(Instant, bool)>,
}

impl FailureWindow {
    /// Create a window retaining outcomes for `window`.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            outcomes: VecDeque::new(),
        }
    }

    /// Record one outcome.
    pub fn record(&mut self, success: bool) {
        let now = Instant::now();
        self.outcomes.push_back((now, success));
        self.evict(now);
    }

    /// Success fraction over the window, in `0.0..=1.0`.
    pub fn health_score(&mut self) -> f64 {
        self.evict(Instant::now());
        if self.outcomes.is_empty() {
            return 1.0;
        }
        let successes = self.outcomes.iter().filter(|(_, ok)| *ok).count();
        successes as f64 / self.outcomes.len() as f64
    }

    /// Number of retained outcomes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// Whether the window holds no outcomes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    fn evict(&mut self, now: Instant) {
        while let Some((at, _)) = self.outcomes.front() {
            if now.duration_since(*at) > self.window {
                self.outcomes.pop_front();
            } else {
                break;
            }
        }
    }
}
