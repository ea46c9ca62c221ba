//! Consecutive-failure circuit breaker.

use std::time::{Duration, Instant};

use flux_core::{FluxError, FluxResult};
use parking_lot::Mutex;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Operations flow.
    Closed,
    /// Operations are refused until the cooldown lapses.
    Open,
    /// One probe is allowed through to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Initial open-state cooldown.
    pub cooldown: Duration,
    /// Cap on cooldown doubling, as a multiple of the base cooldown.
    pub max_cooldown_factor: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            cooldown: Duration::from_secs(30),
            max_cooldown_factor: 8,
        }
    }
}

impl BreakerConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> FluxResult<()> {
        if self.failure_threshold == 0 {
            return Err(FluxError::InvalidInput(
                "failure_threshold must be greater than 0".into(),
            ));
        }
        if self.cooldown.is_zero() {
            return Err(FluxError::InvalidInput(
                "cooldown must be greater than 0".into(),
            ));
        }
        if self.max_cooldown_factor == 0 {
            return Err(FluxError::InvalidInput(
                "max_cooldown_factor must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    current_cooldown: Duration,
    probe_in_flight: bool,
}

/// Trips open after N consecutive failures; recovers through a single
/// half-open probe. Each failed probe doubles the cooldown up to the
/// configured cap; a successful probe closes the circuit and resets it.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker with the given configuration.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        let cooldown = config.cooldown;
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                current_cooldown: cooldown,
                probe_in_flight: false,
            }),
        }
    }

    /// Current state, advancing `open -> half_open` when the cooldown has
    /// lapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        inner.state
    }

    /// Whether a new operation may proceed. In half-open state, admits a
    /// single probe; concurrent calls are refused until the probe
    /// reports back.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful operation.
    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                tracing::info!("circuit probe succeeded, closing");
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.probe_in_flight = false;
                inner.opened_at = None;
                inner.current_cooldown = self.config.cooldown;
            }
            CircuitState::Open => {
                // Stale completion from before the trip; ignore.
            }
        }
    }

    /// Record an operation that resolved without saying anything about
    /// health (single-flight hit, lost CAS race, cancellation).
    ///
    /// Releases a half-open probe slot so the next attempt can probe,
    /// but leaves the state and the consecutive-failure streak alone:
    /// a neutral outcome is not evidence of recovery.
    pub fn on_neutral(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    /// Record a failed operation.
    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        failures = inner.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "circuit opened"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                let doubled = inner.current_cooldown * 2;
                let cap = self.config.cooldown * self.config.max_cooldown_factor;
                inner.current_cooldown = doubled.min(cap);
                tracing::warn!(
                    cooldown_secs = inner.current_cooldown.as_secs(),
                    "circuit probe failed, reopening"
                );
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                inner.consecutive_failures += 1;
            }
            CircuitState::Open => inner.consecutive_failures += 1,
        }
    }

    fn advance(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= inner.current_cooldown
        {
            inner.state = CircuitState::HalfOpen;
            inner.probe_in_flight = false;
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
