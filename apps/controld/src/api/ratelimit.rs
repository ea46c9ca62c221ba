//! Token-bucket storm protection for hot endpoints.

use std::time::Instant;

use parking_lot::Mutex;
use rand::Rng;

/// Classic token bucket: tokens refill at a constant rate up to the
/// bucket capacity, each admitted request spends one.
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket with `capacity` burst tokens refilling at
    /// `refill_rate` per second.
    #[must_use]
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate: refill_rate.max(0.001),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Spend one token. Returns `false` when the bucket is exhausted.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Jittered `Retry-After` seconds for a 429: 1 or 2, at random, so
    /// a thundering herd does not re-arrive in lockstep.
    pub fn retry_after_secs(&self) -> u64 {
        rand::rng().random_range(1..=2)
    }
}
