//! Token bucket rate limiter for queue dispatches
//!
//! Each queue owns one bucket sized by its rate limits: capacity is
//! `max_burst_size`, the refill rate is `max_dispatches_per_second` and the
//! bucket starts full. Refill is continuous, so fractional tokens accumulate
//! between dispatches, and the level never exceeds capacity.

use tokio::time::{sleep, Duration, Instant};

/// A continuously refilling token bucket.
///
/// The bucket is owned by a single dispatch loop and is not shared, so it
/// needs no internal locking. Refill happens lazily whenever the level is
/// observed.
#[derive(Debug)]
pub struct TokenBucket {
    /// Maximum token level, i.e. the largest permitted burst
    capacity: f64,
    /// Tokens added per second
    refill_rate: f64,
    /// Current level, including fractional tokens
    tokens: f64,
    /// When the level was last brought up to date
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket from a queue's rate limits.
    pub fn new(max_dispatches_per_second: f64, max_burst_size: i32) -> Self {
        let capacity = max_burst_size.max(1) as f64;
        Self {
            capacity,
            refill_rate: max_dispatches_per_second,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    /// Brings the token level up to date for the given instant.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Removes one token if available.
    pub fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Removes one token, waiting for the bucket to refill when empty.
    pub async fn take(&mut self) {
        loop {
            if self.try_take(Instant::now()) {
                return;
            }
            // Sleep exactly as long as the deficit takes to refill; a retry
            // loop covers rounding and spurious early wakeups.
            let deficit = 1.0 - self.tokens;
            sleep(Duration::from_secs_f64(deficit / self.refill_rate)).await;
        }
    }

    /// Returns a token to the bucket, e.g. when a claimed dispatch is
    /// deferred without being sent.
    pub fn give_back(&mut self) {
        self.tokens = (self.tokens + 1.0).min(self.capacity);
    }
}
