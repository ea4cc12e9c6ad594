//! Token bucket limiting how often a provider's JWKS endpoint is fetched.

use chrono::{DateTime, Utc};

/// Refilling token bucket. Callers supply the current time so the bucket can be
/// driven by an injected clock.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_second: f64,
    last_refill: DateTime<Utc>,
}

impl TokenBucket {
    /// A full bucket allowing `per_minute` acquisitions per minute.
    pub fn per_minute(per_minute: u32, now: DateTime<Utc>) -> Self {
        let capacity = f64::from(per_minute);
        Self {
            capacity,
            tokens: capacity,
            refill_per_second: capacity / 60.0,
            last_refill: now,
        }
    }

    /// Take one token. Returns false when the bucket is empty.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Whole tokens currently available.
    pub fn available(&mut self, now: DateTime<Utc>) -> u32 {
        self.refill(now);
        self.tokens.floor() as u32
    }

    fn refill(&mut self, now: DateTime<Utc>) {
        let elapsed = (now - self.last_refill).num_milliseconds();
        if elapsed <= 0 {
            return;
        }
        self.tokens =
            (self.tokens + elapsed as f64 / 1000.0 * self.refill_per_second).min(self.capacity);
        self.last_refill = now;
    }
}
