//! Token bucket with continuous fractional refill.

use crate::clock::Timestamp;

#[derive(Clone, Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_ms: f64,
    tokens: f64,
    last_ms: Timestamp,
}

impl TokenBucket {
    /// A full bucket refilling `capacity` tokens every `window_ms`.
    pub fn new(capacity: u64, window_ms: u64, now: Timestamp) -> Self {
        let capacity = capacity as f64;
        Self {
            capacity,
            refill_per_ms: capacity / window_ms.max(1) as f64,
            tokens: capacity,
            last_ms: now,
        }
    }

    fn refill(&mut self, now: Timestamp) {
        let elapsed = now - self.last_ms;
        if elapsed > 0 {
            self.tokens = (self.tokens + elapsed as f64 * self.refill_per_ms).min(self.capacity);
            self.last_ms = now;
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn available(&mut self, now: Timestamp) -> f64 {
        self.refill(now);
        self.tokens
    }

    /// Fill level in `[0, 1]`.
    pub fn fraction(&mut self, now: Timestamp) -> f64 {
        if self.capacity <= 0.0 {
            return 0.0;
        }
        self.available(now) / self.capacity
    }

    /// Requests larger than the bucket are admitted once it is full.
    fn effective(&self, amount: f64) -> f64 {
        amount.max(0.0).min(self.capacity)
    }

    pub fn has(&mut self, amount: f64, now: Timestamp) -> bool {
        let amount = self.effective(amount);
        self.available(now) >= amount
    }

    pub fn try_consume(&mut self, amount: f64, now: Timestamp) -> bool {
        if !self.has(amount, now) {
            return false;
        }
        self.tokens -= self.effective(amount);
        true
    }

    pub fn refund(&mut self, amount: f64, now: Timestamp) {
        self.refill(now);
        self.tokens = (self.tokens + self.effective(amount)).min(self.capacity);
    }

    /// Milliseconds until `amount` tokens are available.
    pub fn time_to(&mut self, amount: f64, now: Timestamp) -> u64 {
        let missing = self.effective(amount) - self.available(now);
        if missing <= 0.0 {
            return 0;
        }
        if self.refill_per_ms <= 0.0 {
            return u64::MAX;
        }
        (missing / self.refill_per_ms).ceil() as u64
    }
}
