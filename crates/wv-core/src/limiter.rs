//! Per-connection token-bucket rate limiter.

use std::time::{Duration, Instant};

/// A token bucket: `capacity` burst, refilled at `refill_per_sec`.
/// One token is spent per inbound message; an empty bucket means the
/// connection has exceeded its rate.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_per_sec: f64::from(refill_per_sec),
            tokens: f64::from(capacity),
            last: Instant::now(),
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last);
        self.last = now;
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    fn drain(&mut self, now: Instant) {
        while self.try_acquire_at(now) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_up_to_capacity_then_refuses() {
        let mut bucket = TokenBucket::new(30, 20);
        let now = Instant::now();
        for i in 0..30 {
            assert!(bucket.try_acquire_at(now), "token {i} within burst");
        }
        assert!(!bucket.try_acquire_at(now), "31st immediate message breaches");
    }

    #[test]
    fn refills_at_the_configured_rate() {
        let mut bucket = TokenBucket::new(30, 20);
        let start = Instant::now();
        bucket.drain(start);

        // 100 ms at 20 tokens/s buys exactly two tokens.
        let later = start + Duration::from_millis(100);
        assert!(bucket.try_acquire_at(later));
        assert!(bucket.try_acquire_at(later));
        assert!(!bucket.try_acquire_at(later));
    }

    #[test]
    fn refill_caps_at_capacity() {
        let mut bucket = TokenBucket::new(30, 20);
        let start = Instant::now();
        bucket.drain(start);

        let much_later = start + Duration::from_secs(3600);
        let mut granted = 0;
        while bucket.try_acquire_at(much_later) {
            granted += 1;
        }
        assert_eq!(granted, 30);
    }
}
