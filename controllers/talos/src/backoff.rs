//! # Retry Backoff
//!
//! Per-record exponential backoff plus a token bucket shared by every record.
//!
//! A failing record waits `base * 2^n` (capped at `max`) before its next
//! attempt. The token bucket caps the total reconciliation rate so that many
//! failing records together cannot hammer the API server or the machines.
//! Sequence with the default 1s base and 60s cap: 1s, 2s, 4s, 8s, 16s, 32s, 60s.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Exponential backoff calculator
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new backoff with the given first delay and cap
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, attempt: 0 }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let delay = Self::calculate_for_error_count(self.attempt, self.base, self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Delay for a given number of previous failures (stateless)
    ///
    /// `error_count` 0 yields `base`; each further failure doubles it, up to `max`.
    #[must_use]
    pub fn calculate_for_error_count(error_count: u32, base: Duration, max: Duration) -> Duration {
        let factor = 1u32.checked_shl(error_count.min(31)).unwrap_or(u32::MAX);
        base.checked_mul(factor).map_or(max, |delay| delay.min(max))
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Token bucket shared by every reconciliation
///
/// Holds at most `rate` tokens and refills at `rate` tokens per second.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Limiter admitting `per_second` reconciliations per second, with bursts
    /// of the same size
    #[must_use]
    pub fn new(per_second: u32) -> Self {
        let rate = f64::from(per_second.max(1));
        Self {
            rate,
            bucket: Mutex::new(Bucket {
                tokens: rate,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Take a token
    ///
    /// Returns `None` when one was available, otherwise how long to wait
    /// until the next one is.
    pub fn acquire(&self) -> Option<Duration> {
        self.acquire_at(Instant::now())
    }

    fn acquire_at(&self, now: Instant) -> Option<Duration> {
        let mut bucket = match self.bucket.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let elapsed = now.saturating_duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.rate);
        bucket.refilled_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            None
        } else {
            Some(Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate))
        }
    }
}
