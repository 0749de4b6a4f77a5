//! Per-provider token bucket.
//!
//! Each provider owns one [`RateLimiter`]. Tokens refill continuously at
//! `tokens_per_second` up to `burst_capacity`; every admitted call debits
//! one token. Refill is computed lazily on each access, so there is no
//! background task.
//!
//! The refill and the debit happen under the same lock, so two concurrent
//! callers can never both spend the last token.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::telemetry;
use crate::types::{Bounded, Deadline};
use crate::{Result, SkirnirError};

/// Float slack when comparing token counts after a timed wait.
const TOKEN_EPSILON: f64 = 1e-9;

/// Sustained rate and burst size for one provider.
///
/// ```rust
/// # use skirnir::RateLimitConfig;
/// let config = RateLimitConfig::new()
///     .tokens_per_second(5.0)
///     .burst_capacity(10);
/// assert_eq!(config.burst_capacity, 10);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Refill rate. Default: 10 tokens per second.
    pub tokens_per_second: f64,
    /// Bucket size; also the largest burst admitted at once. Default: 20.
    pub burst_capacity: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tokens_per_second: 10.0,
            burst_capacity: 20,
        }
    }
}

impl RateLimitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tokens_per_second(mut self, rate: f64) -> Self {
        self.tokens_per_second = rate;
        self
    }

    pub fn burst_capacity(mut self, capacity: u32) -> Self {
        self.burst_capacity = capacity;
        self
    }
}

/// Point-in-time view of a limiter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterStats {
    pub capacity: u32,
    pub tokens_per_second: f64,
    /// Tokens available right now (after lazy refill).
    pub available: f64,
    pub granted: u64,
    pub rejected: u64,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, capacity: f64, rate: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }
}

/// Token bucket guarding admission to one provider.
#[derive(Debug)]
pub struct RateLimiter {
    provider: String,
    capacity: f64,
    refill_rate: f64,
    bucket: Mutex<Bucket>,
    granted: AtomicU64,
    rejected: AtomicU64,
}

impl RateLimiter {
    /// Create a full bucket.
    pub fn new(provider: impl Into<String>, config: &RateLimitConfig) -> Self {
        let capacity = f64::from(config.burst_capacity);
        Self {
            provider: provider.into(),
            capacity,
            refill_rate: config.tokens_per_second.max(0.0),
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            granted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Take `n` tokens if they are available right now. Never waits.
    pub fn try_acquire(&self, n: u32) -> bool {
        match self.try_debit(n) {
            Ok(()) => {
                self.granted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.reject();
                false
            }
        }
    }

    /// Take `n` tokens, waiting for the refill if needed.
    ///
    /// The wait is proportional to the deficit. If the deficit cannot be
    /// covered before the deadline, fails at once with
    /// [`SkirnirError::RateLimited`] rather than sleeping until the deadline.
    /// Requests for more tokens than the bucket holds always fail.
    pub async fn wait_acquire(&self, n: u32, deadline: &Deadline) -> Result<()> {
        if f64::from(n) > self.capacity {
            self.reject();
            return Err(self.limited(None));
        }
        loop {
            let wait = match self.try_debit(n) {
                Ok(()) => {
                    self.granted.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(wait) => wait,
            };
            if !deadline.fits(wait) {
                self.reject();
                debug!(
                    provider = %self.provider,
                    wait_ms = wait.as_millis() as u64,
                    remaining_ms = deadline.remaining().as_millis() as u64,
                    "token deficit exceeds remaining budget"
                );
                return Err(self.limited(Some(wait)));
            }
            match deadline.run(tokio::time::sleep(wait)).await {
                Bounded::Done(()) => continue,
                Bounded::TimedOut => {
                    self.reject();
                    return Err(self.limited(Some(wait)));
                }
                Bounded::Cancelled => return Err(SkirnirError::Cancelled),
            }
        }
    }

    /// Tokens available now, after refill.
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now(), self.capacity, self.refill_rate);
        bucket.tokens
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            capacity: self.capacity as u32,
            tokens_per_second: self.refill_rate,
            available: self.available(),
            granted: self.granted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Refill, then debit `n` tokens in one critical section. On a deficit,
    /// returns how long the refill needs to cover it.
    fn try_debit(&self, n: u32) -> std::result::Result<(), Duration> {
        let needed = f64::from(n);
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now(), self.capacity, self.refill_rate);
        if bucket.tokens + TOKEN_EPSILON >= needed {
            bucket.tokens = (bucket.tokens - needed).max(0.0);
            return Ok(());
        }
        let deficit = needed - bucket.tokens;
        if self.refill_rate <= 0.0 {
            return Err(Duration::MAX);
        }
        Err(Duration::try_from_secs_f64(deficit / self.refill_rate).unwrap_or(Duration::MAX))
    }

    fn reject(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::RATE_LIMITED_TOTAL, "provider" => self.provider.clone())
            .increment(1);
    }

    fn limited(&self, retry_after: Option<Duration>) -> SkirnirError {
        SkirnirError::RateLimited {
            provider: self.provider.clone(),
            retry_after,
        }
    }
}
