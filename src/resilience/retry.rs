//! Retry configuration and delay calculation for connection faults.
//!
//! Only pure connection-level faults are retried on the same provider;
//! everything else advances the fallback chain. Each retry re-enters the
//! circuit breaker and the rate limiter like a fresh call.

use std::time::Duration;

/// Configuration for same-provider retries on connection faults.
///
/// Uses exponential backoff with optional jitter:
///
/// ```rust
/// # use skirnir::RetryConfig;
/// # use std::time::Duration;
/// let config = RetryConfig::new()
///     .max_attempts(3)
///     .initial_delay(Duration::from_millis(50))
///     .jitter(false);
/// assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts per provider (including the first).
    /// 1 = no retry. Default: 2.
    pub max_attempts: u32,
    /// Base delay before the first retry. Default: 100ms.
    pub initial_delay: Duration,
    /// Maximum delay between retries (caps exponential growth). Default: 2s.
    pub max_delay: Duration,
    /// Whether to add random jitter to delays. Default: true.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single attempt per provider.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Delay before retry number `attempt` (0-indexed), without jitter.
    ///
    /// `initial_delay * 2^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        delay.min(self.max_delay)
    }

    /// A provider's `retry_after` hint takes precedence over the backoff.
    pub fn effective_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        retry_after.unwrap_or_else(|| self.delay_for_attempt(attempt))
    }

    /// [`effective_delay`](Self::effective_delay) with jitter applied: a
    /// uniformly random duration between half and all of the delay.
    pub fn backoff(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let delay = self.effective_delay(attempt, retry_after);
        if !self.jitter || retry_after.is_some() || delay.is_zero() {
            return delay;
        }
        delay.mul_f64(0.5 + fastrand::f64() * 0.5)
    }
}
