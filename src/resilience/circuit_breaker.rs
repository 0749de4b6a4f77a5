//! Per-provider circuit breaker.
//!
//! # Phases
//!
//! ```text
//!            failure_threshold consecutive failures
//!   Closed ───────────────────────────────────────────► Open
//!     ▲                                                  │
//!     │ success_threshold                                │ recovery_timeout
//!     │ probe successes                                  │ elapsed, next call
//!     │                                                  ▼
//!     └──────────────────────────────────────────── HalfOpen
//!                                  (one probe in flight; any failure → Open)
//! ```
//!
//! Callers obtain a [`CircuitPermit`] from [`CircuitBreaker::try_acquire`]
//! and settle it with the classified outcome. A permit dropped unsettled
//! (the call was cancelled, or never reached the provider) frees the probe
//! slot without counting either way.

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::telemetry;
use crate::{Result, SkirnirError};

/// Thresholds for one provider's breaker.
///
/// ```rust
/// # use std::time::Duration;
/// # use skirnir::CircuitBreakerConfig;
/// let config = CircuitBreakerConfig::new()
///     .failure_threshold(3)
///     .recovery_timeout(Duration::from_secs(10))
///     .success_threshold(2);
/// assert_eq!(config.failure_threshold, 3);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive qualifying failures that open the circuit. Default: 5.
    pub failure_threshold: u32,
    /// Cool-down before a probe is admitted. Default: 30s.
    pub recovery_timeout: Duration,
    /// Consecutive probe successes that close the circuit again. Default: 1.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = n;
        self
    }

    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn success_threshold(mut self, n: u32) -> Self {
        self.success_threshold = n;
        self
    }
}

/// Breaker phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitPhase::Closed => "closed",
            CircuitPhase::Open => "open",
            CircuitPhase::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consistent copy of a breaker's state, taken under its lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub phase: CircuitPhase,
    pub failure_count: u32,
    pub success_count: u32,
    /// Milliseconds since the last phase transition.
    pub since_transition_ms: u64,
    /// Times the circuit has opened since creation.
    pub times_opened: u64,
}

#[derive(Debug)]
struct CircuitState {
    phase: CircuitPhase,
    failure_count: u32,
    success_count: u32,
    last_transition: Instant,
    probe_in_flight: bool,
    times_opened: u64,
}

/// Three-phase failure isolator for one provider.
#[derive(Debug)]
pub struct CircuitBreaker {
    provider: String,
    config: CircuitBreakerConfig,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            provider: provider.into(),
            config,
            state: Mutex::new(CircuitState {
                phase: CircuitPhase::Closed,
                failure_count: 0,
                success_count: 0,
                last_transition: Instant::now(),
                probe_in_flight: false,
                times_opened: 0,
            }),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask to call the provider.
    ///
    /// - Closed: always admitted.
    /// - Open: rejected with [`SkirnirError::CircuitOpen`] until the recovery
    ///   timeout has elapsed; the first call after that becomes the probe and
    ///   moves the breaker to HalfOpen.
    /// - HalfOpen: admitted only if no probe is in flight.
    pub fn try_acquire(&self) -> Result<CircuitPermit<'_>> {
        let mut state = self.state.lock();
        let now = Instant::now();
        match state.phase {
            CircuitPhase::Closed => Ok(CircuitPermit::new(self, false)),
            CircuitPhase::Open => {
                let elapsed = now.saturating_duration_since(state.last_transition);
                if elapsed >= self.config.recovery_timeout {
                    self.transition(&mut state, CircuitPhase::HalfOpen, now);
                    state.probe_in_flight = true;
                    Ok(CircuitPermit::new(self, true))
                } else {
                    Err(self.open_error(self.config.recovery_timeout - elapsed))
                }
            }
            CircuitPhase::HalfOpen => {
                if state.probe_in_flight {
                    Err(self.open_error(Duration::ZERO))
                } else {
                    state.probe_in_flight = true;
                    Ok(CircuitPermit::new(self, true))
                }
            }
        }
    }

    /// Current phase. A pure read: an Open breaker whose cool-down has
    /// elapsed still reports Open until the next call is admitted.
    pub fn phase(&self) -> CircuitPhase {
        self.state.lock().phase
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state.lock();
        CircuitSnapshot {
            phase: state.phase,
            failure_count: state.failure_count,
            success_count: state.success_count,
            since_transition_ms: state.last_transition.elapsed().as_millis() as u64,
            times_opened: state.times_opened,
        }
    }

    fn on_success(&self, probe: bool) {
        let mut state = self.state.lock();
        match state.phase {
            CircuitPhase::Closed => state.failure_count = 0,
            CircuitPhase::HalfOpen if probe => {
                state.probe_in_flight = false;
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    self.transition(&mut state, CircuitPhase::Closed, Instant::now());
                }
            }
            // Stale outcome from a call admitted before the last transition.
            CircuitPhase::HalfOpen | CircuitPhase::Open => {}
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut state = self.state.lock();
        match state.phase {
            CircuitPhase::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    self.transition(&mut state, CircuitPhase::Open, Instant::now());
                }
            }
            CircuitPhase::HalfOpen if probe => {
                self.transition(&mut state, CircuitPhase::Open, Instant::now());
            }
            CircuitPhase::HalfOpen | CircuitPhase::Open => {}
        }
    }

    fn on_abandon(&self, probe: bool) {
        if probe {
            let mut state = self.state.lock();
            if state.phase == CircuitPhase::HalfOpen {
                state.probe_in_flight = false;
            }
        }
    }

    /// Move to `phase`, resetting counters. Caller holds the lock.
    fn transition(&self, state: &mut CircuitState, phase: CircuitPhase, now: Instant) {
        let from = state.phase;
        state.phase = phase;
        state.failure_count = 0;
        state.success_count = 0;
        state.probe_in_flight = false;
        state.last_transition = now;
        if phase == CircuitPhase::Open {
            state.times_opened += 1;
            warn!(
                provider = %self.provider,
                from = %from,
                recovery_ms = self.config.recovery_timeout.as_millis() as u64,
                "circuit opened"
            );
        } else {
            info!(provider = %self.provider, from = %from, to = %phase, "circuit transition");
        }
        metrics::counter!(telemetry::CIRCUIT_TRANSITIONS_TOTAL,
            "provider" => self.provider.clone(),
            "phase" => phase.as_str(),
        )
        .increment(1);
    }

    fn open_error(&self, retry_in: Duration) -> SkirnirError {
        SkirnirError::CircuitOpen {
            provider: self.provider.clone(),
            retry_in,
        }
    }
}

/// Admission ticket for one call. Settle it with the classified outcome.
#[must_use = "an unsettled permit counts as neither success nor failure"]
#[derive(Debug)]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> CircuitPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    /// Whether this permit is the HalfOpen probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Record a qualifying success.
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    /// Record a qualifying failure.
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }

    /// Release without counting (non-qualifying outcome).
    pub fn ignore(self) {
        drop(self);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandon(self.probe);
        }
    }
}
