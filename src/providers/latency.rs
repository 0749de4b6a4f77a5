//! Per-provider latency tracking and fallback-chain ordering.

use std::time::Duration;

use parking_lot::Mutex;

/// Smoothing factor used by the manager.
pub const DEFAULT_ALPHA: f64 = 0.2;

#[derive(Debug, Default, Clone, Copy)]
struct Ewma {
    micros: f64,
    samples: u64,
}

/// Exponentially weighted moving average of successful call durations.
///
/// `alpha` close to 1.0 follows the latest observation; close to 0.0 the
/// average moves slowly. The first observation seeds the average directly.
///
/// ```rust
/// # use std::time::Duration;
/// # use skirnir::providers::ProviderLatency;
/// let latency = ProviderLatency::new(0.5);
/// latency.record(Duration::from_millis(100));
/// latency.record(Duration::from_millis(200));
/// assert_eq!(latency.average(), Some(Duration::from_millis(150)));
/// ```
#[derive(Debug)]
pub struct ProviderLatency {
    alpha: f64,
    state: Mutex<Ewma>,
}

impl Default for ProviderLatency {
    fn default() -> Self {
        Self::new(DEFAULT_ALPHA)
    }
}

impl ProviderLatency {
    /// `alpha` is clamped to `[0.0, 1.0]`.
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            state: Mutex::new(Ewma::default()),
        }
    }

    pub fn record(&self, duration: Duration) {
        let sample = duration.as_micros() as f64;
        let mut state = self.state.lock();
        state.micros = if state.samples == 0 {
            sample
        } else {
            self.alpha * sample + (1.0 - self.alpha) * state.micros
        };
        state.samples += 1;
    }

    /// Current estimate, `None` before the first observation.
    pub fn average(&self) -> Option<Duration> {
        let state = *self.state.lock();
        (state.samples > 0).then(|| Duration::from_micros(state.micros.round() as u64))
    }

    pub fn samples(&self) -> u64 {
        self.state.lock().samples
    }
}

/// Anything that has a provider name.
pub(crate) trait Named {
    fn name(&self) -> &str;
}

/// Move the provider called `preferred` to the head of the chain, keeping
/// the relative order of the rest. No-op if it is absent or already first.
pub(crate) fn promote_preferred<T: Named>(chain: &mut [T], preferred: &str) -> bool {
    match chain.iter().position(|p| p.name() == preferred) {
        Some(0) => true,
        Some(idx) => {
            chain[..=idx].rotate_right(1);
            true
        }
        None => false,
    }
}
