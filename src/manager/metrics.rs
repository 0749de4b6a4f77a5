//! Snapshot types returned by [`ProviderResilienceManager::get_metrics`].
//!
//! [`ProviderResilienceManager::get_metrics`]: super::ProviderResilienceManager::get_metrics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::cache::CacheStats;
use crate::pool::PoolStats;
use crate::resilience::{CircuitSnapshot, RateLimiterStats};

/// Per-provider call accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AttemptStats {
    /// Raw invocations, retries included.
    pub attempts: u64,
    pub successes: u64,
    pub transient_failures: u64,
    pub connection_failures: u64,
    pub timeouts: u64,
    pub non_retryable: u64,
    /// Same-provider retries after connection faults.
    pub retries: u64,
    pub skipped_circuit_open: u64,
    pub skipped_rate_limited: u64,
    pub skipped_pool_exhausted: u64,
    /// Cache hits served from responses this provider produced.
    pub cache_hits: u64,
}

#[derive(Debug, Default)]
pub(crate) struct AttemptCounters {
    pub(crate) attempts: AtomicU64,
    pub(crate) successes: AtomicU64,
    pub(crate) transient_failures: AtomicU64,
    pub(crate) connection_failures: AtomicU64,
    pub(crate) timeouts: AtomicU64,
    pub(crate) non_retryable: AtomicU64,
    pub(crate) retries: AtomicU64,
    pub(crate) skipped_circuit_open: AtomicU64,
    pub(crate) skipped_rate_limited: AtomicU64,
    pub(crate) skipped_pool_exhausted: AtomicU64,
    pub(crate) cache_hits: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl AttemptCounters {
    pub(crate) fn snapshot(&self) -> AttemptStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        AttemptStats {
            attempts: load(&self.attempts),
            successes: load(&self.successes),
            transient_failures: load(&self.transient_failures),
            connection_failures: load(&self.connection_failures),
            timeouts: load(&self.timeouts),
            non_retryable: load(&self.non_retryable),
            retries: load(&self.retries),
            skipped_circuit_open: load(&self.skipped_circuit_open),
            skipped_rate_limited: load(&self.skipped_rate_limited),
            skipped_pool_exhausted: load(&self.skipped_pool_exhausted),
            cache_hits: load(&self.cache_hits),
        }
    }
}

/// Health view of one provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderMetrics {
    pub name: String,
    pub circuit: CircuitSnapshot,
    pub rate_limiter: RateLimiterStats,
    pub pool: PoolStats,
    pub attempts: AttemptStats,
    /// EWMA of successful call durations, `None` before the first success.
    pub latency_ms: Option<f64>,
    /// Share of this provider's answers that were served from the cache:
    /// `cache_hits / (cache_hits + successes)`.
    pub cache_hit_rate: f64,
}

/// Everything [`get_metrics`](super::ProviderResilienceManager::get_metrics) reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagerMetrics {
    /// In fallback order.
    pub providers: Vec<ProviderMetrics>,
    pub cache: CacheStats,
    /// Pool counters summed over all providers.
    pub pool: PoolStats,
}

impl ManagerMetrics {
    pub fn provider(&self, name: &str) -> Option<&ProviderMetrics> {
        self.providers.iter().find(|p| p.name == name)
    }
}
