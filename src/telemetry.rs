//! Telemetry metric name constants.
//!
//! Centralised metric names for skirnir operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `skirnir_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `provider` — provider name as configured on the manager
//! - `status` — call outcome: "ok", "cached", "non_retryable", "exhausted", "cancelled"
//! - `outcome` — attempt outcome: "ok", "transient", "connection", "timeout", "non_retryable"
//! - `phase` — circuit phase entered: "closed", "open", "half_open"

/// Total calls handled by [`ProviderResilienceManager::execute`](crate::ProviderResilienceManager::execute).
///
/// Labels: `status`.
pub const REQUESTS_TOTAL: &str = "skirnir_requests_total";

/// End-to-end call duration in seconds, cache hits included.
///
/// Labels: `status`.
pub const REQUEST_DURATION_SECONDS: &str = "skirnir_request_duration_seconds";

/// Raw provider invocations.
///
/// Labels: `provider`, `outcome`.
pub const ATTEMPTS_TOTAL: &str = "skirnir_attempts_total";

/// Times the chain moved past a provider to the next one.
///
/// Labels: `provider`, `reason` (a [`FailureKind`](crate::FailureKind) string).
pub const FALLBACKS_TOTAL: &str = "skirnir_fallbacks_total";

/// Same-provider retries after a connection-level fault.
///
/// Labels: `provider`.
pub const RETRIES_TOTAL: &str = "skirnir_retries_total";

/// Circuit breaker phase transitions.
///
/// Labels: `provider`, `phase`.
pub const CIRCUIT_TRANSITIONS_TOTAL: &str = "skirnir_circuit_transitions_total";

/// Calls rejected by a provider's token bucket.
///
/// Labels: `provider`.
pub const RATE_LIMITED_TOTAL: &str = "skirnir_rate_limited_total";

/// Pool acquisitions that timed out.
///
/// Labels: `provider`.
pub const POOL_EXHAUSTED_TOTAL: &str = "skirnir_pool_exhausted_total";

/// Connections closed by the pool (unhealthy release or keepalive expiry).
///
/// Labels: `provider`.
pub const POOL_CLOSED_TOTAL: &str = "skirnir_pool_connections_closed_total";

/// Response cache hits.
pub const CACHE_HITS_TOTAL: &str = "skirnir_cache_hits_total";

/// Response cache misses (expired entries included).
pub const CACHE_MISSES_TOTAL: &str = "skirnir_cache_misses_total";

/// Entries evicted to make room for new ones.
pub const CACHE_EVICTIONS_TOTAL: &str = "skirnir_cache_evictions_total";

/// Install a `tracing` subscriber that reads its filter from `RUST_LOG`,
/// falling back to `default_filter`.
///
/// Intended for binaries and test harnesses embedding the manager. Returns
/// an error string if a global subscriber is already installed.
#[cfg(feature = "subscriber")]
pub fn init_tracing(default_filter: &str) -> std::result::Result<(), String> {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| e.to_string())
}
