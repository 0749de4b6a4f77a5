//! The resilience orchestrator.
//!
//! [`ProviderResilienceManager::execute`] makes one call against a chain of
//! interchangeable providers:
//!
//! ```text
//!  execute(request, deadline)
//!        │
//!        ├─ cacheable? ── fingerprint ── cache hit ──────────────► Response (cached)
//!        │
//!        ▼  for each provider, in fallback order
//!  ┌───────────────────────────────────────────────────────────┐
//!  │ circuit breaker ── Open ─────────────────────────► next    │
//!  │ rate limiter ───── deficit beyond deadline ──────► next    │
//!  │ connection pool ── none within request_timeout ──► next    │
//!  │ invoke (capped at request_timeout)                         │
//!  │   ok ─────────────── breaker success, cache put ─► return  │
//!  │   permanent ──────── propagate NonRetryable ─────► return  │
//!  │   connection fault ─ breaker failure, retry same provider  │
//!  │   transient/timeout─ breaker failure ────────────► next    │
//!  └───────────────────────────────────────────────────────────┘
//!        │
//!        ▼
//!  AllProvidersExhausted { per-provider failures }
//! ```
//!
//! The overall deadline bounds every wait in the chain. Once it passes, the
//! call stops and providers that were never reached are reported as
//! [`FailureKind::DeadlineExceeded`]. Cancelling the deadline's token
//! aborts with [`SkirnirError::Cancelled`] without trying further providers.

mod builder;
mod maintenance;
mod metrics;

pub use builder::ManagerBuilder;
pub use maintenance::{MaintenanceConfig, MaintenanceHandle};
pub use self::metrics::{AttemptStats, ManagerMetrics, ProviderMetrics};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::cache::{CachePolicy, Fingerprint, ResponseCache};
use crate::pool::ConnectionPool;
use crate::providers::{
    ClassifiedError, Named, ProviderEndpoint, ProviderInvoker, ProviderLatency,
};
use crate::resilience::{CircuitBreaker, CircuitPhase, RateLimiter};
use crate::telemetry;
use crate::types::{Bounded, Deadline, Request, Response};
use crate::{FailureKind, ProviderFailure, Result, SkirnirError};

use self::metrics::{AttemptCounters, bump};

/// One provider with its private admission state.
pub(crate) struct ProviderSlot {
    endpoint: ProviderEndpoint,
    invoker: Arc<dyn ProviderInvoker>,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    latency: ProviderLatency,
    counters: AttemptCounters,
}

impl ProviderSlot {
    pub(crate) fn new(endpoint: ProviderEndpoint, invoker: Arc<dyn ProviderInvoker>) -> Self {
        Self {
            limiter: RateLimiter::new(&endpoint.name, &endpoint.config.rate_limit),
            breaker: CircuitBreaker::new(&endpoint.name, endpoint.config.circuit.clone()),
            latency: ProviderLatency::default(),
            counters: AttemptCounters::default(),
            invoker,
            endpoint,
        }
    }

    fn failure(&self, kind: FailureKind, message: impl Into<String>, attempts: u32) -> ProviderFailure {
        ProviderFailure::new(self.name(), kind, message, attempts)
    }
}

impl Named for ProviderSlot {
    fn name(&self) -> &str {
        &self.endpoint.name
    }
}

/// Cache entry body: the serving provider travels with the payload.
#[derive(Serialize, Deserialize)]
struct CachedBody {
    provider: String,
    body: Value,
}

/// Result of trying one provider.
enum Outcome {
    Success(Value),
    Fallback(ProviderFailure),
    Abort(SkirnirError),
}

/// Ephemeral state of one `execute` call.
#[derive(Default)]
struct CallState {
    attempts: u32,
    failures: Vec<ProviderFailure>,
}

/// Makes a call to any one of several interchangeable providers look like
/// one reliable call.
///
/// Long-lived and shared: all methods take `&self`, and the manager is
/// `Send + Sync`. Construct it with [`ProviderResilienceManager::builder`].
pub struct ProviderResilienceManager {
    slots: Vec<ProviderSlot>,
    pool: ConnectionPool,
    cache: Arc<ResponseCache>,
    policy: CachePolicy,
}

impl ProviderResilienceManager {
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::new()
    }

    pub(crate) fn from_parts(
        slots: Vec<ProviderSlot>,
        pool: ConnectionPool,
        cache: ResponseCache,
        policy: CachePolicy,
    ) -> Self {
        Self {
            slots,
            pool,
            cache: Arc::new(cache),
            policy,
        }
    }

    /// Provider names in fallback order.
    pub fn provider_names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.name()).collect()
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Run `request` through the cache and the fallback chain.
    ///
    /// Returns the first successful response, a propagated
    /// [`SkirnirError::NonRetryable`], [`SkirnirError::Cancelled`], or
    /// [`SkirnirError::AllProvidersExhausted`] with one entry per provider.
    #[instrument(skip(self, request, deadline), fields(model = %request.model))]
    pub async fn execute(&self, request: &Request, deadline: Deadline) -> Result<Response> {
        let start = Instant::now();
        let result = self.run_chain(request, &deadline).await;
        let status = match &result {
            Ok(r) if r.cached => "cached",
            Ok(_) => "ok",
            Err(SkirnirError::NonRetryable { .. }) => "non_retryable",
            Err(SkirnirError::AllProvidersExhausted { .. }) => "exhausted",
            Err(SkirnirError::Cancelled) => "cancelled",
            Err(_) => "error",
        };
        ::metrics::counter!(telemetry::REQUESTS_TOTAL, "status" => status).increment(1);
        ::metrics::histogram!(telemetry::REQUEST_DURATION_SECONDS, "status" => status)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn run_chain(&self, request: &Request, deadline: &Deadline) -> Result<Response> {
        if deadline.is_cancelled() {
            return Err(SkirnirError::Cancelled);
        }

        let fingerprint = if self.policy.is_cacheable(request) {
            Some(Fingerprint::of(request)?)
        } else {
            None
        };
        if let Some(fp) = &fingerprint
            && let Some(hit) = self.lookup(fp)
        {
            if let Some(slot) = self.slots.iter().find(|s| s.name() == hit.provider) {
                bump(&slot.counters.cache_hits);
            }
            debug!(provider = %hit.provider, fingerprint = %fp, "served from cache");
            return Ok(Response {
                provider: hit.provider,
                body: hit.body,
                cached: true,
                attempts: 0,
            });
        }

        let mut call = CallState::default();
        for (idx, slot) in self.slots.iter().enumerate() {
            if deadline.is_cancelled() {
                return Err(SkirnirError::Cancelled);
            }
            if deadline.is_expired() {
                for skipped in &self.slots[idx..] {
                    call.failures.push(skipped.failure(
                        FailureKind::DeadlineExceeded,
                        "deadline expired before this provider was tried",
                        0,
                    ));
                }
                break;
            }

            match self.try_provider(slot, request, deadline, &mut call).await {
                Outcome::Success(body) => {
                    if let Some(fp) = fingerprint {
                        self.store(slot, request, fp, &body);
                    }
                    return Ok(Response {
                        provider: slot.name().to_owned(),
                        body,
                        cached: false,
                        attempts: call.attempts,
                    });
                }
                Outcome::Fallback(failure) => {
                    debug!(
                        provider = %failure.provider,
                        kind = %failure.kind,
                        error = %failure.message,
                        "falling back to next provider"
                    );
                    ::metrics::counter!(telemetry::FALLBACKS_TOTAL,
                        "provider" => failure.provider.clone(),
                        "reason" => failure.kind.as_str(),
                    )
                    .increment(1);
                    call.failures.push(failure);
                }
                Outcome::Abort(err) => return Err(err),
            }
        }

        warn!(
            failures = call.failures.len(),
            attempts = call.attempts,
            "all providers exhausted"
        );
        Err(SkirnirError::AllProvidersExhausted {
            failures: call.failures,
        })
    }

    fn lookup(&self, fp: &Fingerprint) -> Option<CachedBody> {
        match self.cache.get::<CachedBody>(fp) {
            Ok(hit) => hit,
            Err(e) => {
                warn!(fingerprint = %fp, error = %e, "dropping undecodable cache entry");
                self.cache.remove(fp);
                None
            }
        }
    }

    fn store(&self, slot: &ProviderSlot, request: &Request, fp: Fingerprint, body: &Value) {
        let cache_config = &slot.endpoint.config.cache;
        if cache_config
            .policy
            .as_ref()
            .is_some_and(|p| !p.is_cacheable(request))
        {
            return;
        }
        let entry = CachedBody {
            provider: slot.name().to_owned(),
            body: body.clone(),
        };
        if let Err(e) = self.cache.put_with_threshold(
            fp,
            &entry,
            cache_config.ttl,
            cache_config.compression_threshold,
        ) {
            warn!(provider = %slot.name(), error = %e, "failed to cache response");
        }
    }

    /// Breaker, limiter, pool, invoke; repeated for connection faults up to
    /// the provider's retry budget.
    async fn try_provider(
        &self,
        slot: &ProviderSlot,
        request: &Request,
        deadline: &Deadline,
        call: &mut CallState,
    ) -> Outcome {
        let config = &slot.endpoint.config;
        let max_attempts = config.retry.max_attempts.max(1);
        let mut attempts = 0u32;

        loop {
            let permit = match slot.breaker.try_acquire() {
                Ok(permit) => permit,
                Err(e) => {
                    bump(&slot.counters.skipped_circuit_open);
                    return Outcome::Fallback(transient_failure(&e, attempts));
                }
            };

            if let Err(e) = slot.limiter.wait_acquire(1, deadline).await {
                drop(permit);
                if matches!(e, SkirnirError::Cancelled) {
                    return Outcome::Abort(e);
                }
                bump(&slot.counters.skipped_rate_limited);
                return Outcome::Fallback(transient_failure(&e, attempts));
            }

            // The per-attempt cap covers the pool wait and the call itself.
            let attempt = deadline.capped(config.request_timeout);
            let conn = match self.pool.acquire(&slot.endpoint, &attempt).await {
                Ok(conn) => conn,
                Err(SkirnirError::ConnectionFailure { message, .. }) => {
                    // Could not open a connection at all: a connection fault.
                    attempts += 1;
                    call.attempts += 1;
                    bump(&slot.counters.attempts);
                    bump(&slot.counters.connection_failures);
                    record_attempt(slot, "connection");
                    let err = ClassifiedError::connection(message);
                    if config.failure_classifier.counts(&err) {
                        permit.failure();
                    } else {
                        permit.ignore();
                    }
                    match self.backoff(slot, &err, attempts, max_attempts, deadline).await {
                        Some(Ok(())) => continue,
                        Some(Err(abort)) => return abort,
                        None => {
                            return Outcome::Fallback(slot.failure(
                                FailureKind::ConnectionFailure,
                                err.message,
                                attempts,
                            ));
                        }
                    }
                }
                Err(e @ SkirnirError::PoolExhausted { .. }) => {
                    drop(permit);
                    bump(&slot.counters.skipped_pool_exhausted);
                    return Outcome::Fallback(transient_failure(&e, attempts));
                }
                Err(e) => {
                    drop(permit);
                    return Outcome::Abort(e);
                }
            };

            attempts += 1;
            call.attempts += 1;
            bump(&slot.counters.attempts);

            let started = Instant::now();
            let result = attempt
                .run(slot.invoker.invoke(request, &conn, attempt.instant()))
                .await;

            match result {
                Bounded::Done(Ok(body)) => {
                    conn.release(true);
                    permit.success();
                    slot.latency.record(started.elapsed());
                    bump(&slot.counters.successes);
                    record_attempt(slot, "ok");
                    return Outcome::Success(body);
                }
                Bounded::Done(Err(err)) if !err.is_retryable() => {
                    conn.release(true);
                    permit.ignore();
                    bump(&slot.counters.non_retryable);
                    record_attempt(slot, "non_retryable");
                    warn!(provider = %slot.name(), error = %err, "non-retryable provider error");
                    return Outcome::Abort(SkirnirError::NonRetryable {
                        provider: slot.name().to_owned(),
                        message: err.message,
                    });
                }
                Bounded::Done(Err(err)) => {
                    conn.release(!err.is_connection_fault());
                    if config.failure_classifier.counts(&err) {
                        permit.failure();
                    } else {
                        permit.ignore();
                    }
                    if !err.is_connection_fault() {
                        bump(&slot.counters.transient_failures);
                        record_attempt(slot, "transient");
                        return Outcome::Fallback(slot.failure(
                            FailureKind::Transient,
                            err.message,
                            attempts,
                        ));
                    }
                    bump(&slot.counters.connection_failures);
                    record_attempt(slot, "connection");
                    match self.backoff(slot, &err, attempts, max_attempts, deadline).await {
                        Some(Ok(())) => continue,
                        Some(Err(abort)) => return abort,
                        None => {
                            return Outcome::Fallback(slot.failure(
                                FailureKind::ConnectionFailure,
                                err.message,
                                attempts,
                            ));
                        }
                    }
                }
                Bounded::TimedOut => {
                    // The request may still be in flight on this connection.
                    conn.release(false);
                    bump(&slot.counters.timeouts);
                    record_attempt(slot, "timeout");
                    let err = ClassifiedError::transient(format!(
                        "no response after {:?}",
                        started.elapsed()
                    ));
                    let kind = if deadline.is_expired() {
                        FailureKind::DeadlineExceeded
                    } else {
                        FailureKind::Timeout
                    };
                    // A cut-off by the caller's deadline is not charged to the breaker.
                    if kind == FailureKind::Timeout && config.failure_classifier.counts(&err) {
                        permit.failure();
                    } else {
                        permit.ignore();
                    }
                    return Outcome::Fallback(slot.failure(kind, err.message, attempts));
                }
                Bounded::Cancelled => {
                    conn.release(false);
                    drop(permit);
                    return Outcome::Abort(SkirnirError::Cancelled);
                }
            }
        }
    }

    /// Sleep before retrying a connection fault on the same provider.
    ///
    /// `None` when the retry budget is spent, the fault just opened the
    /// breaker, or the backoff would outlive the deadline; `Some(Err(_))`
    /// when the caller cancelled meanwhile.
    async fn backoff(
        &self,
        slot: &ProviderSlot,
        err: &ClassifiedError,
        attempts: u32,
        max_attempts: u32,
        deadline: &Deadline,
    ) -> Option<std::result::Result<(), Outcome>> {
        if attempts >= max_attempts || slot.breaker.phase() == CircuitPhase::Open {
            return None;
        }
        let delay = slot.endpoint.config.retry.backoff(attempts - 1, err.retry_after);
        if !deadline.fits(delay) {
            return None;
        }
        bump(&slot.counters.retries);
        ::metrics::counter!(telemetry::RETRIES_TOTAL, "provider" => slot.name().to_owned())
            .increment(1);
        warn!(
            provider = %slot.name(),
            attempt = attempts,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying after connection fault"
        );
        match deadline.run(tokio::time::sleep(delay)).await {
            Bounded::Done(()) => Some(Ok(())),
            Bounded::TimedOut => None,
            Bounded::Cancelled => Some(Err(Outcome::Abort(SkirnirError::Cancelled))),
        }
    }

    /// Health snapshot of every provider plus the shared cache and pool.
    pub fn get_metrics(&self) -> ManagerMetrics {
        let providers = self
            .slots
            .iter()
            .map(|slot| {
                let attempts = slot.counters.snapshot();
                let served = attempts.cache_hits + attempts.successes;
                ProviderMetrics {
                    name: slot.name().to_owned(),
                    circuit: slot.breaker.snapshot(),
                    rate_limiter: slot.limiter.stats(),
                    pool: self.pool.provider_stats(slot.name()).unwrap_or_default(),
                    latency_ms: slot.latency.average().map(|d| d.as_secs_f64() * 1000.0),
                    cache_hit_rate: if served == 0 {
                        0.0
                    } else {
                        attempts.cache_hits as f64 / served as f64
                    },
                    attempts,
                }
            })
            .collect();
        ManagerMetrics {
            providers,
            cache: self.cache.stats(),
            pool: self.pool.stats(),
        }
    }
}

impl std::fmt::Debug for ProviderResilienceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderResilienceManager")
            .field("providers", &self.provider_names())
            .field("policy", &self.policy)
            .finish()
    }
}

fn transient_failure(err: &SkirnirError, attempts: u32) -> ProviderFailure {
    ProviderFailure::from_error(err, attempts).unwrap_or_else(|| {
        ProviderFailure::new(
            err.provider().unwrap_or("unknown"),
            FailureKind::Transient,
            err.to_string(),
            attempts,
        )
    })
}

fn record_attempt(slot: &ProviderSlot, outcome: &'static str) {
    ::metrics::counter!(telemetry::ATTEMPTS_TOTAL,
        "provider" => slot.name().to_owned(),
        "outcome" => outcome,
    )
    .increment(1);
}
