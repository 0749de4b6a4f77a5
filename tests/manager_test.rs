//! Integration tests for the fallback chain in `ProviderResilienceManager`.
//!
//! All tests run on paused tokio time, so deadlines, per-attempt timeouts and
//! backoff delays are exact.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use common::{ScriptedInvoker, Step, cold_request, endpoint, hot_request, quiet_config};
use skirnir::providers::FailureClassifier;
use skirnir::{
    CacheConfig, CachePolicy, CircuitBreakerConfig, CircuitPhase, Deadline, FailureKind,
    PoolLimits, ProviderResilienceManager, RateLimitConfig, RetryConfig, SkirnirError,
};

fn deadline(secs: u64) -> Deadline {
    Deadline::after(Duration::from_secs(secs))
}

// ============================================================================
// Fallback order
// ============================================================================

#[tokio::test(start_paused = true)]
async fn first_healthy_provider_answers() {
    let a = Arc::new(ScriptedInvoker::ok("a"));
    let b = Arc::new(ScriptedInvoker::ok("b"));
    let manager = ProviderResilienceManager::builder()
        .provider(endpoint("a", 9001, quiet_config()), a.clone())
        .provider(endpoint("b", 9002, quiet_config()), b.clone())
        .build()
        .unwrap();

    let response = manager.execute(&hot_request("hi"), deadline(5)).await.unwrap();

    assert_eq!(response.provider, "a");
    assert_eq!(response.body["provider"], "a");
    assert!(!response.cached);
    assert_eq!(response.attempts, 1);
    assert_eq!(b.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn priority_decides_order_not_registration() {
    let a = Arc::new(ScriptedInvoker::ok("a"));
    let b = Arc::new(ScriptedInvoker::ok("b"));
    let manager = ProviderResilienceManager::builder()
        .provider(endpoint("a", 9001, quiet_config().priority(5)), a.clone())
        .provider(endpoint("b", 9002, quiet_config().priority(1)), b.clone())
        .build()
        .unwrap();

    assert_eq!(manager.provider_names(), ["b", "a"]);
    let response = manager.execute(&hot_request("hi"), deadline(5)).await.unwrap();
    assert_eq!(response.provider, "b");
    assert_eq!(a.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn preferred_provider_moves_to_front() {
    let manager = ProviderResilienceManager::builder()
        .provider(endpoint("a", 9001, quiet_config()), ScriptedInvoker::ok("a"))
        .provider(endpoint("b", 9002, quiet_config()), ScriptedInvoker::ok("b"))
        .provider(endpoint("c", 9003, quiet_config()), ScriptedInvoker::ok("c"))
        .prefer("c")
        .build()
        .unwrap();

    assert_eq!(manager.provider_names(), ["c", "a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_falls_back_to_next_provider() {
    let a = Arc::new(ScriptedInvoker::always("a", Step::Transient));
    let b = Arc::new(ScriptedInvoker::ok("b"));
    let manager = ProviderResilienceManager::builder()
        .provider(endpoint("a", 9001, quiet_config()), a.clone())
        .provider(endpoint("b", 9002, quiet_config()), b.clone())
        .build()
        .unwrap();

    let response = manager.execute(&hot_request("hi"), deadline(5)).await.unwrap();

    assert_eq!(response.provider, "b");
    assert_eq!(response.attempts, 2);
    assert_eq!(a.calls(), 1);
    let metrics = manager.get_metrics();
    let a_metrics = metrics.provider("a").unwrap();
    assert_eq!(a_metrics.attempts.transient_failures, 1);
    assert_eq!(a_metrics.circuit.failure_count, 1);
}

#[tokio::test(start_paused = true)]
async fn non_retryable_error_stops_the_chain() {
    let a = Arc::new(ScriptedInvoker::always("a", Step::Permanent));
    let b = Arc::new(ScriptedInvoker::ok("b"));
    let manager = ProviderResilienceManager::builder()
        .provider(endpoint("a", 9001, quiet_config()), a.clone())
        .provider(endpoint("b", 9002, quiet_config()), b.clone())
        .build()
        .unwrap();

    let err = manager
        .execute(&hot_request("hi"), deadline(5))
        .await
        .unwrap_err();

    match err {
        SkirnirError::NonRetryable { provider, message } => {
            assert_eq!(provider, "a");
            assert_eq!(message, "invalid model");
        }
        other => panic!("expected NonRetryable, got {other:?}"),
    }
    assert_eq!(b.calls(), 0);
    // Permanent errors say nothing about provider health.
    let metrics = manager.get_metrics();
    assert_eq!(metrics.provider("a").unwrap().circuit.failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_chain_reports_every_provider() {
    let manager = ProviderResilienceManager::builder()
        .provider(
            endpoint("a", 9001, quiet_config()),
            ScriptedInvoker::always("a", Step::Transient),
        )
        .provider(
            endpoint("b", 9002, quiet_config().retry(RetryConfig::disabled())),
            ScriptedInvoker::always("b", Step::Connection),
        )
        .build()
        .unwrap();

    let err = manager
        .execute(&hot_request("hi"), deadline(5))
        .await
        .unwrap_err();

    let failures = err.failures();
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[0].provider, "a");
    assert_eq!(failures[0].kind, FailureKind::Transient);
    assert_eq!(failures[1].provider, "b");
    assert_eq!(failures[1].kind, FailureKind::ConnectionFailure);
    assert!(matches!(err, SkirnirError::AllProvidersExhausted { .. }));
}

// ============================================================================
// Connection-fault retries
// ============================================================================

#[tokio::test(start_paused = true)]
async fn connection_fault_is_retried_on_same_provider() {
    let a = Arc::new(ScriptedInvoker::script("a", [Step::Connection], Step::Ok));
    let b = Arc::new(ScriptedInvoker::ok("b"));
    let manager = ProviderResilienceManager::builder()
        .provider(endpoint("a", 9001, quiet_config()), a.clone())
        .provider(endpoint("b", 9002, quiet_config()), b.clone())
        .build()
        .unwrap();

    let start = Instant::now();
    let response = manager.execute(&hot_request("hi"), deadline(5)).await.unwrap();

    assert_eq!(response.provider, "a");
    assert_eq!(response.attempts, 2);
    assert_eq!(start.elapsed(), Duration::from_millis(10));
    assert_eq!(b.calls(), 0);
    let metrics = manager.get_metrics();
    let a_metrics = metrics.provider("a").unwrap();
    assert_eq!(a_metrics.attempts.retries, 1);
    assert_eq!(a_metrics.attempts.connection_failures, 1);
    // The retry went through the limiter like a fresh call.
    assert_eq!(a_metrics.rate_limiter.granted, 2);
}

#[tokio::test(start_paused = true)]
async fn retry_budget_is_bounded_then_chain_advances() {
    let a = Arc::new(ScriptedInvoker::always("a", Step::Connection));
    let b = Arc::new(ScriptedInvoker::ok("b"));
    let config = quiet_config().retry(
        RetryConfig::new()
            .max_attempts(3)
            .initial_delay(Duration::from_millis(10))
            .jitter(false),
    );
    let manager = ProviderResilienceManager::builder()
        .provider(endpoint("a", 9001, config), a.clone())
        .provider(endpoint("b", 9002, quiet_config()), b.clone())
        .build()
        .unwrap();

    let start = Instant::now();
    let response = manager.execute(&hot_request("hi"), deadline(5)).await.unwrap();

    assert_eq!(response.provider, "b");
    assert_eq!(a.calls(), 3);
    assert_eq!(response.attempts, 4);
    // 10ms + 20ms of backoff between the three attempts.
    assert_eq!(start.elapsed(), Duration::from_millis(30));
}

#[tokio::test(start_paused = true)]
async fn backoff_that_outlives_the_deadline_is_skipped() {
    let a = Arc::new(ScriptedInvoker::always("a", Step::Connection));
    let config = quiet_config().retry(
        RetryConfig::new()
            .max_attempts(5)
            .initial_delay(Duration::from_secs(10))
            .jitter(false),
    );
    let manager = ProviderResilienceManager::builder()
        .provider(endpoint("a", 9001, config), a.clone())
        .build()
        .unwrap();

    let start = Instant::now();
    let err = manager
        .execute(&hot_request("hi"), deadline(1))
        .await
        .unwrap_err();

    assert_eq!(a.calls(), 1);
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(err.failures()[0].kind, FailureKind::ConnectionFailure);
}

#[tokio::test(start_paused = true)]
async fn connection_fault_that_opens_the_breaker_is_not_retried() {
    let a = Arc::new(ScriptedInvoker::always("a", Step::Connection));
    let config = quiet_config().circuit(CircuitBreakerConfig::new().failure_threshold(1));
    let manager = ProviderResilienceManager::builder()
        .provider(endpoint("a", 9001, config), a.clone())
        .build()
        .unwrap();

    let start = Instant::now();
    let err = manager
        .execute(&hot_request("hi"), deadline(5))
        .await
        .unwrap_err();

    assert_eq!(a.calls(), 1);
    assert_eq!(start.elapsed(), Duration::ZERO);
    let failure = &err.failures()[0];
    assert_eq!(failure.kind, FailureKind::ConnectionFailure);
    assert_eq!(failure.message, "connection reset by peer");
    let metrics = manager.get_metrics();
    let a_metrics = metrics.provider("a").unwrap();
    assert_eq!(a_metrics.circuit.phase, CircuitPhase::Open);
    assert_eq!(a_metrics.attempts.retries, 0);
    assert_eq!(a_metrics.attempts.skipped_circuit_open, 0);
}

// ============================================================================
// Deadlines and cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn per_attempt_timeout_leaves_budget_for_fallback() {
    let a = Arc::new(ScriptedInvoker::always("a", Step::Hang));
    let b = Arc::new(ScriptedInvoker::ok("b"));
    let manager = ProviderResilienceManager::builder()
        .provider(
            endpoint("a", 9001, quiet_config().request_timeout(Duration::from_secs(1))),
            a.clone(),
        )
        .provider(endpoint("b", 9002, quiet_config()), b.clone())
        .build()
        .unwrap();

    let start = Instant::now();
    let response = manager.execute(&hot_request("hi"), deadline(10)).await.unwrap();

    assert_eq!(response.provider, "b");
    assert_eq!(start.elapsed(), Duration::from_secs(1));
    let metrics = manager.get_metrics();
    let a_metrics = metrics.provider("a").unwrap();
    assert_eq!(a_metrics.attempts.timeouts, 1);
    assert_eq!(a_metrics.circuit.failure_count, 1);
    // The abandoned connection is not reused.
    assert_eq!(a_metrics.pool.closed, 1);
    assert_eq!(a_metrics.pool.idle, 0);
}

#[tokio::test(start_paused = true)]
async fn classifier_can_exempt_timeouts_from_the_breaker() {
    let a = Arc::new(ScriptedInvoker::always("a", Step::Hang));
    let b = Arc::new(ScriptedInvoker::ok("b"));
    let config = quiet_config()
        .request_timeout(Duration::from_millis(100))
        .circuit(CircuitBreakerConfig::new().failure_threshold(1))
        .failure_classifier(FailureClassifier::new(|_| false));
    let manager = ProviderResilienceManager::builder()
        .provider(endpoint("a", 9001, config), a.clone())
        .provider(endpoint("b", 9002, quiet_config()), b.clone())
        .build()
        .unwrap();

    let response = manager.execute(&hot_request("hi"), deadline(5)).await.unwrap();

    assert_eq!(response.provider, "b");
    let metrics = manager.get_metrics();
    let a_metrics = metrics.provider("a").unwrap();
    assert_eq!(a_metrics.attempts.timeouts, 1);
    assert_eq!(a_metrics.circuit.phase, CircuitPhase::Closed);
    assert_eq!(a_metrics.circuit.failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn short_caller_deadline_does_not_trip_the_breaker() {
    let a = Arc::new(ScriptedInvoker::always("a", Step::Slow(Duration::from_millis(50))));
    let config = quiet_config().circuit(CircuitBreakerConfig::new().failure_threshold(2));
    let manager = ProviderResilienceManager::builder()
        .provider(endpoint("a", 9001, config), a.clone())
        .build()
        .unwrap();

    for i in 0..2 {
        let err = manager
            .execute(
                &hot_request(&i.to_string()),
                Deadline::after(Duration::from_millis(10)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.failures()[0].kind, FailureKind::DeadlineExceeded);
    }

    let a_metrics = manager.get_metrics().provider("a").unwrap().clone();
    assert_eq!(a_metrics.attempts.timeouts, 2);
    assert_eq!(a_metrics.circuit.phase, CircuitPhase::Closed);
    assert_eq!(a_metrics.circuit.failure_count, 0);

    // Other callers still reach the provider.
    let response = manager.execute(&hot_request("patient"), deadline(5)).await.unwrap();
    assert_eq!(response.provider, "a");
}

#[tokio::test(start_paused = true)]
async fn overall_deadline_bounds_the_whole_call() {
    let a = Arc::new(ScriptedInvoker::always("a", Step::Hang));
    let b = Arc::new(ScriptedInvoker::ok("b"));
    let manager = ProviderResilienceManager::builder()
        .provider(endpoint("a", 9001, quiet_config()), a.clone())
        .provider(endpoint("b", 9002, quiet_config()), b.clone())
        .build()
        .unwrap();

    let start = Instant::now();
    let err = manager
        .execute(&hot_request("hi"), Deadline::after(Duration::from_millis(500)))
        .await
        .unwrap_err();

    assert_eq!(start.elapsed(), Duration::from_millis(500));
    assert_eq!(b.calls(), 0);
    let kinds: Vec<_> = err.failures().iter().map(|f| (f.provider.as_str(), f.kind)).collect();
    assert_eq!(
        kinds,
        [
            ("a", FailureKind::DeadlineExceeded),
            ("b", FailureKind::DeadlineExceeded)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn cancellation_aborts_without_trying_further_providers() {
    let a = Arc::new(ScriptedInvoker::always("a", Step::Hang));
    let b = Arc::new(ScriptedInvoker::ok("b"));
    let manager = ProviderResilienceManager::builder()
        .provider(endpoint("a", 9001, quiet_config()), a.clone())
        .provider(endpoint("b", 9002, quiet_config()), b.clone())
        .build()
        .unwrap();

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let start = Instant::now();
    let err = manager
        .execute(&hot_request("hi"), deadline(10).with_cancellation(token))
        .await
        .unwrap_err();

    assert!(matches!(err, SkirnirError::Cancelled));
    assert_eq!(start.elapsed(), Duration::from_millis(100));
    assert_eq!(b.calls(), 0);
    let metrics = manager.get_metrics();
    let a_metrics = metrics.provider("a").unwrap();
    // Neither a success nor a failure for the breaker.
    assert_eq!(a_metrics.circuit.failure_count, 0);
    assert_eq!(a_metrics.pool.active, 0);
}

#[tokio::test(start_paused = true)]
async fn already_cancelled_call_touches_nothing() {
    let a = Arc::new(ScriptedInvoker::ok("a"));
    let manager = ProviderResilienceManager::builder()
        .provider(endpoint("a", 9001, quiet_config()), a.clone())
        .build()
        .unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let err = manager
        .execute(&cold_request("hi"), deadline(10).with_cancellation(token))
        .await
        .unwrap_err();

    assert!(matches!(err, SkirnirError::Cancelled));
    assert_eq!(a.calls(), 0);
}

// ============================================================================
// Admission control in the chain
// ============================================================================

#[tokio::test(start_paused = true)]
async fn rate_limited_provider_is_skipped_when_deficit_exceeds_budget() {
    let a = Arc::new(ScriptedInvoker::ok("a"));
    let b = Arc::new(ScriptedInvoker::ok("b"));
    let slow_bucket = RateLimitConfig::new()
        .tokens_per_second(0.1)
        .burst_capacity(1);
    let manager = ProviderResilienceManager::builder()
        .provider(endpoint("a", 9001, quiet_config().rate_limit(slow_bucket)), a.clone())
        .provider(endpoint("b", 9002, quiet_config()), b.clone())
        .build()
        .unwrap();

    let first = manager.execute(&hot_request("1"), deadline(5)).await.unwrap();
    let start = Instant::now();
    let second = manager.execute(&hot_request("2"), deadline(5)).await.unwrap();

    assert_eq!(first.provider, "a");
    assert_eq!(second.provider, "b");
    // A 10s refill does not fit a 5s budget, so no time was spent waiting.
    assert_eq!(start.elapsed(), Duration::ZERO);
    let metrics = manager.get_metrics();
    assert_eq!(metrics.provider("a").unwrap().attempts.skipped_rate_limited, 1);
}

#[tokio::test(start_paused = true)]
async fn rate_limiter_waits_when_deficit_fits_budget() {
    let a = Arc::new(ScriptedInvoker::ok("a"));
    let bucket = RateLimitConfig::new()
        .tokens_per_second(10.0)
        .burst_capacity(1);
    let manager = ProviderResilienceManager::builder()
        .provider(endpoint("a", 9001, quiet_config().rate_limit(bucket)), a.clone())
        .build()
        .unwrap();

    manager.execute(&hot_request("1"), deadline(5)).await.unwrap();
    let start = Instant::now();
    let second = manager.execute(&hot_request("2"), deadline(5)).await.unwrap();

    assert_eq!(second.provider, "a");
    assert_eq!(start.elapsed(), Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn open_circuit_is_skipped_then_probed_after_recovery() {
    let a = Arc::new(ScriptedInvoker::script(
        "a",
        [Step::Transient, Step::Transient],
        Step::Ok,
    ));
    let b = Arc::new(ScriptedInvoker::ok("b"));
    let circuit = CircuitBreakerConfig::new()
        .failure_threshold(2)
        .recovery_timeout(Duration::from_secs(30));
    let manager = ProviderResilienceManager::builder()
        .provider(endpoint("a", 9001, quiet_config().circuit(circuit)), a.clone())
        .provider(endpoint("b", 9002, quiet_config()), b.clone())
        .build()
        .unwrap();

    for i in 0..3 {
        let response = manager
            .execute(&hot_request(&i.to_string()), deadline(5))
            .await
            .unwrap();
        assert_eq!(response.provider, "b");
    }
    assert_eq!(a.calls(), 2);
    let metrics = manager.get_metrics();
    let a_metrics = metrics.provider("a").unwrap();
    assert_eq!(a_metrics.circuit.phase, CircuitPhase::Open);
    assert_eq!(a_metrics.attempts.skipped_circuit_open, 1);

    tokio::time::advance(Duration::from_secs(30)).await;
    let response = manager.execute(&hot_request("probe"), deadline(5)).await.unwrap();
    assert_eq!(response.provider, "a");
    assert_eq!(
        manager.get_metrics().provider("a").unwrap().circuit.phase,
        CircuitPhase::Closed
    );
}

/// Three providers with burst 2; A fails three times in a row and opens.
/// A concurrent batch afterwards must be served by B or C without touching A.
#[tokio::test(start_paused = true)]
async fn failing_provider_is_isolated_from_concurrent_batch() {
    let a = Arc::new(ScriptedInvoker::always("a", Step::Transient));
    let b = Arc::new(ScriptedInvoker::ok("b"));
    let c = Arc::new(ScriptedInvoker::ok("c"));
    let bucket = RateLimitConfig::new()
        .tokens_per_second(10.0)
        .burst_capacity(2);
    let circuit = CircuitBreakerConfig::new().failure_threshold(3);
    let config = quiet_config().rate_limit(bucket).circuit(circuit);
    let manager = Arc::new(
        ProviderResilienceManager::builder()
            .provider(endpoint("a", 9001, config.clone()), a.clone())
            .provider(endpoint("b", 9002, config.clone()), b.clone())
            .provider(endpoint("c", 9003, config), c.clone())
            .build()
            .unwrap(),
    );

    for i in 0..3 {
        let response = manager
            .execute(&hot_request(&format!("warmup {i}")), deadline(5))
            .await
            .unwrap();
        assert_ne!(response.provider, "a");
    }
    assert_eq!(a.calls(), 3);
    assert_eq!(
        manager.get_metrics().provider("a").unwrap().circuit.phase,
        CircuitPhase::Open
    );

    let batch = (0..4).map(|i| {
        let manager = manager.clone();
        async move {
            manager
                .execute(&hot_request(&format!("batch {i}")), deadline(5))
                .await
        }
    });
    for result in join_all(batch).await {
        let response = result.unwrap();
        assert!(response.provider == "b" || response.provider == "c");
    }

    assert_eq!(a.calls(), 3);
    let metrics = manager.get_metrics();
    let a_metrics = metrics.provider("a").unwrap();
    assert_eq!(a_metrics.circuit.phase, CircuitPhase::Open);
    assert_eq!(a_metrics.attempts.skipped_circuit_open, 4);
    assert_eq!(b.calls() + c.calls(), 7);
}

#[tokio::test(start_paused = true)]
async fn exhausted_pool_skips_provider_after_request_timeout() {
    let a = Arc::new(ScriptedInvoker::ok("a"));
    let b = Arc::new(ScriptedInvoker::ok("b"));
    let a_config = quiet_config()
        .pool(PoolLimits::new().max_connections(1))
        .request_timeout(Duration::from_secs(1));
    let manager = ProviderResilienceManager::builder()
        .provider(endpoint("a", 9001, a_config.clone()), a.clone())
        .provider(endpoint("b", 9002, quiet_config()), b.clone())
        .build()
        .unwrap();

    // Hold the only connection to A.
    let held = manager
        .pool()
        .acquire(&endpoint("a", 9001, a_config), &deadline(1))
        .await
        .unwrap();

    let start = Instant::now();
    let response = manager.execute(&hot_request("hi"), deadline(10)).await.unwrap();

    assert_eq!(response.provider, "b");
    assert_eq!(start.elapsed(), Duration::from_secs(1));
    assert_eq!(a.calls(), 0);
    held.release(true);

    let metrics = manager.get_metrics();
    let a_metrics = metrics.provider("a").unwrap();
    assert_eq!(a_metrics.attempts.skipped_pool_exhausted, 1);
    assert_eq!(a_metrics.pool.failed, 1);
    assert_eq!(a_metrics.pool.idle, 1);
    // Pool exhaustion says nothing about provider health.
    assert_eq!(a_metrics.circuit.failure_count, 0);
}

// ============================================================================
// Response cache
// ============================================================================

#[tokio::test(start_paused = true)]
async fn cache_hit_skips_every_provider() {
    let a = Arc::new(ScriptedInvoker::ok("a"));
    let manager = ProviderResilienceManager::builder()
        .provider(endpoint("a", 9001, quiet_config()), a.clone())
        .build()
        .unwrap();

    let first = manager.execute(&cold_request("hi"), deadline(5)).await.unwrap();
    let second = manager.execute(&cold_request("hi"), deadline(5)).await.unwrap();

    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(second.provider, "a");
    assert_eq!(second.body, first.body);
    assert_eq!(second.attempts, 0);
    assert_eq!(a.calls(), 1);

    let metrics = manager.get_metrics();
    assert_eq!(metrics.cache.hits, 1);
    let a_metrics = metrics.provider("a").unwrap();
    assert_eq!(a_metrics.attempts.cache_hits, 1);
    assert_eq!(a_metrics.cache_hit_rate, 0.5);
    // The hit did not consume a token.
    assert_eq!(a_metrics.rate_limiter.granted, 1);
}

#[tokio::test(start_paused = true)]
async fn cache_hit_survives_open_circuit() {
    let a = Arc::new(ScriptedInvoker::script("a", [Step::Ok], Step::Transient));
    let circuit = CircuitBreakerConfig::new().failure_threshold(1);
    let manager = ProviderResilienceManager::builder()
        .provider(endpoint("a", 9001, quiet_config().circuit(circuit)), a.clone())
        .build()
        .unwrap();

    manager.execute(&cold_request("cached"), deadline(5)).await.unwrap();
    manager.execute(&hot_request("fails"), deadline(5)).await.unwrap_err();
    assert_eq!(
        manager.get_metrics().provider("a").unwrap().circuit.phase,
        CircuitPhase::Open
    );

    let response = manager.execute(&cold_request("cached"), deadline(5)).await.unwrap();
    assert!(response.cached);
}

#[tokio::test(start_paused = true)]
async fn uncacheable_requests_always_reach_a_provider() {
    let a = Arc::new(ScriptedInvoker::ok("a"));
    let manager = ProviderResilienceManager::builder()
        .provider(endpoint("a", 9001, quiet_config()), a.clone())
        .build()
        .unwrap();

    for _ in 0..2 {
        manager.execute(&hot_request("hi"), deadline(5)).await.unwrap();
        manager
            .execute(&cold_request("opt out").no_cache(), deadline(5))
            .await
            .unwrap();
    }

    assert_eq!(a.calls(), 4);
    assert!(manager.cache().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cache_entries_expire_after_provider_ttl() {
    let a = Arc::new(ScriptedInvoker::ok("a"));
    let manager = ProviderResilienceManager::builder()
        .provider(
            endpoint("a", 9001, quiet_config().cache_ttl(Duration::from_secs(60))),
            a.clone(),
        )
        .cache_config(CacheConfig::new().default_ttl(Duration::from_secs(3600)))
        .build()
        .unwrap();

    manager.execute(&cold_request("hi"), deadline(5)).await.unwrap();
    tokio::time::advance(Duration::from_secs(61)).await;
    let response = manager.execute(&cold_request("hi"), deadline(5)).await.unwrap();

    assert!(!response.cached);
    assert_eq!(a.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn provider_compression_threshold_overrides_cache_default() {
    let body = json!({ "text": "all work and no play ".repeat(500) });
    let build = |config| {
        ProviderResilienceManager::builder()
            .provider(
                endpoint("a", 9001, config),
                ScriptedInvoker::always("a", Step::Body(body.clone())),
            )
            .cache_config(CacheConfig::new().compression_threshold(usize::MAX))
            .build()
            .unwrap()
    };

    let plain = build(quiet_config());
    plain.execute(&cold_request("hi"), deadline(5)).await.unwrap();
    assert!(plain.cache().stats().size_bytes > 10_000);

    let packed = build(quiet_config().cache_compression_threshold(64));
    packed.execute(&cold_request("hi"), deadline(5)).await.unwrap();
    assert!(packed.cache().stats().size_bytes < 1_000);

    let response = packed.execute(&cold_request("hi"), deadline(5)).await.unwrap();
    assert!(response.cached);
    assert_eq!(response.body, body);
}

#[tokio::test(start_paused = true)]
async fn custom_cache_policy_replaces_temperature_rule() {
    let a = Arc::new(ScriptedInvoker::ok("a"));
    let manager = ProviderResilienceManager::builder()
        .provider(endpoint("a", 9001, quiet_config()), a.clone())
        .cache_policy(CachePolicy::new().predicate(|req| req.model == "test-model"))
        .build()
        .unwrap();

    manager.execute(&hot_request("hi"), deadline(5)).await.unwrap();
    let response = manager.execute(&hot_request("hi"), deadline(5)).await.unwrap();

    assert!(response.cached);
    assert_eq!(a.calls(), 1);
}

// ============================================================================
// Builder validation
// ============================================================================

#[test]
fn builder_rejects_empty_chain() {
    let err = ProviderResilienceManager::builder().build().unwrap_err();
    assert!(matches!(err, SkirnirError::NoProvider));
}

#[test]
fn builder_rejects_duplicate_names() {
    let err = ProviderResilienceManager::builder()
        .provider(endpoint("a", 9001, quiet_config()), ScriptedInvoker::ok("a"))
        .provider(endpoint("a", 9002, quiet_config()), ScriptedInvoker::ok("a"))
        .build()
        .unwrap_err();
    assert!(matches!(err, SkirnirError::Configuration(_)));
}

#[test]
fn builder_rejects_zero_burst() {
    let config = quiet_config().rate_limit(RateLimitConfig::new().burst_capacity(0));
    let err = ProviderResilienceManager::builder()
        .provider(endpoint("a", 9001, config), ScriptedInvoker::ok("a"))
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("burst_capacity"));
}

#[test]
fn builder_rejects_unknown_preferred_provider() {
    let err = ProviderResilienceManager::builder()
        .provider(endpoint("a", 9001, quiet_config()), ScriptedInvoker::ok("a"))
        .prefer("missing")
        .build()
        .unwrap_err();
    assert!(matches!(err, SkirnirError::Configuration(_)));
}
