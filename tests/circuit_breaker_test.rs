//! Circuit breaker state machine, driven on paused time.

use std::time::Duration;

use skirnir::resilience::CircuitBreaker;
use skirnir::{CircuitBreakerConfig, CircuitPhase, SkirnirError};

fn breaker(failure_threshold: u32, success_threshold: u32) -> CircuitBreaker {
    CircuitBreaker::new(
        "remote",
        CircuitBreakerConfig::new()
            .failure_threshold(failure_threshold)
            .success_threshold(success_threshold)
            .recovery_timeout(Duration::from_secs(30)),
    )
}

fn trip(cb: &CircuitBreaker) {
    for _ in 0..cb.config().failure_threshold {
        cb.try_acquire().unwrap().failure();
    }
}

#[test]
fn config_defaults() {
    let config = CircuitBreakerConfig::default();
    assert_eq!(config.failure_threshold, 5);
    assert_eq!(config.recovery_timeout, Duration::from_secs(30));
    assert_eq!(config.success_threshold, 1);
}

#[tokio::test(start_paused = true)]
async fn opens_after_consecutive_failures() {
    let cb = breaker(3, 1);
    cb.try_acquire().unwrap().failure();
    cb.try_acquire().unwrap().failure();
    assert_eq!(cb.phase(), CircuitPhase::Closed);
    cb.try_acquire().unwrap().failure();
    assert_eq!(cb.phase(), CircuitPhase::Open);
    assert_eq!(cb.snapshot().times_opened, 1);
}

#[tokio::test(start_paused = true)]
async fn open_rejects_with_remaining_cooldown() {
    let cb = breaker(1, 1);
    trip(&cb);
    tokio::time::advance(Duration::from_secs(10)).await;

    match cb.try_acquire() {
        Err(SkirnirError::CircuitOpen { provider, retry_in }) => {
            assert_eq!(provider, "remote");
            assert_eq!(retry_in, Duration::from_secs(20));
        }
        other => panic!("expected CircuitOpen, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn phase_read_does_not_transition() {
    let cb = breaker(1, 1);
    trip(&cb);
    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(cb.phase(), CircuitPhase::Open);
    assert_eq!(cb.phase(), CircuitPhase::Open);
}

#[tokio::test(start_paused = true)]
async fn full_cycle_closed_open_half_open_closed() {
    let cb = breaker(2, 1);
    trip(&cb);
    assert_eq!(cb.phase(), CircuitPhase::Open);

    tokio::time::advance(Duration::from_secs(30)).await;
    let probe = cb.try_acquire().unwrap();
    assert!(probe.is_probe());
    assert_eq!(cb.phase(), CircuitPhase::HalfOpen);

    probe.success();
    assert_eq!(cb.phase(), CircuitPhase::Closed);
    let snapshot = cb.snapshot();
    assert_eq!(snapshot.failure_count, 0);
    assert_eq!(snapshot.success_count, 0);
}

#[tokio::test(start_paused = true)]
async fn failed_probe_reopens_with_fresh_timer() {
    let cb = breaker(1, 1);
    trip(&cb);
    tokio::time::advance(Duration::from_secs(30)).await;

    cb.try_acquire().unwrap().failure();
    assert_eq!(cb.phase(), CircuitPhase::Open);
    assert_eq!(cb.snapshot().times_opened, 2);

    tokio::time::advance(Duration::from_secs(29)).await;
    assert!(cb.try_acquire().is_err());
    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(cb.try_acquire().unwrap().is_probe());
}

#[tokio::test(start_paused = true)]
async fn half_open_admits_one_probe_at_a_time() {
    let cb = breaker(1, 1);
    trip(&cb);
    tokio::time::advance(Duration::from_secs(30)).await;

    let probe = cb.try_acquire().unwrap();
    match cb.try_acquire() {
        Err(SkirnirError::CircuitOpen { retry_in, .. }) => assert_eq!(retry_in, Duration::ZERO),
        other => panic!("expected CircuitOpen, got {other:?}"),
    }
    probe.success();
    assert!(cb.try_acquire().is_ok());
}

#[tokio::test(start_paused = true)]
async fn success_threshold_needs_several_probes() {
    let cb = breaker(1, 3);
    trip(&cb);
    tokio::time::advance(Duration::from_secs(30)).await;

    cb.try_acquire().unwrap().success();
    cb.try_acquire().unwrap().success();
    assert_eq!(cb.phase(), CircuitPhase::HalfOpen);
    assert_eq!(cb.snapshot().success_count, 2);
    cb.try_acquire().unwrap().success();
    assert_eq!(cb.phase(), CircuitPhase::Closed);
}

#[tokio::test(start_paused = true)]
async fn ignored_outcomes_do_not_count() {
    let cb = breaker(2, 1);
    for _ in 0..10 {
        cb.try_acquire().unwrap().ignore();
    }
    cb.try_acquire().unwrap().failure();
    assert_eq!(cb.phase(), CircuitPhase::Closed);
    assert_eq!(cb.snapshot().failure_count, 1);
}

#[tokio::test(start_paused = true)]
async fn ignored_probe_keeps_half_open() {
    let cb = breaker(1, 1);
    trip(&cb);
    tokio::time::advance(Duration::from_secs(30)).await;

    cb.try_acquire().unwrap().ignore();
    assert_eq!(cb.phase(), CircuitPhase::HalfOpen);
    assert!(cb.try_acquire().unwrap().is_probe());
}
