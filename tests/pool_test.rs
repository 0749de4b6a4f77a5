//! Connection pool limits, reuse and keepalive, on paused time.
//!
//! Endpoints use loopback IP literals, so no lookup or socket is needed to
//! hand out a connection.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use skirnir::pool::ConnectionPool;
use skirnir::providers::{ProviderConfig, ProviderEndpoint};
use skirnir::{Deadline, PoolConfig, PoolLimits, SkirnirError};

fn endpoint(name: &str, port: u16, limits: PoolLimits) -> ProviderEndpoint {
    ProviderEndpoint::new(name, &format!("http://127.0.0.1:{port}"))
        .unwrap()
        .with_config(ProviderConfig::new().pool(limits))
}

fn soon() -> Deadline {
    Deadline::after(Duration::from_millis(200))
}

#[tokio::test(start_paused = true)]
async fn healthy_release_is_reused() {
    let pool = ConnectionPool::new(PoolConfig::default());
    let ep = endpoint("local", 11434, PoolLimits::default());

    let first = pool.acquire(&ep, &soon()).await.unwrap();
    let id = first.id();
    assert_eq!(first.remote_addr().to_string(), "127.0.0.1:11434");
    assert_eq!(first.base_url().as_str(), "http://127.0.0.1:11434/");
    first.release(true);

    let second = pool.acquire(&ep, &soon()).await.unwrap();
    assert_eq!(second.id(), id);
    assert_eq!(second.uses(), 1);

    let stats = pool.provider_stats("local").unwrap();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.acquired, 2);
    assert_eq!(stats.active, 1);
}

#[tokio::test(start_paused = true)]
async fn handle_reports_the_checkout_it_was_given() {
    let pool = ConnectionPool::new(PoolConfig::default());
    let ep = endpoint("local", 11434, PoolLimits::default());

    for expected_uses in 0..3 {
        let conn = pool.acquire(&ep, &soon()).await.unwrap();
        assert_eq!(conn.uses(), expected_uses);
        assert_eq!(conn.provider(), "local");
        assert!(format!("{conn:?}").contains("local"));
        conn.release(true);
    }
    assert_eq!(pool.provider_stats("local").unwrap().created, 1);
}

#[tokio::test(start_paused = true)]
async fn unhealthy_release_closes_connection() {
    let pool = ConnectionPool::new(PoolConfig::default());
    let ep = endpoint("local", 11434, PoolLimits::default());

    let first = pool.acquire(&ep, &soon()).await.unwrap();
    let id = first.id();
    first.release(false);

    let second = pool.acquire(&ep, &soon()).await.unwrap();
    assert_ne!(second.id(), id);
    let stats = pool.provider_stats("local").unwrap();
    assert_eq!(stats.closed, 1);
    assert_eq!(stats.created, 2);
}

#[tokio::test(start_paused = true)]
async fn dropped_handle_counts_as_unhealthy() {
    let pool = ConnectionPool::new(PoolConfig::default());
    let ep = endpoint("local", 11434, PoolLimits::default());

    drop(pool.acquire(&ep, &soon()).await.unwrap());

    let stats = pool.provider_stats("local").unwrap();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.closed, 1);
}

#[tokio::test(start_paused = true)]
async fn per_provider_limit_times_out_at_deadline() {
    let pool = ConnectionPool::new(PoolConfig::default());
    let ep = endpoint("local", 11434, PoolLimits::new().max_connections(1));

    let _held = pool.acquire(&ep, &soon()).await.unwrap();
    let start = Instant::now();
    let err = pool.acquire(&ep, &soon()).await.unwrap_err();

    assert_eq!(start.elapsed(), Duration::from_millis(200));
    match err {
        SkirnirError::PoolExhausted { provider, waited } => {
            assert_eq!(provider, "local");
            assert_eq!(waited, Duration::from_millis(200));
        }
        other => panic!("expected PoolExhausted, got {other:?}"),
    }
    assert_eq!(pool.provider_stats("local").unwrap().failed, 1);
}

#[tokio::test(start_paused = true)]
async fn waiter_is_served_when_connection_returns() {
    let pool = ConnectionPool::new(PoolConfig::default());
    let ep = endpoint("local", 11434, PoolLimits::new().max_connections(1));

    let held = pool.acquire(&ep, &soon()).await.unwrap();
    let id = held.id();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        held.release(true);
    });

    let start = Instant::now();
    let conn = pool
        .acquire(&ep, &Deadline::after(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(start.elapsed(), Duration::from_millis(50));
    assert_eq!(conn.id(), id);
}

#[tokio::test(start_paused = true)]
async fn per_host_limit_is_shared_between_providers() {
    let pool = ConnectionPool::new(PoolConfig::default());
    let limits = PoolLimits::new().max_per_host(1);
    let chat = endpoint("chat", 8080, limits.clone());
    let embed = endpoint("embed", 8080, limits);

    let _held = pool.acquire(&chat, &soon()).await.unwrap();
    let err = pool.acquire(&embed, &soon()).await.unwrap_err();
    assert!(matches!(err, SkirnirError::PoolExhausted { ref provider, .. } if provider == "embed"));
}

#[tokio::test(start_paused = true)]
async fn global_limit_spans_all_providers() {
    let pool = ConnectionPool::new(PoolConfig::new().max_total(2));
    let a = endpoint("a", 9001, PoolLimits::default());
    let b = endpoint("b", 9002, PoolLimits::default());
    let c = endpoint("c", 9003, PoolLimits::default());

    let _a = pool.acquire(&a, &soon()).await.unwrap();
    let _b = pool.acquire(&b, &soon()).await.unwrap();
    assert!(pool.acquire(&c, &soon()).await.is_err());
    assert_eq!(pool.stats().active, 2);
}

#[tokio::test(start_paused = true)]
async fn idle_connections_past_keepalive_are_reaped() {
    let pool = ConnectionPool::new(PoolConfig::default());
    let ep = endpoint(
        "local",
        11434,
        PoolLimits::new().keepalive_timeout(Duration::from_secs(5)),
    );

    let one = pool.acquire(&ep, &soon()).await.unwrap();
    let two = pool.acquire(&ep, &soon()).await.unwrap();
    one.release(true);
    tokio::time::advance(Duration::from_secs(3)).await;
    two.release(true);
    tokio::time::advance(Duration::from_secs(3)).await;

    assert_eq!(pool.reap_idle(), 1);
    let stats = pool.provider_stats("local").unwrap();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.closed, 1);
}

#[tokio::test(start_paused = true)]
async fn stale_idle_connection_is_never_handed_out() {
    let pool = ConnectionPool::new(PoolConfig::default());
    let ep = endpoint(
        "local",
        11434,
        PoolLimits::new().keepalive_timeout(Duration::from_secs(5)),
    );

    let first = pool.acquire(&ep, &soon()).await.unwrap();
    let id = first.id();
    first.release(true);
    tokio::time::advance(Duration::from_secs(5)).await;

    let second = pool.acquire(&ep, &soon()).await.unwrap();
    assert_ne!(second.id(), id);
    assert_eq!(pool.provider_stats("local").unwrap().closed, 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_acquire() {
    let pool = ConnectionPool::new(PoolConfig::default());
    let ep = endpoint("local", 11434, PoolLimits::new().max_connections(1));
    let _held = pool.acquire(&ep, &soon()).await.unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let deadline = Deadline::after(Duration::from_secs(10)).with_cancellation(token);
    let err = pool.acquire(&ep, &deadline).await.unwrap_err();
    assert!(matches!(err, SkirnirError::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn stats_sum_over_providers() {
    let pool = ConnectionPool::new(PoolConfig::default());
    let a = endpoint("a", 9001, PoolLimits::default());
    let b = endpoint("b", 9002, PoolLimits::default());

    pool.acquire(&a, &soon()).await.unwrap().release(true);
    let _b = pool.acquire(&b, &soon()).await.unwrap();

    let stats = pool.stats();
    assert_eq!(stats.acquired, 2);
    assert_eq!(stats.active, 1);
    assert_eq!(stats.idle, 1);
    assert!(pool.provider_stats("missing").is_none());
}
