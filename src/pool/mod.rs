//! Connection pool.
//!
//! Connections are handed out as [`PooledConnection`] handles. A handle is
//! exclusively owned by one call; [`PooledConnection::release`] returns it
//! to its provider's idle set (healthy) or closes it (unhealthy). A handle
//! dropped without an explicit release is treated as unhealthy, so a
//! cancelled call can never leak a half-used connection back into the pool.
//!
//! # Limits
//!
//! Three fair (FIFO) semaphores bound concurrency, acquired in a fixed
//! order so waiters cannot deadlock:
//!
//! 1. per host (`host:port`), sized by the first provider registered for it
//! 2. per provider (`PoolLimits::max_connections`)
//! 3. global (`PoolConfig::max_total`)
//!
//! A waiter that cannot get all three before its deadline fails with
//! [`SkirnirError::PoolExhausted`].
//!
//! # Transport
//!
//! Each connection carries a `reqwest::Client` pinned to the resolved
//! address of its host. Host lookups go through a TTL-bounded DNS cache.

mod dns;

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;
use url::{Host, Url};

use crate::providers::ProviderEndpoint;
use crate::telemetry;
use crate::types::{Bounded, Deadline};
use crate::{Result, SkirnirError};

use dns::DnsCache;

/// Pool-wide settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Connections checked out at once across all providers. Default: 256.
    pub max_total: usize,
    /// How long a host lookup is reused. Default: 60s.
    pub dns_ttl: Duration,
    /// TCP connect timeout for new connections. Default: 10s.
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 256,
            dns_ttl: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_total(mut self, n: usize) -> Self {
        self.max_total = n;
        self
    }

    pub fn dns_ttl(mut self, ttl: Duration) -> Self {
        self.dns_ttl = ttl;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Per-provider limits.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolLimits {
    /// Connections checked out at once for this provider. Default: 32.
    pub max_connections: usize,
    /// Connections checked out at once to this provider's host. Default: 16.
    pub max_per_host: usize,
    /// Idle connections older than this are closed. Default: 90s.
    pub keepalive_timeout: Duration,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_connections: 32,
            max_per_host: 16,
            keepalive_timeout: Duration::from_secs(90),
        }
    }
}

impl PoolLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    pub fn max_per_host(mut self, n: usize) -> Self {
        self.max_per_host = n;
        self
    }

    pub fn keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.keepalive_timeout = timeout;
        self
    }
}

/// Pool counters, per provider or summed over all providers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Handles currently checked out.
    pub active: usize,
    /// Connections parked in the idle set.
    pub idle: usize,
    /// Successful acquisitions.
    pub acquired: u64,
    /// Acquisitions that timed out or could not connect.
    pub failed: u64,
    pub created: u64,
    pub closed: u64,
}

impl PoolStats {
    fn merge(&mut self, other: &PoolStats) {
        self.active += other.active;
        self.idle += other.idle;
        self.acquired += other.acquired;
        self.failed += other.failed;
        self.created += other.created;
        self.closed += other.closed;
    }
}

struct Conn {
    id: u64,
    client: reqwest::Client,
    remote_addr: SocketAddr,
    idle_since: Instant,
    uses: u64,
}

struct ProviderPool {
    name: String,
    base_url: Url,
    limits: PoolLimits,
    permits: Arc<Semaphore>,
    host_permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<Conn>>,
    active: AtomicUsize,
    acquired: AtomicU64,
    failed: AtomicU64,
    created: AtomicU64,
    closed: AtomicU64,
}

impl ProviderPool {
    fn is_stale(&self, conn: &Conn, now: Instant) -> bool {
        now.saturating_duration_since(conn.idle_since) >= self.limits.keepalive_timeout
    }

    fn record_closed(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.closed.fetch_add(n, Ordering::Relaxed);
        metrics::counter!(telemetry::POOL_CLOSED_TOTAL, "provider" => self.name.clone())
            .increment(n);
    }

    fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Most recently parked live connection, closing stale ones on the way.
    fn checkout_idle(&self, now: Instant) -> Option<Conn> {
        let mut idle = self.idle.lock();
        let mut stale = 0;
        let found = loop {
            match idle.pop_back() {
                Some(conn) if self.is_stale(&conn, now) => stale += 1,
                other => break other,
            }
        };
        drop(idle);
        self.record_closed(stale);
        found
    }

    /// Close idle connections past keepalive. Returns how many were closed.
    fn reap(&self, now: Instant) -> usize {
        let mut idle = self.idle.lock();
        let before = idle.len();
        idle.retain(|conn| !self.is_stale(conn, now));
        let reaped = before - idle.len();
        drop(idle);
        self.record_closed(reaped as u64);
        reaped
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.active.load(Ordering::Relaxed),
            idle: self.idle.lock().len(),
            acquired: self.acquired.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
        }
    }
}

struct PoolInner {
    config: PoolConfig,
    global: Arc<Semaphore>,
    providers: RwLock<HashMap<String, Arc<ProviderPool>>>,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
    dns: DnsCache,
    next_id: AtomicU64,
}

/// Bounded pool of provider connections. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let dns = DnsCache::new(config.dns_ttl);
        Self {
            inner: Arc::new(PoolInner {
                global: Arc::new(Semaphore::new(config.max_total)),
                providers: RwLock::new(HashMap::new()),
                hosts: Mutex::new(HashMap::new()),
                dns,
                next_id: AtomicU64::new(1),
                config,
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Set up the per-provider and per-host limits for `endpoint`.
    /// Registering the same provider twice keeps the first registration.
    pub fn register(&self, endpoint: &ProviderEndpoint) {
        self.provider_pool(endpoint);
    }

    fn provider_pool(&self, endpoint: &ProviderEndpoint) -> Arc<ProviderPool> {
        if let Some(pool) = self.inner.providers.read().get(&endpoint.name) {
            return pool.clone();
        }
        let mut providers = self.inner.providers.write();
        providers
            .entry(endpoint.name.clone())
            .or_insert_with(|| {
                let limits = endpoint.config.pool.clone();
                let host_permits = self
                    .inner
                    .hosts
                    .lock()
                    .entry(host_key(&endpoint.address))
                    .or_insert_with(|| Arc::new(Semaphore::new(limits.max_per_host)))
                    .clone();
                Arc::new(ProviderPool {
                    name: endpoint.name.clone(),
                    base_url: endpoint.address.clone(),
                    permits: Arc::new(Semaphore::new(limits.max_connections)),
                    host_permits,
                    limits,
                    idle: Mutex::new(VecDeque::new()),
                    active: AtomicUsize::new(0),
                    acquired: AtomicU64::new(0),
                    failed: AtomicU64::new(0),
                    created: AtomicU64::new(0),
                    closed: AtomicU64::new(0),
                })
            })
            .clone()
    }

    /// Check out a connection to `endpoint`, waiting until `deadline` for
    /// capacity. Reuses the freshest idle connection, otherwise opens one.
    pub async fn acquire(
        &self,
        endpoint: &ProviderEndpoint,
        deadline: &Deadline,
    ) -> Result<PooledConnection> {
        let pool = self.provider_pool(endpoint);
        let start = Instant::now();

        let permits = deadline
            .run(async {
                let host = pool.host_permits.clone().acquire_owned().await?;
                let provider = pool.permits.clone().acquire_owned().await?;
                let global = self.inner.global.clone().acquire_owned().await?;
                Ok::<_, tokio::sync::AcquireError>((host, provider, global))
            })
            .await;

        let (host, provider, global) = match permits {
            Bounded::Done(Ok(permits)) => permits,
            Bounded::Done(Err(_)) => {
                pool.record_failed();
                return Err(SkirnirError::Configuration("connection pool closed".into()));
            }
            Bounded::TimedOut => {
                pool.record_failed();
                let waited = start.elapsed();
                metrics::counter!(telemetry::POOL_EXHAUSTED_TOTAL, "provider" => pool.name.clone())
                    .increment(1);
                debug!(
                    provider = %pool.name,
                    waited_ms = waited.as_millis() as u64,
                    "connection pool exhausted"
                );
                return Err(SkirnirError::PoolExhausted {
                    provider: pool.name.clone(),
                    waited,
                });
            }
            Bounded::Cancelled => return Err(SkirnirError::Cancelled),
        };

        let conn = match pool.checkout_idle(Instant::now()) {
            Some(conn) => conn,
            None => match self.connect(&pool, deadline).await {
                Ok(conn) => conn,
                Err(e) => {
                    pool.record_failed();
                    return Err(e);
                }
            },
        };

        pool.acquired.fetch_add(1, Ordering::Relaxed);
        pool.active.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection {
            client: conn.client.clone(),
            id: conn.id,
            remote_addr: conn.remote_addr,
            uses: conn.uses,
            conn: Some(conn),
            pool,
            healthy: false,
            _host: host,
            _provider: provider,
            _global: global,
        })
    }

    async fn connect(&self, pool: &ProviderPool, deadline: &Deadline) -> Result<Conn> {
        let url = &pool.base_url;
        let port = url.port_or_known_default().unwrap_or(80);
        let connection_error = |message: String| SkirnirError::ConnectionFailure {
            provider: pool.name.clone(),
            message,
        };

        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.inner.config.connect_timeout)
            .pool_idle_timeout(pool.limits.keepalive_timeout)
            .pool_max_idle_per_host(1);

        let remote_addr = match url.host() {
            Some(Host::Ipv4(ip)) => SocketAddr::new(IpAddr::V4(ip), port),
            Some(Host::Ipv6(ip)) => SocketAddr::new(IpAddr::V6(ip), port),
            Some(Host::Domain(domain)) => {
                let addr = match deadline.run(self.inner.dns.resolve(domain, port)).await {
                    Bounded::Done(Ok(addr)) => addr,
                    Bounded::Done(Err(e)) => {
                        return Err(connection_error(format!("resolve {domain}: {e}")));
                    }
                    Bounded::TimedOut => {
                        return Err(connection_error(format!("resolve {domain}: timed out")));
                    }
                    Bounded::Cancelled => return Err(SkirnirError::Cancelled),
                };
                builder = builder.resolve(domain, addr);
                addr
            }
            None => return Err(connection_error(format!("address {url} has no host"))),
        };

        let client = builder
            .build()
            .map_err(|e| connection_error(format!("build client: {e}")))?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        pool.created.fetch_add(1, Ordering::Relaxed);
        debug!(provider = %pool.name, conn = id, %remote_addr, "opened connection");
        Ok(Conn {
            id,
            client,
            remote_addr,
            idle_since: Instant::now(),
            uses: 0,
        })
    }

    /// Close idle connections past their keepalive and drop expired DNS
    /// entries. Returns the number of connections closed.
    pub fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let pools: Vec<Arc<ProviderPool>> = self.inner.providers.read().values().cloned().collect();
        let reaped = pools.iter().map(|p| p.reap(now)).sum();
        self.inner.dns.run_pending_tasks();
        if reaped > 0 {
            debug!(reaped, "closed idle connections");
        }
        reaped
    }

    /// Counters summed over every provider.
    pub fn stats(&self) -> PoolStats {
        let mut total = PoolStats::default();
        for pool in self.inner.providers.read().values() {
            total.merge(&pool.stats());
        }
        total
    }

    pub fn provider_stats(&self, provider: &str) -> Option<PoolStats> {
        self.inner.providers.read().get(provider).map(|p| p.stats())
    }
}

fn host_key(url: &Url) -> String {
    format!(
        "{}:{}",
        url.host_str().unwrap_or_default(),
        url.port_or_known_default().unwrap_or(80)
    )
}

/// Exclusive handle on one pooled connection.
///
/// Release it explicitly with [`release`](Self::release). Dropping it
/// without doing so closes the connection.
pub struct PooledConnection {
    // Taken in `drop` to park or close it.
    conn: Option<Conn>,
    client: reqwest::Client,
    id: u64,
    remote_addr: SocketAddr,
    uses: u64,
    pool: Arc<ProviderPool>,
    healthy: bool,
    // Dropped after `Drop::drop` has parked or closed the connection.
    _host: OwnedSemaphorePermit,
    _provider: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// HTTP client pinned to this connection's resolved address.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// The provider's base address.
    pub fn base_url(&self) -> &Url {
        &self.pool.base_url
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn provider(&self) -> &str {
        &self.pool.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Times this connection has been checked out before, this one excluded.
    pub fn uses(&self) -> u64 {
        self.uses
    }

    /// Return the connection to the idle set if `healthy`, close it otherwise.
    pub fn release(mut self, healthy: bool) {
        self.healthy = healthy;
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("provider", &self.pool.name)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.active.fetch_sub(1, Ordering::Relaxed);
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        if self.healthy {
            conn.uses += 1;
            conn.idle_since = Instant::now();
            self.pool.idle.lock().push_back(conn);
        } else {
            debug!(provider = %self.pool.name, conn = conn.id, "closing unhealthy connection");
            self.pool.record_closed(1);
        }
    }
}
