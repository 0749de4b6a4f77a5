//! Host resolution cache.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use moka::sync::Cache;
use tracing::debug;

/// Upper bound on distinct hosts kept in the cache.
const MAX_HOSTS: u64 = 1_024;

/// TTL-bounded cache of `host:port` lookups.
///
/// Entries expire `ttl` after insertion; [`run_pending_tasks`] (called by
/// the idle reaper) evicts them eagerly.
///
/// [`run_pending_tasks`]: DnsCache::run_pending_tasks
pub(crate) struct DnsCache {
    entries: Cache<(String, u16), SocketAddr>,
}

impl DnsCache {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(MAX_HOSTS)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// First address for `host:port`, from cache or a fresh lookup.
    pub(crate) async fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr> {
        let key = (host.to_owned(), port);
        if let Some(addr) = self.entries.get(&key) {
            return Ok(addr);
        }
        let addr = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}"))
            })?;
        debug!(host, port, %addr, "resolved host");
        self.entries.insert(key, addr);
        Ok(addr)
    }

    pub(crate) fn run_pending_tasks(&self) {
        self.entries.run_pending_tasks();
    }
}
