//! Shared LRU + TTL response cache with a byte budget.
//!
//! Entries are stored serialized (`serde_json`), so every [`get`] hands out
//! a fresh deep copy. Payloads above the compression threshold are
//! deflate-compressed before storage; the stored size is what counts
//! against the capacity.
//!
//! # Ordering
//!
//! Every read or write stamps the entry with a unique, monotonically
//! increasing access tick. The access-order index is a `BTreeMap` keyed by
//! tick, so eviction pops the smallest tick: strictly the
//! least-recently-accessed entry, with earlier insertion winning ties.
//!
//! Expired entries are dropped lazily on lookup and in bulk by
//! [`purge_expired`], which the maintenance task runs periodically.
//!
//! [`get`]: ResponseCache::get
//! [`purge_expired`]: ResponseCache::purge_expired

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::time::Duration;

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::debug;

use super::Fingerprint;
use crate::Result;
use crate::telemetry;

/// Configuration for the response cache.
///
/// ```rust
/// # use skirnir::CacheConfig;
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .capacity_bytes(8 * 1024 * 1024)
///     .default_ttl(Duration::from_secs(600));
/// assert_eq!(config.compression_threshold, 4 * 1024);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Total stored bytes allowed. Default: 64 MiB.
    pub capacity_bytes: usize,
    /// TTL used when a put does not name one. Default: 1 hour.
    pub default_ttl: Duration,
    /// Serialized payloads larger than this are compressed. Default: 4 KiB.
    pub compression_threshold: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 64 * 1024 * 1024,
            default_ttl: Duration::from_secs(3600),
            compression_threshold: 4 * 1024,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity_bytes(mut self, bytes: usize) -> Self {
        self.capacity_bytes = bytes;
        self
    }

    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold = bytes;
        self
    }
}

/// Counters and occupancy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub size_bytes: usize,
    pub capacity_bytes: usize,
    /// `hits / (hits + misses)`, 0.0 before the first lookup.
    pub hit_rate: f64,
}

#[derive(Debug)]
struct Entry {
    bytes: Vec<u8>,
    compressed: bool,
    inserted_at: Instant,
    ttl: Duration,
    tick: u64,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) >= self.ttl
    }
}

#[derive(Debug, Default)]
struct Store {
    entries: HashMap<Fingerprint, Entry>,
    order: BTreeMap<u64, Fingerprint>,
    next_tick: u64,
    size: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl Store {
    fn tick(&mut self) -> u64 {
        let t = self.next_tick;
        self.next_tick += 1;
        t
    }

    fn remove(&mut self, fp: &Fingerprint) -> Option<Entry> {
        let entry = self.entries.remove(fp)?;
        self.order.remove(&entry.tick);
        self.size -= entry.bytes.len();
        Some(entry)
    }

    fn evict_lru(&mut self) -> bool {
        let Some((_, fp)) = self.order.pop_first() else {
            return false;
        };
        if let Some(entry) = self.entries.remove(&fp) {
            self.size -= entry.bytes.len();
        }
        self.evictions += 1;
        true
    }
}

/// Shared response cache keyed by [`Fingerprint`].
#[derive(Debug)]
pub struct ResponseCache {
    config: CacheConfig,
    store: Mutex<Store>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            store: Mutex::new(Store::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up and decode an entry, marking it most-recently-used.
    ///
    /// An expired entry is removed and reported as a miss. Decoding happens
    /// outside the lock.
    pub fn get<T: DeserializeOwned>(&self, fp: &Fingerprint) -> Result<Option<T>> {
        let now = Instant::now();
        let (bytes, compressed) = {
            let mut store = self.store.lock();
            match store.entries.get(fp).map(|e| e.is_expired(now)) {
                None => {
                    store.misses += 1;
                    drop(store);
                    metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
                    return Ok(None);
                }
                Some(true) => {
                    store.remove(fp);
                    store.expirations += 1;
                    store.misses += 1;
                    drop(store);
                    debug!(fingerprint = ?fp, "cache entry expired");
                    metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
                    return Ok(None);
                }
                Some(false) => {}
            }
            let tick = store.tick();
            store.hits += 1;
            let Store { entries, order, .. } = &mut *store;
            // Present: checked above under the same lock.
            let Some(entry) = entries.get_mut(fp) else {
                return Ok(None);
            };
            order.remove(&entry.tick);
            order.insert(tick, *fp);
            entry.tick = tick;
            (entry.bytes.clone(), entry.compressed)
        };
        metrics::counter!(telemetry::CACHE_HITS_TOTAL).increment(1);
        Ok(Some(decode(&bytes, compressed)?))
    }

    /// Serialize and store `value` under `fp`, replacing any previous entry.
    ///
    /// `ttl` of `None` uses the configured default. Evicts
    /// least-recently-accessed entries until the new one fits. Returns
    /// `false` when the encoded payload alone exceeds the whole capacity,
    /// in which case nothing is stored or evicted.
    pub fn put<T: Serialize>(&self, fp: Fingerprint, value: &T, ttl: Option<Duration>) -> Result<bool> {
        self.put_with_threshold(fp, value, ttl, None)
    }

    /// [`put`](Self::put) with a compression threshold overriding the
    /// configured one when `Some`.
    pub fn put_with_threshold<T: Serialize>(
        &self,
        fp: Fingerprint,
        value: &T,
        ttl: Option<Duration>,
        compression_threshold: Option<usize>,
    ) -> Result<bool> {
        let threshold = compression_threshold.unwrap_or(self.config.compression_threshold);
        let (bytes, compressed) = encode(value, threshold)?;
        if bytes.len() > self.config.capacity_bytes {
            debug!(
                fingerprint = ?fp,
                size = bytes.len(),
                capacity = self.config.capacity_bytes,
                "payload larger than cache capacity, not stored"
            );
            return Ok(false);
        }

        let mut evicted = 0u64;
        {
            let mut store = self.store.lock();
            store.remove(&fp);
            while store.size + bytes.len() > self.config.capacity_bytes && store.evict_lru() {
                evicted += 1;
            }
            let tick = store.tick();
            store.size += bytes.len();
            store.order.insert(tick, fp);
            store.entries.insert(
                fp,
                Entry {
                    bytes,
                    compressed,
                    inserted_at: Instant::now(),
                    ttl: ttl.unwrap_or(self.config.default_ttl),
                    tick,
                },
            );
        }
        if evicted > 0 {
            metrics::counter!(telemetry::CACHE_EVICTIONS_TOTAL).increment(evicted);
        }
        Ok(true)
    }

    pub fn remove(&self, fp: &Fingerprint) -> bool {
        self.store.lock().remove(fp).is_some()
    }

    /// Whether a live entry exists. Does not touch recency or counters.
    pub fn contains(&self, fp: &Fingerprint) -> bool {
        let now = Instant::now();
        self.store
            .lock()
            .entries
            .get(fp)
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        let mut store = self.store.lock();
        store.entries.clear();
        store.order.clear();
        store.size = 0;
    }

    /// Remove all expired entries; returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut store = self.store.lock();
        let expired: Vec<Fingerprint> = store
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(fp, _)| *fp)
            .collect();
        for fp in &expired {
            store.remove(fp);
        }
        store.expirations += expired.len() as u64;
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.store.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let store = self.store.lock();
        let lookups = store.hits + store.misses;
        CacheStats {
            hits: store.hits,
            misses: store.misses,
            evictions: store.evictions,
            expirations: store.expirations,
            entries: store.entries.len(),
            size_bytes: store.size,
            capacity_bytes: self.config.capacity_bytes,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                store.hits as f64 / lookups as f64
            },
        }
    }
}

fn encode<T: Serialize>(value: &T, threshold: usize) -> Result<(Vec<u8>, bool)> {
    let raw = serde_json::to_vec(value)?;
    if raw.len() <= threshold {
        return Ok((raw, false));
    }
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::fast());
    encoder.write_all(&raw)?;
    Ok((encoder.finish()?, true))
}

fn decode<T: DeserializeOwned>(bytes: &[u8], compressed: bool) -> Result<T> {
    if !compressed {
        return Ok(serde_json::from_slice(bytes)?);
    }
    let mut raw = Vec::with_capacity(bytes.len() * 2);
    DeflateDecoder::new(bytes).read_to_end(&mut raw)?;
    Ok(serde_json::from_slice(&raw)?)
}
