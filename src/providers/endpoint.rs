//! Provider identity and per-provider configuration.

use std::time::Duration;

use url::Url;

use super::FailureClassifier;
use crate::cache::CachePolicy;
use crate::pool::PoolLimits;
use crate::resilience::{CircuitBreakerConfig, RateLimitConfig, RetryConfig};
use crate::{Result, SkirnirError};

/// Per-provider cache settings.
#[derive(Debug, Clone, Default)]
pub struct ProviderCacheConfig {
    /// TTL for responses served by this provider; `None` uses the cache default.
    pub ttl: Option<Duration>,
    /// Extra cacheability rule for this provider's responses. A response is
    /// stored only if both the manager policy and this one allow it.
    pub policy: Option<CachePolicy>,
    /// Compress this provider's cached responses above this many bytes;
    /// `None` uses the cache-wide threshold.
    pub compression_threshold: Option<usize>,
}

/// Everything tunable about one provider.
///
/// ```rust
/// # use std::time::Duration;
/// # use skirnir::providers::ProviderConfig;
/// # use skirnir::{CircuitBreakerConfig, RateLimitConfig};
/// let config = ProviderConfig::new()
///     .rate_limit(RateLimitConfig::new().tokens_per_second(2.0).burst_capacity(4))
///     .circuit(CircuitBreakerConfig::new().failure_threshold(3))
///     .request_timeout(Duration::from_secs(20))
///     .priority(1);
/// assert_eq!(config.priority, 1);
/// ```
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub rate_limit: RateLimitConfig,
    pub circuit: CircuitBreakerConfig,
    pub pool: PoolLimits,
    pub cache: ProviderCacheConfig,
    /// Upper bound for one attempt (pool wait plus the call), within the
    /// overall deadline. Default: 30s.
    pub request_timeout: Duration,
    /// Lower runs earlier in the fallback chain. Ties keep registration order.
    pub priority: i32,
    /// Same-provider retries on connection faults.
    pub retry: RetryConfig,
    pub failure_classifier: FailureClassifier,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            circuit: CircuitBreakerConfig::default(),
            pool: PoolLimits::default(),
            cache: ProviderCacheConfig::default(),
            request_timeout: Duration::from_secs(30),
            priority: 0,
            retry: RetryConfig::default(),
            failure_classifier: FailureClassifier::default(),
        }
    }
}

impl ProviderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    pub fn circuit(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit = config;
        self
    }

    pub fn pool(mut self, limits: PoolLimits) -> Self {
        self.pool = limits;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache.ttl = Some(ttl);
        self
    }

    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache.policy = Some(policy);
        self
    }

    pub fn cache_compression_threshold(mut self, bytes: usize) -> Self {
        self.cache.compression_threshold = Some(bytes);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    pub fn failure_classifier(mut self, classifier: FailureClassifier) -> Self {
        self.failure_classifier = classifier;
        self
    }
}

/// A named provider at a fixed address.
#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    pub name: String,
    pub address: Url,
    pub config: ProviderConfig,
}

impl ProviderEndpoint {
    /// Fails with [`SkirnirError::Configuration`] if `address` is not an
    /// absolute URL with a host.
    pub fn new(name: impl Into<String>, address: &str) -> Result<Self> {
        let name = name.into();
        let address = Url::parse(address).map_err(|e| {
            SkirnirError::Configuration(format!("provider {name}: invalid address {address:?}: {e}"))
        })?;
        if address.host().is_none() {
            return Err(SkirnirError::Configuration(format!(
                "provider {name}: address {address} has no host"
            )));
        }
        Ok(Self {
            name,
            address,
            config: ProviderConfig::default(),
        })
    }

    pub fn with_config(mut self, config: ProviderConfig) -> Self {
        self.config = config;
        self
    }
}
