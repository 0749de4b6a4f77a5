//! Builder for [`ProviderResilienceManager`].

use std::collections::HashSet;
use std::sync::Arc;

use tracing::info;

use super::{ProviderResilienceManager, ProviderSlot};
use crate::cache::{CacheConfig, CachePolicy, ResponseCache};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::providers::{ProviderEndpoint, ProviderInvoker, promote_preferred};
use crate::{Result, SkirnirError};

/// Collects providers and shared settings, then validates them in
/// [`build`](Self::build).
///
/// ```rust
/// # use skirnir::{ProviderResilienceManager, CacheConfig};
/// # use skirnir::providers::{HttpInvoker, ProviderConfig, ProviderEndpoint};
/// # fn main() -> skirnir::Result<()> {
/// let invoker = HttpInvoker::new("/v1/chat/completions")?;
/// let manager = ProviderResilienceManager::builder()
///     .provider(ProviderEndpoint::new("local", "http://127.0.0.1:11434")?, invoker.clone())
///     .provider(
///         ProviderEndpoint::new("remote", "http://127.0.0.1:8080")?
///             .with_config(ProviderConfig::new().priority(1)),
///         invoker,
///     )
///     .cache_config(CacheConfig::new().capacity_bytes(1 << 20))
///     .build()?;
/// assert_eq!(manager.provider_names(), ["local", "remote"]);
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct ManagerBuilder {
    providers: Vec<(ProviderEndpoint, Arc<dyn ProviderInvoker>)>,
    pool: PoolConfig,
    cache: CacheConfig,
    policy: CachePolicy,
    prefer: Option<String>,
}

impl ManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider to the fallback chain.
    pub fn provider(
        mut self,
        endpoint: ProviderEndpoint,
        invoker: impl ProviderInvoker + 'static,
    ) -> Self {
        self.providers.push((endpoint, Arc::new(invoker)));
        self
    }

    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool = config;
        self
    }

    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    /// Manager-wide cacheability rule. Default: [`CachePolicy::default`].
    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Move the named provider to the head of the chain, after priority
    /// ordering.
    pub fn prefer(mut self, provider: impl Into<String>) -> Self {
        self.prefer = Some(provider.into());
        self
    }

    /// Validate the configuration and construct the manager.
    ///
    /// Providers are ordered by ascending priority; ties keep registration
    /// order.
    pub fn build(self) -> Result<ProviderResilienceManager> {
        if self.providers.is_empty() {
            return Err(SkirnirError::NoProvider);
        }
        validate_shared(&self.pool, &self.cache)?;

        let mut seen = HashSet::new();
        for (endpoint, _) in &self.providers {
            if !seen.insert(endpoint.name.as_str()) {
                return Err(SkirnirError::Configuration(format!(
                    "duplicate provider name {:?}",
                    endpoint.name
                )));
            }
            validate_endpoint(endpoint)?;
        }

        let pool = ConnectionPool::new(self.pool);
        let mut slots: Vec<ProviderSlot> = self
            .providers
            .into_iter()
            .map(|(endpoint, invoker)| {
                pool.register(&endpoint);
                ProviderSlot::new(endpoint, invoker)
            })
            .collect();
        slots.sort_by_key(|s| s.endpoint.config.priority);

        if let Some(preferred) = &self.prefer
            && !promote_preferred(&mut slots, preferred)
        {
            return Err(SkirnirError::Configuration(format!(
                "preferred provider {preferred:?} is not configured"
            )));
        }

        let manager = ProviderResilienceManager::from_parts(
            slots,
            pool,
            ResponseCache::new(self.cache),
            self.policy,
        );
        info!(providers = ?manager.provider_names(), "resilience manager ready");
        Ok(manager)
    }
}

fn invalid(provider: &str, what: &str) -> SkirnirError {
    SkirnirError::Configuration(format!("provider {provider}: {what}"))
}

fn validate_endpoint(endpoint: &ProviderEndpoint) -> Result<()> {
    let name = endpoint.name.as_str();
    let config = &endpoint.config;
    if name.is_empty() {
        return Err(SkirnirError::Configuration("provider name is empty".into()));
    }
    let rate = config.rate_limit.tokens_per_second;
    if !rate.is_finite() || rate <= 0.0 {
        return Err(invalid(name, "tokens_per_second must be a positive number"));
    }
    if config.rate_limit.burst_capacity == 0 {
        return Err(invalid(name, "burst_capacity must be at least 1"));
    }
    if config.circuit.failure_threshold == 0 || config.circuit.success_threshold == 0 {
        return Err(invalid(name, "circuit thresholds must be at least 1"));
    }
    if config.pool.max_connections == 0 || config.pool.max_per_host == 0 {
        return Err(invalid(name, "pool limits must be at least 1"));
    }
    if config.request_timeout.is_zero() {
        return Err(invalid(name, "request_timeout must be non-zero"));
    }
    Ok(())
}

fn validate_shared(pool: &PoolConfig, cache: &CacheConfig) -> Result<()> {
    if pool.max_total == 0 {
        return Err(SkirnirError::Configuration(
            "pool max_total must be at least 1".into(),
        ));
    }
    if cache.capacity_bytes == 0 {
        return Err(SkirnirError::Configuration(
            "cache capacity_bytes must be at least 1".into(),
        ));
    }
    Ok(())
}
