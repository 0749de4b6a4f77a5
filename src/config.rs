//! TOML configuration file.
//!
//! Resolution order:
//! 1. An explicit path
//! 2. `~/.skirnir/config.toml` (user)
//! 3. `/etc/skirnir/config.toml` (system)
//!
//! Every field has a default, so a file only needs its `[[providers]]`:
//!
//! ```toml
//! [cache]
//! capacity_bytes = 16777216
//! max_temperature = 0.2
//!
//! [fallback]
//! prefer = "local"
//!
//! [[providers]]
//! name = "local"
//! address = "http://127.0.0.1:11434"
//! path = "/api/chat"
//!
//! [providers.rate_limit]
//! tokens_per_second = 5.0
//! burst_capacity = 10
//!
//! [[providers]]
//! name = "remote"
//! address = "https://llm.example.com"
//! priority = 1
//!
//! [providers.circuit]
//! failure_threshold = 3
//! recovery_timeout_ms = 15000
//! ```
//!
//! Credentials are not part of this file; attach them to the invokers.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::cache::{CacheConfig, CachePolicy};
use crate::manager::{MaintenanceConfig, ManagerBuilder};
use crate::pool::{PoolConfig, PoolLimits};
use crate::providers::{HttpInvoker, ProviderConfig, ProviderEndpoint, ProviderInvoker};
use crate::resilience::{CircuitBreakerConfig, RateLimitConfig, RetryConfig};
use crate::{ProviderResilienceManager, Result, SkirnirError};

/// Top-level file layout.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub maintenance: MaintenanceSection,
    #[serde(default)]
    pub fallback: FallbackSection,
    #[serde(default)]
    pub providers: Vec<ProviderSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolSection {
    #[serde(default = "default_max_total")]
    pub max_total: usize,
    #[serde(default = "default_dns_ttl_secs")]
    pub dns_ttl_secs: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_total: default_max_total(),
            dns_ttl_secs: default_dns_ttl_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

fn default_max_total() -> usize {
    256
}

fn default_dns_ttl_secs() -> u64 {
    60
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSection {
    /// Set to false to never cache.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
    /// Highest temperature still cached.
    #[serde(default)]
    pub max_temperature: f64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity_bytes: default_capacity_bytes(),
            default_ttl_secs: default_cache_ttl_secs(),
            compression_threshold: default_compression_threshold(),
            max_temperature: 0.0,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_capacity_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_compression_threshold() -> usize {
    4 * 1024
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MaintenanceSection {
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for MaintenanceSection {
    fn default() -> Self {
        Self {
            reap_interval_secs: default_reap_interval_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_reap_interval_secs() -> u64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    60
}

/// Fallback ordering.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FallbackSection {
    /// Explicit chain order. When set it must name every provider once,
    /// and it overrides per-provider `priority`.
    #[serde(default)]
    pub order: Option<Vec<String>>,
    /// Provider moved to the head of the chain.
    #[serde(default)]
    pub prefer: Option<String>,
}

/// One `[[providers]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderSection {
    pub name: String,
    pub address: String,
    /// Request path used by [`FileConfig::http_builder`]. Default: `/`.
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub circuit: CircuitSection,
    #[serde(default)]
    pub pool: PoolLimitsSection,
    #[serde(default)]
    pub cache: ProviderCacheSection,
    #[serde(default)]
    pub retry: RetrySection,
}

fn default_path() -> String {
    "/".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitSection {
    #[serde(default = "default_tokens_per_second")]
    pub tokens_per_second: f64,
    #[serde(default = "default_burst_capacity")]
    pub burst_capacity: u32,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            tokens_per_second: default_tokens_per_second(),
            burst_capacity: default_burst_capacity(),
        }
    }
}

fn default_tokens_per_second() -> f64 {
    10.0
}

fn default_burst_capacity() -> u32 {
    20
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitSection {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for CircuitSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            success_threshold: default_success_threshold(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    30_000
}

fn default_success_threshold() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolLimitsSection {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_per_host")]
    pub max_per_host: usize,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_timeout_secs: u64,
}

impl Default for PoolLimitsSection {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_per_host: default_max_per_host(),
            keepalive_timeout_secs: default_keepalive_secs(),
        }
    }
}

fn default_max_connections() -> usize {
    32
}

fn default_max_per_host() -> usize {
    16
}

fn default_keepalive_secs() -> u64 {
    90
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderCacheSection {
    /// Overrides the cache-wide default TTL for this provider's responses.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    /// Stricter temperature ceiling for this provider's responses.
    #[serde(default)]
    pub max_temperature: Option<f64>,
    /// Overrides the cache-wide compression threshold for this provider.
    #[serde(default)]
    pub compression_threshold: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: true,
        }
    }
}

fn default_max_attempts() -> u32 {
    2
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    2_000
}

fn invalid(msg: impl Into<String>) -> SkirnirError {
    SkirnirError::Configuration(msg.into())
}

impl FileConfig {
    /// Load and validate configuration from the standard locations.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_config_path(explicit_path)?;
        let content = fs::read_to_string(&path)
            .map_err(|e| invalid(format!("failed to read config file {path:?}: {e}")))?;
        Self::from_toml_str(&content)
            .map_err(|e| invalid(format!("config file {path:?}: {e}")))
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: FileConfig =
            toml::from_str(content).map_err(|e| invalid(format!("failed to parse: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            return Err(invalid(format!("config file not found: {path:?}")));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".skirnir").join("config.toml");
            if user_config.exists() {
                return Ok(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/skirnir/config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }

        Err(invalid(
            "no config file found; create ~/.skirnir/config.toml or /etc/skirnir/config.toml",
        ))
    }

    /// Reject values the manager cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            return Err(SkirnirError::NoProvider);
        }
        if self.pool.max_total == 0 {
            return Err(invalid("pool.max_total must be at least 1"));
        }
        if self.cache.capacity_bytes == 0 {
            return Err(invalid("cache.capacity_bytes must be at least 1"));
        }
        if self.maintenance.reap_interval_secs == 0 || self.maintenance.sweep_interval_secs == 0 {
            return Err(invalid("maintenance intervals must be at least 1 second"));
        }

        let mut names = HashSet::new();
        for p in &self.providers {
            if p.name.is_empty() {
                return Err(invalid("provider name is empty"));
            }
            if !names.insert(p.name.as_str()) {
                return Err(invalid(format!("duplicate provider name {:?}", p.name)));
            }
            ProviderEndpoint::new(&p.name, &p.address)?;
            let rate = p.rate_limit.tokens_per_second;
            if !rate.is_finite() || rate <= 0.0 {
                return Err(invalid(format!(
                    "provider {}: tokens_per_second must be a positive number",
                    p.name
                )));
            }
            let zero = [
                ("rate_limit.burst_capacity", p.rate_limit.burst_capacity == 0),
                ("circuit.failure_threshold", p.circuit.failure_threshold == 0),
                ("circuit.success_threshold", p.circuit.success_threshold == 0),
                ("pool.max_connections", p.pool.max_connections == 0),
                ("pool.max_per_host", p.pool.max_per_host == 0),
                ("request_timeout_ms", p.request_timeout_ms == 0),
                ("retry.max_attempts", p.retry.max_attempts == 0),
            ];
            if let Some((field, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
                return Err(invalid(format!(
                    "provider {}: {field} must be at least 1",
                    p.name
                )));
            }
        }

        if let Some(order) = &self.fallback.order {
            let listed: HashSet<&str> = order.iter().map(String::as_str).collect();
            if listed.len() != order.len() || listed != names {
                return Err(invalid(
                    "fallback.order must name every provider exactly once",
                ));
            }
        }
        if let Some(preferred) = &self.fallback.prefer
            && !names.contains(preferred.as_str())
        {
            return Err(invalid(format!(
                "fallback.prefer names unknown provider {preferred:?}"
            )));
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::new()
            .max_total(self.pool.max_total)
            .dns_ttl(Duration::from_secs(self.pool.dns_ttl_secs))
            .connect_timeout(Duration::from_millis(self.pool.connect_timeout_ms))
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::new()
            .capacity_bytes(self.cache.capacity_bytes)
            .default_ttl(Duration::from_secs(self.cache.default_ttl_secs))
            .compression_threshold(self.cache.compression_threshold)
    }

    pub fn cache_policy(&self) -> CachePolicy {
        if self.cache.enabled {
            CachePolicy::new().max_temperature(self.cache.max_temperature)
        } else {
            CachePolicy::disabled()
        }
    }

    pub fn maintenance_config(&self) -> MaintenanceConfig {
        MaintenanceConfig::new()
            .reap_interval(Duration::from_secs(self.maintenance.reap_interval_secs))
            .sweep_interval(Duration::from_secs(self.maintenance.sweep_interval_secs))
    }

    /// Runtime endpoints, in file order.
    pub fn endpoints(&self) -> Result<Vec<ProviderEndpoint>> {
        self.providers
            .iter()
            .map(|p| {
                let priority = match &self.fallback.order {
                    Some(order) => order
                        .iter()
                        .position(|n| *n == p.name)
                        .map_or(i32::MAX, |i| i as i32),
                    None => p.priority,
                };
                Ok(ProviderEndpoint::new(&p.name, &p.address)?
                    .with_config(p.to_config().priority(priority)))
            })
            .collect()
    }

    /// A manager builder with every provider wired to the invoker returned
    /// by `invoker_for`.
    pub fn builder<F>(&self, mut invoker_for: F) -> Result<ManagerBuilder>
    where
        F: FnMut(&ProviderSection) -> Result<Arc<dyn ProviderInvoker>>,
    {
        let mut builder = ProviderResilienceManager::builder()
            .pool_config(self.pool_config())
            .cache_config(self.cache_config())
            .cache_policy(self.cache_policy());
        for (section, endpoint) in self.providers.iter().zip(self.endpoints()?) {
            builder = builder.provider(endpoint, invoker_for(section)?);
        }
        if let Some(preferred) = &self.fallback.prefer {
            builder = builder.prefer(preferred);
        }
        Ok(builder)
    }

    /// [`builder`](Self::builder) with an [`HttpInvoker`] posting to each
    /// provider's `path`.
    pub fn http_builder(&self) -> Result<ManagerBuilder> {
        self.builder(|p| Ok(Arc::new(HttpInvoker::new(&p.path)?)))
    }
}

impl ProviderSection {
    fn to_config(&self) -> ProviderConfig {
        let mut config = ProviderConfig::new()
            .rate_limit(
                RateLimitConfig::new()
                    .tokens_per_second(self.rate_limit.tokens_per_second)
                    .burst_capacity(self.rate_limit.burst_capacity),
            )
            .circuit(
                CircuitBreakerConfig::new()
                    .failure_threshold(self.circuit.failure_threshold)
                    .recovery_timeout(Duration::from_millis(self.circuit.recovery_timeout_ms))
                    .success_threshold(self.circuit.success_threshold),
            )
            .pool(
                PoolLimits::new()
                    .max_connections(self.pool.max_connections)
                    .max_per_host(self.pool.max_per_host)
                    .keepalive_timeout(Duration::from_secs(self.pool.keepalive_timeout_secs)),
            )
            .retry(
                RetryConfig::new()
                    .max_attempts(self.retry.max_attempts)
                    .initial_delay(Duration::from_millis(self.retry.initial_delay_ms))
                    .max_delay(Duration::from_millis(self.retry.max_delay_ms))
                    .jitter(self.retry.jitter),
            )
            .request_timeout(Duration::from_millis(self.request_timeout_ms))
            .priority(self.priority);
        if let Some(ttl) = self.cache.ttl_secs {
            config = config.cache_ttl(Duration::from_secs(ttl));
        }
        if let Some(t) = self.cache.max_temperature {
            config = config.cache_policy(CachePolicy::new().max_temperature(t));
        }
        if let Some(bytes) = self.cache.compression_threshold {
            config = config.cache_compression_threshold(bytes);
        }
        config
    }
}
