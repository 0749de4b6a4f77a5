//! Which requests may be served from or stored in the response cache.

use std::fmt;
use std::sync::Arc;

use crate::types::Request;

type Predicate = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// Cacheability rule.
///
/// By default a request is cacheable when it is not marked
/// [`no_cache`](Request::no_cache) and its temperature is at or below
/// `max_temperature` (a request without a temperature counts as cacheable).
/// A custom predicate replaces the temperature rule; `no_cache` always wins.
///
/// ```rust
/// # use skirnir::Request;
/// # use skirnir::cache::CachePolicy;
/// let policy = CachePolicy::new().max_temperature(0.2);
/// assert!(policy.is_cacheable(&Request::new("m").temperature(0.1)));
/// assert!(!policy.is_cacheable(&Request::new("m").temperature(0.7)));
/// assert!(!policy.is_cacheable(&Request::new("m").temperature(0.1).no_cache()));
/// ```
#[derive(Clone)]
pub struct CachePolicy {
    /// Highest sampling temperature still considered deterministic. Default: 0.0.
    pub max_temperature: f64,
    predicate: Option<Predicate>,
    enabled: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            max_temperature: 0.0,
            predicate: None,
            enabled: true,
        }
    }
}

impl fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePolicy")
            .field("max_temperature", &self.max_temperature)
            .field("custom_predicate", &self.predicate.is_some())
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl CachePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never cache.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn max_temperature(mut self, t: f64) -> Self {
        self.max_temperature = t;
        self
    }

    /// Replace the temperature rule with a custom predicate.
    pub fn predicate<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(f));
        self
    }

    pub fn is_cacheable(&self, request: &Request) -> bool {
        if !self.enabled || request.no_cache {
            return false;
        }
        match &self.predicate {
            Some(p) => p(request),
            None => request
                .temperature
                .is_none_or(|t| t <= self.max_temperature),
        }
    }
}
