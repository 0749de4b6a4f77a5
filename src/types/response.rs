//! Response envelope

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result of a successful [`execute`](crate::ProviderResilienceManager::execute).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Provider that produced the body (the original one for cache hits).
    pub provider: String,
    /// Provider-specific response body, untouched.
    pub body: Value,
    /// Whether the body was served from the response cache.
    #[serde(default)]
    pub cached: bool,
    /// Raw invocations made during this call, across all providers.
    #[serde(default)]
    pub attempts: u32,
}
