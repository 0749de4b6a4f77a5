//! Provider wiring: endpoints, the raw-invocation trait, latency tracking.

pub mod endpoint;
pub mod http;
pub mod latency;
pub mod traits;

pub use endpoint::{ProviderCacheConfig, ProviderConfig, ProviderEndpoint};
pub use http::HttpInvoker;
pub use latency::ProviderLatency;
pub(crate) use latency::{Named, promote_preferred};
pub use traits::{ClassifiedError, ErrorClass, FailureClassifier, ProviderInvoker};
