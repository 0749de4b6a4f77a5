//! Response caching.
//!
//! - [`Fingerprint`]: deterministic hash of the cacheable part of a request.
//! - [`CachePolicy`]: decides which requests are looked up and stored.
//! - [`ResponseCache`]: one shared, byte-bounded LRU + TTL store.

pub mod fingerprint;
pub mod policy;
pub mod response;

pub use fingerprint::Fingerprint;
pub use policy::CachePolicy;
pub use response::{CacheConfig, CacheStats, ResponseCache};
