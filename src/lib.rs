//! Skirnir - resilience layer for calls to interchangeable LLM providers
//!
//! A [`ProviderResilienceManager`] turns a call to any one of several
//! providers into one reliable call. Each provider gets its own token-bucket
//! [`RateLimiter`](resilience::RateLimiter), [`CircuitBreaker`](resilience::CircuitBreaker)
//! and share of a [`ConnectionPool`](pool::ConnectionPool); all providers
//! share one byte-bounded [`ResponseCache`](cache::ResponseCache). Every wait
//! is bounded by the caller's [`Deadline`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use skirnir::{Deadline, Message, ProviderResilienceManager, Request};
//! use skirnir::providers::{HttpInvoker, ProviderConfig, ProviderEndpoint};
//!
//! #[tokio::main]
//! async fn main() -> skirnir::Result<()> {
//!     let invoker = HttpInvoker::new("/v1/chat/completions")?;
//!     let manager = ProviderResilienceManager::builder()
//!         .provider(ProviderEndpoint::new("local", "http://127.0.0.1:11434")?, invoker.clone())
//!         .provider(
//!             ProviderEndpoint::new("backup", "https://llm.example.com")?
//!                 .with_config(ProviderConfig::new().priority(1)),
//!             invoker,
//!         )
//!         .build()?;
//!
//!     let request = Request::new("llama3:8b")
//!         .message(Message::user("What is the capital of France?"))
//!         .temperature(0.0);
//!     let response = manager
//!         .execute(&request, Deadline::after(Duration::from_secs(10)))
//!         .await?;
//!
//!     println!("{} answered: {}", response.provider, response.body);
//!     Ok(())
//! }
//! ```
//!
//! # Configuration file
//!
//! The same manager can be described in TOML; see [`config`].
//!
//! ```rust,no_run
//! # fn main() -> skirnir::Result<()> {
//! let manager = skirnir::FileConfig::load(None)?.http_builder()?.build()?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod manager;
pub mod pool;
pub mod providers;
pub mod resilience;
pub mod telemetry;
pub mod types;

// Re-export main types at crate root
pub use config::FileConfig;
pub use error::{FailureKind, ProviderFailure, Result, SkirnirError};
pub use manager::{
    AttemptStats, MaintenanceConfig, MaintenanceHandle, ManagerBuilder, ManagerMetrics,
    ProviderMetrics, ProviderResilienceManager,
};
pub use types::{Deadline, Message, Request, Response, Role};

pub use cache::{CacheConfig, CachePolicy, CacheStats};
pub use pool::{PoolConfig, PoolLimits, PoolStats};
pub use resilience::{CircuitBreakerConfig, CircuitPhase, RateLimitConfig, RetryConfig};
