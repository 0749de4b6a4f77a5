//! Per-provider admission control: token bucket, circuit breaker, retry.

pub mod circuit_breaker;
pub mod rate_limit;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitPermit, CircuitPhase, CircuitSnapshot,
};
pub use rate_limit::{RateLimitConfig, RateLimiter, RateLimiterStats};
pub use retry::RetryConfig;
