//! Skirnir error types

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Skirnir error types
#[derive(Debug, thiserror::Error)]
pub enum SkirnirError {
    // Transient per-provider errors: the manager moves on to the next provider
    #[error("connection pool exhausted for {provider} after {waited:?}")]
    PoolExhausted { provider: String, waited: Duration },

    #[error("rate limited on {provider}, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("circuit open for {provider}, retry in {retry_in:?}")]
    CircuitOpen { provider: String, retry_in: Duration },

    #[error("connection failure on {provider}: {message}")]
    ConnectionFailure { provider: String, message: String },

    // Permanent error, propagated without trying further providers
    #[error("non-retryable error from {provider}: {message}")]
    NonRetryable { provider: String, message: String },

    /// Every configured provider was tried (or the deadline ran out first).
    #[error("all providers exhausted: {}", summarize(.failures))]
    AllProvidersExhausted { failures: Vec<ProviderFailure> },

    #[error("call cancelled by caller")]
    Cancelled,

    // Data errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("compression error: {0}")]
    Compression(#[from] std::io::Error),

    // Configuration errors
    #[error("no provider configured")]
    NoProvider,

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl SkirnirError {
    /// Whether this error should make the orchestrator advance to the next
    /// provider rather than give up.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SkirnirError::PoolExhausted { .. }
                | SkirnirError::RateLimited { .. }
                | SkirnirError::CircuitOpen { .. }
                | SkirnirError::ConnectionFailure { .. }
        )
    }

    /// Suggested wait before the same provider is worth trying again.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SkirnirError::RateLimited { retry_after, .. } => *retry_after,
            SkirnirError::CircuitOpen { retry_in, .. } => Some(*retry_in),
            _ => None,
        }
    }

    /// Name of the provider the error is attributed to, if any.
    pub fn provider(&self) -> Option<&str> {
        match self {
            SkirnirError::PoolExhausted { provider, .. }
            | SkirnirError::RateLimited { provider, .. }
            | SkirnirError::CircuitOpen { provider, .. }
            | SkirnirError::ConnectionFailure { provider, .. }
            | SkirnirError::NonRetryable { provider, .. } => Some(provider),
            _ => None,
        }
    }

    /// Per-provider breakdown carried by [`SkirnirError::AllProvidersExhausted`].
    ///
    /// Empty for every other variant.
    pub fn failures(&self) -> &[ProviderFailure] {
        match self {
            SkirnirError::AllProvidersExhausted { failures } => failures,
            _ => &[],
        }
    }
}

/// Why a single provider was given up on during one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PoolExhausted,
    RateLimited,
    CircuitOpen,
    ConnectionFailure,
    /// Retryable error reported by the provider itself.
    Transient,
    /// The per-attempt timeout elapsed.
    Timeout,
    /// The overall call deadline ran out before or during this provider.
    DeadlineExceeded,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::PoolExhausted => "pool_exhausted",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::CircuitOpen => "circuit_open",
            FailureKind::ConnectionFailure => "connection_failure",
            FailureKind::Transient => "transient",
            FailureKind::Timeout => "timeout",
            FailureKind::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final error recorded for one provider in an exhausted fallback chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderFailure {
    pub provider: String,
    pub kind: FailureKind,
    pub message: String,
    /// Raw invocations made against this provider during the call.
    pub attempts: u32,
}

impl ProviderFailure {
    pub fn new(
        provider: impl Into<String>,
        kind: FailureKind,
        message: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            provider: provider.into(),
            kind,
            message: message.into(),
            attempts,
        }
    }

    /// Build a failure record from a transient leaf error.
    ///
    /// Returns `None` for errors that are not per-provider transient errors.
    pub(crate) fn from_error(err: &SkirnirError, attempts: u32) -> Option<Self> {
        let kind = match err {
            SkirnirError::PoolExhausted { .. } => FailureKind::PoolExhausted,
            SkirnirError::RateLimited { .. } => FailureKind::RateLimited,
            SkirnirError::CircuitOpen { .. } => FailureKind::CircuitOpen,
            SkirnirError::ConnectionFailure { .. } => FailureKind::ConnectionFailure,
            _ => return None,
        };
        let provider = err.provider()?;
        Some(Self::new(provider, kind, err.to_string(), attempts))
    }
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.provider, self.kind, self.message)
    }
}

fn summarize(failures: &[ProviderFailure]) -> String {
    if failures.is_empty() {
        return "no provider attempted".to_string();
    }
    failures
        .iter()
        .map(|f| format!("{}={}", f.provider, f.kind))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias for Skirnir operations
pub type Result<T> = std::result::Result<T, SkirnirError>;
