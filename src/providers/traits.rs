//! The raw-invocation seam between the manager and a provider.
//!
//! The manager never builds or inspects provider payloads. Each provider is
//! wired with a [`ProviderInvoker`] that performs one raw call over a pooled
//! connection and classifies its own failures:
//!
//! - [`ErrorClass::Transient`]: the provider is struggling (429, 5xx, ...).
//!   Counts against the breaker; the chain moves on.
//! - [`ErrorClass::Connection`]: the transport failed before a response.
//!   The connection is discarded and the same provider may be retried.
//! - [`ErrorClass::Permanent`]: the request itself is bad. Propagated to the
//!   caller at once; no other provider is tried.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use crate::pool::PooledConnection;
use crate::types::Request;

/// How a failed invocation should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Connection,
    Permanent,
}

/// Failure reported by a [`ProviderInvoker`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ClassifiedError {
    pub class: ErrorClass,
    pub message: String,
    /// Provider-supplied hint (e.g. from a `Retry-After` header).
    pub retry_after: Option<Duration>,
}

impl ClassifiedError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Connection, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Permanent, message)
    }

    /// Classify an HTTP status: 408, 425, 429 and 5xx are transient,
    /// anything else permanent.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let class = match status {
            408 | 425 | 429 | 500..=599 => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        };
        Self::new(class, message)
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Transient or connection-level.
    pub fn is_retryable(&self) -> bool {
        self.class != ErrorClass::Permanent
    }

    pub fn is_connection_fault(&self) -> bool {
        self.class == ErrorClass::Connection
    }
}

impl From<reqwest::Error> for ClassifiedError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            ClassifiedError::connection(err.to_string())
        } else if let Some(status) = err.status() {
            ClassifiedError::from_status(status.as_u16(), err.to_string())
        } else if err.is_timeout() {
            ClassifiedError::transient(err.to_string())
        } else if err.is_request() || err.is_body() {
            ClassifiedError::connection(err.to_string())
        } else if err.is_decode() || err.is_builder() {
            ClassifiedError::permanent(err.to_string())
        } else {
            ClassifiedError::transient(err.to_string())
        }
    }
}

/// Performs one raw call against a provider.
///
/// `deadline` is the attempt deadline: the earlier of the overall call
/// deadline and the provider's per-attempt timeout. The manager enforces it
/// regardless; invokers may use it to set transport timeouts.
#[async_trait]
pub trait ProviderInvoker: Send + Sync {
    async fn invoke(
        &self,
        request: &Request,
        connection: &PooledConnection,
        deadline: Instant,
    ) -> Result<Value, ClassifiedError>;
}

#[async_trait]
impl<T: ProviderInvoker + ?Sized> ProviderInvoker for Arc<T> {
    async fn invoke(
        &self,
        request: &Request,
        connection: &PooledConnection,
        deadline: Instant,
    ) -> Result<Value, ClassifiedError> {
        (**self).invoke(request, connection, deadline).await
    }
}

/// Decides whether a retryable failure counts against the circuit breaker.
///
/// Permanent failures never reach the classifier and never count.
/// Default: every retryable failure counts.
#[derive(Clone)]
pub struct FailureClassifier(Arc<dyn Fn(&ClassifiedError) -> bool + Send + Sync>);

impl FailureClassifier {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&ClassifiedError) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn counts(&self, err: &ClassifiedError) -> bool {
        (self.0)(err)
    }
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::new(ClassifiedError::is_retryable)
    }
}

impl fmt::Debug for FailureClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FailureClassifier(..)")
    }
}
