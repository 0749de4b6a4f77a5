//! Generic JSON-over-HTTP invoker.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use serde_json::Value;
use tokio::time::Instant;

use super::{ClassifiedError, ProviderInvoker};
use crate::pool::PooledConnection;
use crate::types::Request;
use crate::{Result, SkirnirError};

/// Posts [`Request::wire_body`] to `base_url + path` through the pooled
/// connection's client and returns the JSON body untouched.
///
/// Non-2xx statuses are classified with [`ClassifiedError::from_status`];
/// a numeric `Retry-After` header is carried along as the retry hint.
///
/// ```rust
/// # use skirnir::providers::HttpInvoker;
/// let invoker = HttpInvoker::new("/v1/chat/completions")
///     .unwrap()
///     .header("authorization", "Bearer sk-test")
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct HttpInvoker {
    path: String,
    headers: HeaderMap,
}

impl HttpInvoker {
    /// `path` is joined onto each provider's base address.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if path.contains("://") {
            return Err(SkirnirError::Configuration(format!(
                "invoker path must be relative, got {path:?}"
            )));
        }
        Ok(Self {
            path,
            headers: HeaderMap::new(),
        })
    }

    /// Add a header sent with every call.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| SkirnirError::Configuration(format!("header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| SkirnirError::Configuration(format!("header {name} value: {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }
}

#[async_trait]
impl ProviderInvoker for HttpInvoker {
    async fn invoke(
        &self,
        request: &Request,
        connection: &PooledConnection,
        deadline: Instant,
    ) -> std::result::Result<Value, ClassifiedError> {
        let mut url = connection.base_url().clone();
        let path = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            self.path.trim_start_matches('/')
        );
        url.set_path(&path);

        let timeout = deadline.saturating_duration_since(Instant::now());
        let response = connection
            .client()
            .post(url)
            .headers(self.headers.clone())
            .timeout(timeout)
            .json(&request.wire_body())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            let mut err =
                ClassifiedError::from_status(status.as_u16(), format!("HTTP {status}: {body}"));
            if let Some(wait) = retry_after {
                err = err.with_retry_after(wait);
            }
            return Err(err);
        }

        Ok(response.json().await?)
    }
}
