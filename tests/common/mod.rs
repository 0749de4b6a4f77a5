//! Scripted provider invokers shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::time::Instant;

use skirnir::providers::{ClassifiedError, ProviderConfig, ProviderEndpoint, ProviderInvoker};
use skirnir::pool::PooledConnection;
use skirnir::{Message, Request, RetryConfig};

/// What one invocation does.
#[derive(Debug, Clone)]
pub enum Step {
    /// Answer `{"provider": <name>}`.
    Ok,
    Transient,
    Connection,
    Permanent,
    /// Never answer.
    Hang,
    /// Answer after sleeping.
    Slow(Duration),
    /// Answer with this body.
    Body(Value),
}

/// Replays a script of steps, then repeats a fallback step forever.
pub struct ScriptedInvoker {
    name: &'static str,
    script: Mutex<VecDeque<Step>>,
    then: Step,
    calls: AtomicUsize,
}

impl ScriptedInvoker {
    pub fn ok(name: &'static str) -> Self {
        Self::always(name, Step::Ok)
    }

    pub fn always(name: &'static str, step: Step) -> Self {
        Self::script(name, [], step)
    }

    pub fn script(name: &'static str, steps: impl IntoIterator<Item = Step>, then: Step) -> Self {
        Self {
            name,
            script: Mutex::new(steps.into_iter().collect()),
            then,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn answer(&self) -> Value {
        json!({ "provider": self.name })
    }
}

#[async_trait]
impl ProviderInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        _request: &Request,
        _connection: &PooledConnection,
        _deadline: Instant,
    ) -> Result<Value, ClassifiedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.then.clone());
        match step {
            Step::Ok => Ok(self.answer()),
            Step::Body(body) => Ok(body),
            Step::Transient => Err(ClassifiedError::transient(format!("{} overloaded", self.name))),
            Step::Connection => Err(ClassifiedError::connection("connection reset by peer")),
            Step::Permanent => Err(ClassifiedError::permanent("invalid model")),
            Step::Hang => std::future::pending::<Result<Value, ClassifiedError>>().await,
            Step::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(self.answer())
            }
        }
    }
}

/// Endpoint on a loopback address; no socket is ever opened by the pool.
pub fn endpoint(name: &str, port: u16, config: ProviderConfig) -> ProviderEndpoint {
    ProviderEndpoint::new(name, &format!("http://127.0.0.1:{port}"))
        .unwrap()
        .with_config(config)
}

/// Provider config without retry jitter, so timings are exact.
pub fn quiet_config() -> ProviderConfig {
    ProviderConfig::new().retry(
        RetryConfig::new()
            .initial_delay(Duration::from_millis(10))
            .jitter(false),
    )
}

/// Deterministic request: cacheable under the default policy.
pub fn cold_request(text: &str) -> Request {
    Request::new("test-model")
        .message(Message::user(text))
        .temperature(0.0)
}

/// Sampled request: never cached under the default policy.
pub fn hot_request(text: &str) -> Request {
    Request::new("test-model")
        .message(Message::user(text))
        .temperature(0.9)
}
