//! Provider-agnostic request envelope

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::Message;

/// A request routed through the fallback chain.
///
/// The manager never looks inside `payload`; it is handed to the
/// [`ProviderInvoker`](crate::providers::ProviderInvoker) as-is. The other
/// fields form the normalized view used for cacheability decisions and the
/// request [`Fingerprint`](crate::cache::Fingerprint).
///
/// ```rust
/// # use skirnir::{Message, Request};
/// let request = Request::new("llama3:8b")
///     .message(Message::user("Summarise the changelog"))
///     .temperature(0.0)
///     .param("max_tokens", 256);
/// assert_eq!(request.messages.len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Model identifier as understood by the providers.
    pub model: String,
    /// Optional namespace the request is scoped to (for example a provider
    /// family or tenant). Part of the fingerprint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Sampling temperature; drives the default cacheability policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Other sampling parameters (`top_p`, `max_tokens`, `seed`, ...).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub sampling: Map<String, Value>,
    /// Opaque provider-specific body.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    /// Opt this request out of the response cache.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_cache: bool,
}

impl Request {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    /// Append a message.
    pub fn message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    /// Replace all messages.
    pub fn messages(mut self, messages: impl IntoIterator<Item = Message>) -> Self {
        self.messages = messages.into_iter().collect();
        self
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set a sampling parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.sampling.insert(key.into(), value.into());
        self
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Never serve or store this request through the response cache.
    pub fn no_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }

    /// Body to put on the wire: the opaque payload when present, otherwise
    /// the normalized fields with sampling parameters flattened in.
    pub fn wire_body(&self) -> Value {
        if !self.payload.is_null() {
            return self.payload.clone();
        }
        let mut body = Map::new();
        body.insert("model".into(), Value::String(self.model.clone()));
        body.insert(
            "messages".into(),
            serde_json::to_value(&self.messages).unwrap_or(Value::Array(Vec::new())),
        );
        if let Some(t) = self.temperature {
            body.insert("temperature".into(), Value::from(t));
        }
        for (k, v) in &self.sampling {
            body.entry(k.clone()).or_insert_with(|| v.clone());
        }
        Value::Object(body)
    }
}
