//! Deterministic request fingerprints.

use std::fmt;
use std::io::Write;

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::Result;
use crate::types::{Message, Request};

/// SHA-256 of the cacheable portion of a [`Request`].
///
/// Computed over canonical JSON (object keys sorted at every depth, no
/// whitespace), so two logically identical requests hash the same whatever
/// order their sampling parameters or payload keys were inserted in.
/// The `no_cache` flag is not part of the fingerprint.
///
/// ```rust
/// # use skirnir::{Message, Request};
/// # use skirnir::cache::Fingerprint;
/// let a = Request::new("m").message(Message::user("hi")).param("top_p", 1).param("seed", 7);
/// let b = Request::new("m").message(Message::user("hi")).param("seed", 7).param("top_p", 1);
/// assert_eq!(Fingerprint::of(&a).unwrap(), Fingerprint::of(&b).unwrap());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

#[derive(Serialize)]
struct Cacheable<'a> {
    model: &'a str,
    scope: Option<&'a str>,
    messages: &'a [Message],
    temperature: Option<f64>,
    sampling: &'a Map<String, Value>,
    payload: &'a Value,
}

impl Fingerprint {
    pub fn of(request: &Request) -> Result<Self> {
        let view = Cacheable {
            model: &request.model,
            scope: request.scope.as_deref(),
            messages: &request.messages,
            temperature: request.temperature,
            sampling: &request.sampling,
            payload: &request.payload,
        };
        let value = serde_json::to_value(&view)?;
        let mut canonical = Vec::with_capacity(256);
        write_canonical(&mut canonical, &value)?;
        Ok(Self(Sha256::digest(&canonical).into()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for Fingerprint {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &hex::encode(self.0)[..12])
    }
}

fn write_canonical(out: &mut Vec<u8>, value: &Value) -> Result<()> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key)?;
                out.push(b':');
                write_canonical(out, &map[key])?;
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(out, item)?;
            }
            out.push(b']');
        }
        scalar => out.write_all(serde_json::to_string(scalar)?.as_bytes())?,
    }
    Ok(())
}
