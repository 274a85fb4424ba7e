//! Tagged decoding of request bodies.
//!
//! Gateways see arbitrary bytes. Rather than treating them as loosely-typed
//! JSON, bodies are decoded once into an [`Envelope`] variant. Decoding never
//! fails: anything that is not a recognised shape becomes
//! [`Envelope::Opaque`].

use serde::Deserialize;
use serde_json::{Map, Value};

/// A single JSON-RPC 2.0 request or notification.
///
/// Only `method` is required. The other members are kept as raw values so a
/// malformed `jsonrpc` or `id` never changes how the call is classified.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol marker, `"2.0"` for well-formed requests.
    #[serde(default)]
    pub jsonrpc: Option<Value>,
    /// Request id; absent for notifications.
    #[serde(default)]
    pub id: Option<Value>,
    /// Method name (e.g. `"tools/call"`).
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Reads a call from any JSON object with a string `method`.
    #[must_use]
    pub fn from_object(map: &Map<String, Value>) -> Option<Self> {
        let method = map.get("method")?.as_str()?.to_owned();
        Some(Self {
            jsonrpc: map.get("jsonrpc").cloned(),
            id: map.get("id").cloned(),
            method,
            params: map.get("params").cloned(),
        })
    }

    /// Returns the tool name of a `tools/call` request (`params.name`).
    #[must_use]
    pub fn tool_name(&self) -> Option<&str> {
        if self.method != "tools/call" {
            return None;
        }
        self.params.as_ref()?.get("name")?.as_str()
    }
}

/// A decoded request body.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// One JSON-RPC request object.
    JsonRpc(JsonRpcRequest),
    /// A JSON-RPC batch with at least one well-formed request.
    JsonRpcBatch(Vec<JsonRpcRequest>),
    /// A JSON object that is not JSON-RPC (A2A task payloads, plain JSON APIs).
    Document(Map<String, Value>),
    /// Empty, non-JSON or otherwise unrecognised body.
    Opaque,
}

impl Envelope {
    /// Decodes a request body. Never fails.
    #[must_use]
    pub fn decode(body: &[u8]) -> Self {
        let Ok(value) = serde_json::from_slice::<Value>(body) else {
            return Self::Opaque;
        };
        match value {
            Value::Object(map) => match JsonRpcRequest::from_object(&map) {
                Some(request) => Self::JsonRpc(request),
                None => Self::Document(map),
            },
            Value::Array(items) => {
                let calls: Vec<JsonRpcRequest> = items
                    .iter()
                    .filter_map(Value::as_object)
                    .filter_map(JsonRpcRequest::from_object)
                    .collect();
                if calls.is_empty() {
                    Self::Opaque
                } else {
                    Self::JsonRpcBatch(calls)
                }
            }
            _ => Self::Opaque,
        }
    }

    /// Iterates over every JSON-RPC call carried by this envelope.
    pub fn calls(&self) -> impl Iterator<Item = &JsonRpcRequest> {
        let calls: &[JsonRpcRequest] = match self {
            Self::JsonRpc(request) => std::slice::from_ref(request),
            Self::JsonRpcBatch(requests) => requests,
            Self::Document(_) | Self::Opaque => &[],
        };
        calls.iter()
    }

    /// Returns `true` if any carried JSON-RPC call uses one of `methods`.
    ///
    /// A batch counts as soon as one member matches, so wrapping a chargeable
    /// call in a batch does not hide it.
    #[must_use]
    pub fn invokes_any<S: AsRef<str>>(&self, methods: &[S]) -> bool {
        self.calls()
            .any(|call| methods.iter().any(|m| m.as_ref() == call.method))
    }

    /// Returns the first tool name found in a `tools/call` request.
    #[must_use]
    pub fn tool_name(&self) -> Option<&str> {
        self.calls().find_map(JsonRpcRequest::tool_name)
    }

    /// Looks up an A2A `skill_id`.
    ///
    /// Checked at the top level, then in `params`, then in `params.metadata`.
    #[must_use]
    pub fn skill_id(&self) -> Option<&str> {
        match self {
            Self::Document(map) => lookup_skill(map),
            Self::JsonRpc(request) => request
                .params
                .as_ref()
                .and_then(Value::as_object)
                .and_then(lookup_skill),
            Self::JsonRpcBatch(_) | Self::Opaque => None,
        }
    }
}

fn lookup_skill(map: &Map<String, Value>) -> Option<&str> {
    if let Some(skill) = map.get("skill_id").and_then(Value::as_str) {
        return Some(skill);
    }
    let params = map.get("params").and_then(Value::as_object);
    if let Some(skill) = params.and_then(|p| p.get("skill_id")).and_then(Value::as_str) {
        return Some(skill);
    }
    let metadata = params
        .or(Some(map))
        .and_then(|p| p.get("metadata"))
        .and_then(Value::as_object)?;
    metadata.get("skill_id").and_then(Value::as_str)
}
