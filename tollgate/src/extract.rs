//! Request metadata extraction for captured log entries.
//!
//! Everything here is best effort. Malformed input yields `None` or empty
//! fields; nothing in this module returns an error.

use base64::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::Envelope;

/// The request protocol a captured entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolTag {
    /// Model Context Protocol (JSON-RPC tool calls).
    Mcp,
    /// Agent-to-agent task protocol.
    A2a,
    /// Anything else.
    Http,
}

impl ProtocolTag {
    /// Detects the protocol from a request path.
    ///
    /// `/mcp` and below is MCP, `/a2a` and `/.well-known/` is A2A, the rest is
    /// plain HTTP.
    #[must_use]
    pub fn detect(path: &str) -> Self {
        if path == "/mcp" || path.starts_with("/mcp/") {
            Self::Mcp
        } else if path == "/a2a" || path.starts_with("/a2a/") || path.starts_with("/.well-known/")
        {
            Self::A2a
        } else {
            Self::Http
        }
    }

    /// Lowercase wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mcp => "mcp",
            Self::A2a => "a2a",
            Self::Http => "http",
        }
    }
}

impl std::fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProtocolTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mcp" => Ok(Self::Mcp),
            "a2a" => Ok(Self::A2a),
            "http" => Ok(Self::Http),
            other => Err(format!("unknown protocol {other:?}, expected mcp, a2a or http")),
        }
    }
}

/// Payment details lifted from a client's payment header for analytics.
///
/// These are informational only. The payment gate never trusts them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PaymentFields {
    /// Amount the client claims to pay.
    pub amount: Option<f64>,
    /// Transaction hash.
    pub tx_hash: Option<String>,
    /// Token symbol or address.
    pub token: Option<String>,
    /// Payer address.
    pub payer: Option<String>,
}

#[derive(Deserialize)]
struct RawPaymentFields {
    #[serde(default)]
    amount: Option<Value>,
    #[serde(default)]
    tx_hash: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    payer: Option<String>,
}

impl PaymentFields {
    /// Parses a payment header value, raw JSON or base64-encoded JSON.
    ///
    /// A missing or malformed header yields all fields absent.
    #[must_use]
    pub fn from_header(header: Option<&[u8]>) -> Self {
        let Some(header) = header.map(<[u8]>::trim_ascii).filter(|h| !h.is_empty()) else {
            return Self::default();
        };
        let raw = serde_json::from_slice::<RawPaymentFields>(header)
            .ok()
            .or_else(|| {
                let decoded = BASE64_STANDARD.decode(header).ok()?;
                serde_json::from_slice::<RawPaymentFields>(&decoded).ok()
            });
        let Some(raw) = raw else {
            return Self::default();
        };
        let amount = match raw.amount {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok().filter(|a| a.is_finite()),
            _ => None,
        };
        Self {
            amount,
            tx_hash: raw.tx_hash,
            token: raw.token,
            payer: raw.payer,
        }
    }

    /// Returns `true` if no field was recognised.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.amount.is_none() && self.tx_hash.is_none() && self.token.is_none() && self.payer.is_none()
    }
}

/// Pluggable metadata extraction used by the capture layer.
pub trait Extractor: Send + Sync {
    /// Extracts the invoked tool name from a request.
    fn tool_name(&self, protocol: ProtocolTag, body: &[u8], path: &str) -> Option<String>;

    /// Extracts payment fields from the raw payment header, if any.
    fn payment_fields(&self, header: Option<&[u8]>) -> PaymentFields {
        PaymentFields::from_header(header)
    }
}

/// Standard extraction rules.
///
/// - MCP: `params.name` of a `tools/call` request
/// - A2A: `skill_id` (top level, `params`, or `params.metadata`)
/// - HTTP: the last non-empty path segment
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultExtractor;

impl Extractor for DefaultExtractor {
    fn tool_name(&self, protocol: ProtocolTag, body: &[u8], path: &str) -> Option<String> {
        match protocol {
            ProtocolTag::Mcp => Envelope::decode(body).tool_name().map(str::to_owned),
            ProtocolTag::A2a => Envelope::decode(body).skill_id().map(str::to_owned),
            ProtocolTag::Http => path
                .rsplit('/')
                .find(|segment| !segment.is_empty())
                .map(str::to_owned),
        }
    }
}
