//! Captured request records and the batches they are shipped in.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::extract::{PaymentFields, ProtocolTag};

/// `source` value for captured traffic.
pub const SOURCE_SDK: &str = "sdk";

/// `source` value for connection probes. Ingest treats these as health checks.
pub const SOURCE_PING: &str = "sdk_ping";

/// Client version tag sent with every batch.
pub const SDK_VERSION: &str = concat!("rust-", env!("CARGO_PKG_VERSION"));

/// One observed request/response cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// UUID v4 generated per request.
    pub request_id: String,
    /// HTTP method.
    pub method: String,
    /// URI path.
    pub path: String,
    /// Final status, `0` if no response was ever produced.
    pub status_code: u16,
    /// Elapsed time from interception to response completion.
    #[serde(rename = "responseMs")]
    pub response_time_ms: f64,
    /// Protocol tag.
    pub protocol: ProtocolTag,
    /// Invoked tool, when the body named one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Request body text, truncated to the capture ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    /// Response body text, truncated to the capture ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    /// Untruncated request body size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body_size: Option<u64>,
    /// Untruncated response body size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body_size: Option<u64>,
    /// Allow-listed request headers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    /// Originating client address.
    #[serde(rename = "ipAddress", default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    /// Claimed payment amount from the payment header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x402_amount: Option<f64>,
    /// Payment transaction hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x402_tx_hash: Option<String>,
    /// Payment token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x402_token: Option<String>,
    /// Payer address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x402_payer: Option<String>,
    /// Caller identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    /// `HTTP_<status>` for server errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    /// ISO-8601 UTC creation time.
    pub timestamp: String,
    /// `"sdk"` or `"sdk_ping"`.
    pub source: String,
}

impl LogEntry {
    /// Creates an entry with a fresh request id and timestamp and every
    /// optional field empty.
    #[must_use]
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            method: method.into(),
            path: path.into(),
            status_code: 0,
            response_time_ms: 0.0,
            protocol: ProtocolTag::Http,
            tool_name: None,
            request_body: None,
            response_body: None,
            request_body_size: None,
            response_body_size: None,
            headers: None,
            client_ip: None,
            x402_amount: None,
            x402_tx_hash: None,
            x402_token: None,
            x402_payer: None,
            customer_id: None,
            error_type: None,
            timestamp: utc_timestamp(),
            source: SOURCE_SDK.to_owned(),
        }
    }

    /// Creates the connection-probe entry sent by `verify_connection`.
    #[must_use]
    pub fn ping() -> Self {
        Self {
            status_code: 200,
            source: SOURCE_PING.to_owned(),
            ..Self::new("GET", "/_ping")
        }
    }

    /// Sets the final status, deriving `error_type` for server errors.
    pub fn set_status(&mut self, status: u16) {
        self.status_code = status;
        self.error_type = (status >= 500).then(|| format!("HTTP_{status}"));
    }

    /// Copies parsed payment header fields into the entry.
    pub fn set_payment(&mut self, fields: PaymentFields) {
        self.x402_amount = fields.amount;
        self.x402_tx_hash = fields.tx_hash;
        self.x402_token = fields.token;
        self.x402_payer = fields.payer;
    }
}

/// A delivery unit posted to the ingest API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogBatch {
    /// Service identity the entries belong to.
    pub agent_id: String,
    /// Client version tag.
    pub sdk_version: String,
    /// Fresh UUID per outbound POST.
    pub batch_id: String,
    /// Entries in capture order.
    pub entries: Vec<LogEntry>,
}

impl LogBatch {
    /// Wraps entries in a batch with a fresh id.
    #[must_use]
    pub fn new(agent_id: impl Into<String>, entries: Vec<LogEntry>) -> Self {
        Self {
            agent_id: agent_id.into(),
            sdk_version: SDK_VERSION.to_owned(),
            batch_id: uuid::Uuid::new_v4().to_string(),
            entries,
        }
    }
}

/// Destination for finished log entries.
///
/// `add` must not block on I/O; it runs on the request path.
pub trait LogSink: Send + Sync {
    /// Accepts one finished entry.
    fn add(&self, entry: LogEntry);
}

impl<T: LogSink + ?Sized> LogSink for std::sync::Arc<T> {
    fn add(&self, entry: LogEntry) {
        (**self).add(entry);
    }
}

/// Decodes a captured body prefix for storage, never exceeding `ceiling` bytes.
///
/// Invalid UTF-8 is replaced lossily. If a replacement character would push
/// the text past the ceiling, the text is cut back to the last full character
/// at or below it.
#[must_use]
pub fn truncate_body(captured: &[u8], ceiling: usize) -> String {
    let prefix = &captured[..captured.len().min(ceiling)];
    let mut text = String::from_utf8_lossy(prefix).into_owned();
    if text.len() > ceiling {
        let mut cut = ceiling;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

/// Formats the current time as ISO-8601 UTC with microseconds and a trailing `Z`.
fn utc_timestamp() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.6fZ")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_serializes_with_ingest_field_names() {
        let mut entry = LogEntry::new("POST", "/mcp");
        entry.protocol = ProtocolTag::Mcp;
        entry.response_time_ms = 12.5;
        entry.client_ip = Some("10.0.0.1".into());
        entry.x402_tx_hash = Some("0xabc".into());
        entry.set_status(503);

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["statusCode"], 503);
        assert_eq!(value["responseMs"], 12.5);
        assert_eq!(value["protocol"], "mcp");
        assert_eq!(value["ipAddress"], "10.0.0.1");
        assert_eq!(value["x402TxHash"], "0xabc");
        assert_eq!(value["errorType"], "HTTP_503");
        assert_eq!(value["source"], "sdk");
        assert!(value.get("toolName").is_none());
        assert!(value.get("requestBodySize").is_none());
    }

    #[test]
    fn timestamp_is_utc_with_z_suffix() {
        let entry = LogEntry::new("GET", "/");
        assert!(entry.timestamp.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&entry.timestamp).is_ok());
        assert!(uuid::Uuid::parse_str(&entry.request_id).is_ok());
    }

    #[test]
    fn success_clears_error_type() {
        let mut entry = LogEntry::new("GET", "/");
        entry.set_status(500);
        entry.set_status(404);
        assert_eq!(entry.error_type, None);
    }

    #[test]
    fn batch_has_snake_case_envelope() {
        let batch = LogBatch::new("agent-1", vec![LogEntry::ping()]);
        let value = serde_json::to_value(&batch).unwrap();
        assert_eq!(value["agent_id"], "agent-1");
        assert!(value["sdk_version"].as_str().unwrap().starts_with("rust-"));
        assert!(value["batch_id"].is_string());
        assert_eq!(value["entries"][0]["source"], "sdk_ping");
    }

    #[test]
    fn body_at_ceiling_is_kept_whole() {
        let body = vec![b'a'; 16];
        assert_eq!(truncate_body(&body, 16), "a".repeat(16));
        let longer = vec![b'a'; 17];
        assert_eq!(truncate_body(&longer, 16), "a".repeat(16));
    }

    #[test]
    fn split_multibyte_char_stays_within_ceiling() {
        // "é" is two bytes; the ceiling cuts it in half.
        let body = "aé".as_bytes();
        let text = truncate_body(body, 2);
        assert!(text.len() <= 2);
        assert!(text.starts_with('a'));
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let text = truncate_body(&[b'o', b'k', 0xff], 16);
        assert_eq!(text, "ok\u{fffd}");
    }
}
