//! HTTP-specific constants for the gateway pipeline.

/// Payment proof header (client → server). Looked up case-insensitively.
pub const PAYMENT_HEADER: &str = "x-payment";

/// Caller identity header recorded as `customerId`.
pub const AGENT_ID_HEADER: &str = "x-agent-id";

/// First hop of a proxied request's client address chain.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Client address set by single-hop reverse proxies.
pub const REAL_IP_HEADER: &str = "x-real-ip";

/// Request headers copied into captured entries.
pub const CAPTURED_HEADERS: [&str; 3] = ["user-agent", "content-type", "referer"];

/// Public x402 facilitator service URL.
pub const DEFAULT_FACILITATOR_URL: &str = "https://x402.org/facilitator";

/// Default ingest endpoint for captured entries.
pub const DEFAULT_INGEST_URL: &str = "http://localhost:9093/v1/ingest";

/// Default ceiling for captured body text, in bytes.
pub const DEFAULT_BODY_LIMIT: usize = 16 * 1024;

/// Paths that are never captured unless overridden.
pub const DEFAULT_EXCLUDED_PATHS: [&str; 5] = ["/health", "/healthz", "/readyz", "/_health", "/mcp/sse"];

/// Path prefix gated by the payment layer.
pub const DEFAULT_GATED_PREFIX: &str = "/mcp";

/// JSON-RPC method that requires payment.
pub const DEFAULT_CHARGEABLE_METHOD: &str = "tools/call";
