//! Gateway configuration.
//!
//! Loads configuration from a TOML file with support for environment variable
//! expansion in string values. Variables use `$VAR` or `${VAR}` syntax.
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8080
//! upstream = "http://127.0.0.1:3000"
//!
//! [payment]
//! enabled = true
//! network = "base-sepolia"
//! pay_to = "$PAY_TO_ADDRESS"
//! amount = "10000"
//! asset = "0x036CbD53842c5426634e7929541eC2318f3dCF7e"
//! asset_name = "USDC"
//! asset_version = "2"
//!
//! [capture]
//! enabled = true
//! agent_id = "weather-agent"
//! api_key = "${INGEST_API_KEY}"
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG` - Path to configuration file (default: `tollgate.toml`)
//! - `HOST` - Override server bind address
//! - `PORT` - Override server port
//! - Secrets referenced by `$VAR` in the config file

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tollgate::extract::ProtocolTag;
use tollgate::proto::PriceTag;
use tollgate_http::constants::{
    DEFAULT_BODY_LIMIT, DEFAULT_CHARGEABLE_METHOD, DEFAULT_EXCLUDED_PATHS,
    DEFAULT_FACILITATOR_URL, DEFAULT_GATED_PREFIX, DEFAULT_INGEST_URL,
};
use tollgate_http::server::GateSettings;
use tollgate_http::{CaptureConfig, PathSet, TransportConfig};
use url::Url;

use crate::error::GatewayError;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listener and upstream.
    #[serde(default)]
    pub server: ServerConfig,
    /// Payment enforcement.
    #[serde(default)]
    pub payment: PaymentConfig,
    /// Request capture and log delivery.
    #[serde(default)]
    pub capture: CaptureSection,
}

/// Listener and upstream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    #[serde(default = "default_host")]
    pub host: IpAddr,
    /// Bind port (default: `8080`).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Service requests are forwarded to.
    #[serde(default = "default_upstream")]
    pub upstream: Url,
    /// Upstream request timeout in seconds (default: `60`).
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: u64,
    /// Ceiling for forwarded request bodies in bytes (default: 10 MiB).
    #[serde(default = "default_max_body")]
    pub max_body: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            upstream: default_upstream(),
            upstream_timeout: default_upstream_timeout(),
            max_body: default_max_body(),
        }
    }
}

/// Payment enforcement settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    /// Whether tool calls are charged (default: `false`).
    #[serde(default)]
    pub enabled: bool,
    /// Facilitator base URL.
    #[serde(default = "default_facilitator_url")]
    pub facilitator_url: String,
    /// Facilitator call timeout in seconds (default: `10`).
    #[serde(default = "default_facilitator_timeout")]
    pub facilitator_timeout: u64,
    /// Network identifier (default: `base-sepolia`).
    #[serde(default = "default_network")]
    pub network: String,
    /// Payee address.
    #[serde(default)]
    pub pay_to: String,
    /// Price per call in the asset's smallest unit, as a string.
    #[serde(default)]
    pub amount: String,
    /// Asset contract address.
    #[serde(default)]
    pub asset: String,
    /// Asset domain name used for signature verification.
    #[serde(default)]
    pub asset_name: Option<String>,
    /// Asset domain version used for signature verification.
    #[serde(default)]
    pub asset_version: Option<String>,
    /// Authorization timeout in seconds (default: `300`).
    #[serde(default = "default_payment_timeout")]
    pub timeout: u64,
    /// Description advertised in 402 responses.
    #[serde(default)]
    pub description: String,
    /// Path prefix whose POST bodies are inspected (default: `/mcp`).
    #[serde(default = "default_gated_prefix")]
    pub gated_prefix: String,
    /// JSON-RPC methods that require payment (default: `["tools/call"]`).
    #[serde(default = "default_chargeable_methods")]
    pub chargeable_methods: Vec<String>,
    /// Scheme for resource URLs built from the `Host` header (default: `https`).
    #[serde(default = "default_resource_scheme")]
    pub resource_scheme: String,
    /// Public origin used for resource URLs instead of the `Host` header.
    #[serde(default)]
    pub base_url: Option<Url>,
    /// Ceiling for the buffered upstream response in bytes (default: 8 MiB).
    #[serde(default = "default_max_buffered_response")]
    pub max_buffered_response: usize,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            facilitator_url: default_facilitator_url(),
            facilitator_timeout: default_facilitator_timeout(),
            network: default_network(),
            pay_to: String::new(),
            amount: String::new(),
            asset: String::new(),
            asset_name: None,
            asset_version: None,
            timeout: default_payment_timeout(),
            description: String::new(),
            gated_prefix: default_gated_prefix(),
            chargeable_methods: default_chargeable_methods(),
            resource_scheme: default_resource_scheme(),
            base_url: None,
            max_buffered_response: default_max_buffered_response(),
        }
    }
}

impl PaymentConfig {
    /// Builds the price tag charged per call.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Amount`] if `amount` is not a non-negative integer.
    pub fn price_tag(&self) -> Result<PriceTag, GatewayError> {
        let mut price_tag = PriceTag::new(
            self.network.as_str(),
            self.pay_to.as_str(),
            self.amount.parse()?,
            self.asset.as_str(),
        )
        .with_timeout_seconds(self.timeout)
        .with_description(self.description.as_str());
        if let (Some(name), Some(version)) = (&self.asset_name, &self.asset_version) {
            price_tag = price_tag.with_asset_extra(name.as_str(), version.as_str());
        }
        price_tag.mime_type = "application/json".to_owned();
        Ok(price_tag)
    }

    /// Facilitator call deadline.
    #[must_use]
    pub const fn facilitator_timeout(&self) -> Duration {
        Duration::from_secs(self.facilitator_timeout)
    }
}

/// Capture and log delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSection {
    /// Whether requests are captured (default: `false`).
    #[serde(default)]
    pub enabled: bool,
    /// Agent identifier sent with every batch.
    #[serde(default)]
    pub agent_id: String,
    /// Ingest API key.
    #[serde(default)]
    pub api_key: String,
    /// Ingest endpoint.
    #[serde(default = "default_ingest_url")]
    pub ingest_url: Url,
    /// Ingest request timeout in seconds (default: `10`).
    #[serde(default = "default_ingest_timeout")]
    pub ingest_timeout: u64,
    /// Fixed protocol tag; detected per request when unset.
    #[serde(default)]
    pub protocol: Option<ProtocolTag>,
    /// Ceiling for captured body text in bytes.
    #[serde(default = "default_body_limit")]
    pub body_limit: usize,
    /// Whether body text is captured (default: `true`).
    #[serde(default = "default_true")]
    pub capture_bodies: bool,
    /// Paths never captured. A trailing `*` matches a prefix.
    #[serde(default = "default_excluded_paths")]
    pub excluded_paths: Vec<String>,
    /// Paths captured without body text.
    #[serde(default)]
    pub bodyless_paths: Vec<String>,
    /// Entries per ingest request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seconds between timer-driven flushes.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: u64,
    /// Delivery attempts per entry before it is dropped.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    /// Seconds the circuit stays open.
    #[serde(default = "default_breaker_cooldown")]
    pub breaker_cooldown: u64,
    /// Queue bound; the oldest entries are dropped beyond it.
    #[serde(default = "default_max_buffered")]
    pub max_buffered: usize,
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            enabled: false,
            agent_id: String::new(),
            api_key: String::new(),
            ingest_url: default_ingest_url(),
            ingest_timeout: default_ingest_timeout(),
            protocol: None,
            body_limit: default_body_limit(),
            capture_bodies: true,
            excluded_paths: default_excluded_paths(),
            bodyless_paths: Vec::new(),
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            max_retries: default_max_retries(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown: default_breaker_cooldown(),
            max_buffered: default_max_buffered(),
        }
    }
}

impl CaptureSection {
    /// Settings for the [`BatchTransport`](tollgate_http::BatchTransport).
    #[must_use]
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig::new(self.ingest_url.clone(), &self.api_key, &self.agent_id)
            .with_batch_size(self.batch_size)
            .with_flush_interval(Duration::from_secs(self.flush_interval))
            .with_max_retries(self.max_retries)
            .with_breaker(
                self.breaker_threshold,
                Duration::from_secs(self.breaker_cooldown),
            )
            .with_max_buffered_entries(self.max_buffered)
            .with_request_timeout(Duration::from_secs(self.ingest_timeout))
    }

    /// Settings for the [`CaptureLayer`](tollgate_http::CaptureLayer).
    #[must_use]
    pub fn capture_config(&self) -> CaptureConfig {
        let mut config = CaptureConfig::default()
            .with_body_limit(self.body_limit)
            .with_capture_bodies(self.capture_bodies)
            .with_excluded_paths(PathSet::new(&self.excluded_paths))
            .with_bodyless_paths(PathSet::new(&self.bodyless_paths));
        if let Some(protocol) = self.protocol {
            config = config.with_protocol(protocol);
        }
        config
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

const fn default_port() -> u16 {
    8080
}

fn default_upstream() -> Url {
    Url::parse("http://127.0.0.1:3000").expect("valid default upstream URL")
}

const fn default_upstream_timeout() -> u64 {
    60
}

const fn default_max_body() -> usize {
    10 * 1024 * 1024
}

fn default_facilitator_url() -> String {
    DEFAULT_FACILITATOR_URL.to_owned()
}

const fn default_facilitator_timeout() -> u64 {
    10
}

fn default_network() -> String {
    "base-sepolia".to_owned()
}

const fn default_payment_timeout() -> u64 {
    PriceTag::DEFAULT_TIMEOUT_SECONDS
}

fn default_gated_prefix() -> String {
    DEFAULT_GATED_PREFIX.to_owned()
}

fn default_chargeable_methods() -> Vec<String> {
    vec![DEFAULT_CHARGEABLE_METHOD.to_owned()]
}

fn default_resource_scheme() -> String {
    "https".to_owned()
}

const fn default_max_buffered_response() -> usize {
    GateSettings::DEFAULT_MAX_BUFFERED_RESPONSE
}

fn default_ingest_url() -> Url {
    Url::parse(DEFAULT_INGEST_URL).expect("valid default ingest URL")
}

const fn default_ingest_timeout() -> u64 {
    TransportConfig::DEFAULT_REQUEST_TIMEOUT.as_secs()
}

const fn default_body_limit() -> usize {
    DEFAULT_BODY_LIMIT
}

const fn default_true() -> bool {
    true
}

fn default_excluded_paths() -> Vec<String> {
    DEFAULT_EXCLUDED_PATHS.iter().map(|&p| p.to_owned()).collect()
}

const fn default_batch_size() -> usize {
    TransportConfig::DEFAULT_BATCH_SIZE
}

const fn default_flush_interval() -> u64 {
    TransportConfig::DEFAULT_FLUSH_INTERVAL.as_secs()
}

const fn default_max_retries() -> u32 {
    TransportConfig::DEFAULT_MAX_RETRIES
}

const fn default_breaker_threshold() -> u32 {
    TransportConfig::DEFAULT_BREAKER_THRESHOLD
}

const fn default_breaker_cooldown() -> u64 {
    TransportConfig::DEFAULT_BREAKER_COOLDOWN.as_secs()
}

const fn default_max_buffered() -> usize {
    TransportConfig::DEFAULT_MAX_BUFFERED
}

impl GatewayConfig {
    /// Loads configuration from `path`, falling back to defaults when the
    /// file does not exist.
    ///
    /// `$VAR` / `${VAR}` references are expanded from the process
    /// environment, and `HOST` / `PORT` override the file values.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        let content = if path.exists() {
            std::fs::read_to_string(path).map_err(|source| GatewayError::ReadConfig {
                path: path.to_owned(),
                source,
            })?
        } else {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            String::new()
        };
        let env = |name: &str| std::env::var(name).ok();
        let mut config = Self::parse(&content, env)?;
        config.apply_overrides(env);
        config.validate()?;
        Ok(config)
    }

    /// Parses TOML after expanding variables with `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ParseConfig`] on invalid TOML.
    pub fn parse(
        content: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, GatewayError> {
        let expanded = expand_env_vars(content, lookup);
        Ok(toml::from_str(&expanded)?)
    }

    /// Applies `HOST` / `PORT` overrides. Unparsable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("HOST").and_then(|h| h.parse().ok()) {
            self.server.host = host;
        }
        if let Some(port) = lookup("PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
    }

    /// Checks that every enabled section has what it needs.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Invalid`] naming the first missing setting.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.payment.enabled {
            require("payment.pay_to", &self.payment.pay_to)?;
            require("payment.asset", &self.payment.asset)?;
            require("payment.amount", &self.payment.amount)?;
            self.payment.price_tag()?;
            if self.payment.chargeable_methods.is_empty() {
                return Err(GatewayError::Invalid(
                    "payment.chargeable_methods must not be empty".to_owned(),
                ));
            }
        }
        if self.capture.enabled {
            require("capture.agent_id", &self.capture.agent_id)?;
            require("capture.api_key", &self.capture.api_key)?;
        }
        Ok(())
    }
}

/// Rejects empty values and unresolved `$VAR` references.
fn require(name: &str, value: &str) -> Result<(), GatewayError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(GatewayError::Invalid(format!("{name} is required")));
    }
    if value.starts_with('$') {
        return Err(GatewayError::Invalid(format!(
            "{name} references an unset variable ({value})"
        )));
    }
    Ok(())
}

/// Expands `$VAR` and `${VAR}` patterns using `lookup`.
///
/// Unresolved variables are left as-is.
fn expand_env_vars(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }
        let braced = chars.next_if_eq(&'{').is_some();

        let mut name = String::new();
        let mut closed = false;
        while let Some(&c) = chars.peek() {
            if braced && c == '}' {
                chars.next();
                closed = true;
                break;
            }
            if !braced && !c.is_ascii_alphanumeric() && c != '_' {
                break;
            }
            name.push(c);
            chars.next();
        }

        match lookup(&name).filter(|_| !name.is_empty()) {
            Some(value) => result.push_str(&value),
            None => {
                result.push('$');
                if braced {
                    result.push('{');
                }
                result.push_str(&name);
                if closed {
                    result.push('}');
                }
            }
        }
    }

    result
}
