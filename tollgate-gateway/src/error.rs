//! Error types for the gateway binary.

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tollgate::amount::AmountParseError;
use tollgate_http::FacilitatorClientError;

/// Startup and configuration failures. Any of these ends the process.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The config file exists but could not be read.
    #[error("failed to read config {path}: {source}")]
    ReadConfig {
        /// Path that was read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The config file is not valid TOML for [`GatewayConfig`](crate::config::GatewayConfig).
    #[error("invalid config: {0}")]
    ParseConfig(#[from] toml::de::Error),

    /// A required setting is missing or inconsistent.
    #[error("invalid config: {0}")]
    Invalid(String),

    /// The payment amount is not an integer in the asset's smallest unit.
    #[error("invalid config: {0}")]
    Amount(#[from] AmountParseError),

    /// The facilitator URL could not be used.
    #[error("facilitator client: {0}")]
    Facilitator(#[from] FacilitatorClientError),

    /// The upstream HTTP client could not be built.
    #[error("upstream client: {0}")]
    Client(#[from] reqwest::Error),

    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// Failures forwarding a request to the upstream service.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// The client request body exceeded the forwarding ceiling.
    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge {
        /// Configured ceiling in bytes.
        limit: usize,
    },

    /// The client request body could not be read.
    #[error("failed to read request body: {0}")]
    Body(String),

    /// The upstream did not answer in time.
    #[error("upstream timed out")]
    Timeout(#[source] reqwest::Error),

    /// The upstream could not be reached.
    #[error("upstream unavailable: {0}")]
    Unavailable(#[source] reqwest::Error),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err)
        } else {
            Self::Unavailable(err)
        }
    }
}

impl IntoResponse for UpstreamError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Body(_) => StatusCode::BAD_REQUEST,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Unavailable(_) => StatusCode::BAD_GATEWAY,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
