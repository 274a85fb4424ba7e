//! A [`Facilitator`] implementation that talks to a _remote_ x402 facilitator over HTTP.
//!
//! [`HttpFacilitatorClient`] handles the `/verify` and `/settle` endpoints of
//! a remote facilitator.
//!
//! ## Error Handling
//!
//! Custom error types capture detailed failure contexts, including
//! - URL construction
//! - HTTP transport failures
//! - JSON deserialization errors
//! - Unexpected HTTP status responses

use std::time::Duration;

use http::{HeaderMap, StatusCode};
use reqwest::Client;
use tollgate::facilitator::{BoxFuture, Facilitator, FacilitatorError};
use tollgate::proto::{
    PaymentProof, PaymentRequirements, SettleRequest, SettleResponse, VerifyRequest,
    VerifyResponse,
};
use tracing::Instrument;
use url::Url;

use crate::constants::DEFAULT_FACILITATOR_URL;

/// A client for communicating with a remote x402 facilitator.
#[derive(Clone, Debug)]
pub struct HttpFacilitatorClient {
    /// Base URL of the facilitator (e.g. `https://facilitator.example/`)
    base_url: Url,
    /// Full URL for `POST /verify` requests
    verify_url: Url,
    /// Full URL for `POST /settle` requests
    settle_url: Url,
    client: Client,
    /// Custom headers sent with each request
    headers: HeaderMap,
    timeout: Duration,
}

/// Errors that can occur while interacting with a remote facilitator.
#[derive(Debug, thiserror::Error)]
pub enum FacilitatorClientError {
    /// URL parse error.
    #[error("URL parse error: {context}: {source}")]
    UrlParse {
        /// Human-readable context.
        context: &'static str,
        /// The underlying parse error.
        #[source]
        source: url::ParseError,
    },
    /// HTTP transport error, including timeouts.
    #[error("HTTP error: {context}: {source}")]
    Http {
        /// Human-readable context.
        context: &'static str,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
    /// JSON deserialization error.
    #[error("Failed to deserialize JSON: {context}: {source}")]
    JsonDeserialization {
        /// Human-readable context.
        context: &'static str,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
    /// Unexpected HTTP status code.
    #[error("Unexpected HTTP status {status}: {context}: {body}")]
    HttpStatus {
        /// Human-readable context.
        context: &'static str,
        /// The HTTP status code.
        status: StatusCode,
        /// The response body.
        body: String,
    },
}

impl HttpFacilitatorClient {
    /// Default per-request timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Constructs a new client from a base URL.
    ///
    /// `./verify` and `./settle` are resolved relative to the base, so the
    /// base should end with a slash.
    ///
    /// # Errors
    ///
    /// Returns [`FacilitatorClientError`] if URL construction fails.
    pub fn try_new(base_url: Url) -> Result<Self, FacilitatorClientError> {
        let verify_url =
            base_url
                .join("./verify")
                .map_err(|e| FacilitatorClientError::UrlParse {
                    context: "Failed to construct ./verify URL",
                    source: e,
                })?;
        let settle_url =
            base_url
                .join("./settle")
                .map_err(|e| FacilitatorClientError::UrlParse {
                    context: "Failed to construct ./settle URL",
                    source: e,
                })?;
        Ok(Self {
            base_url,
            verify_url,
            settle_url,
            client: Client::new(),
            headers: HeaderMap::new(),
            timeout: Self::DEFAULT_TIMEOUT,
        })
    }

    /// Returns the base URL used by this client.
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Returns the computed `./verify` URL.
    pub const fn verify_url(&self) -> &Url {
        &self.verify_url
    }

    /// Returns the computed `./settle` URL.
    pub const fn settle_url(&self) -> &Url {
        &self.settle_url
    }

    /// Attaches custom headers (e.g. API keys) to all future requests.
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends a `POST /verify` request to the facilitator.
    ///
    /// # Errors
    ///
    /// Returns [`FacilitatorClientError`] if the HTTP request fails.
    pub async fn verify_request(
        &self,
        request: &VerifyRequest,
    ) -> Result<VerifyResponse, FacilitatorClientError> {
        self.post_json(&self.verify_url, "POST /verify", request)
            .instrument(tracing::info_span!(
                "tollgate.facilitator.verify",
                timeout = ?self.timeout
            ))
            .await
    }

    /// Sends a `POST /settle` request to the facilitator.
    ///
    /// # Errors
    ///
    /// Returns [`FacilitatorClientError`] if the HTTP request fails.
    pub async fn settle_request(
        &self,
        request: &SettleRequest,
    ) -> Result<SettleResponse, FacilitatorClientError> {
        self.post_json(&self.settle_url, "POST /settle", request)
            .instrument(tracing::info_span!(
                "tollgate.facilitator.settle",
                timeout = ?self.timeout
            ))
            .await
    }

    /// POSTs a JSON body and decodes a JSON response. Any non-2xx status is
    /// an error.
    async fn post_json<T, R>(
        &self,
        url: &Url,
        context: &'static str,
        payload: &T,
    ) -> Result<R, FacilitatorClientError>
    where
        T: serde::Serialize + Sync + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let mut req = self
            .client
            .post(url.clone())
            .json(payload)
            .timeout(self.timeout);
        for (key, value) in &self.headers {
            req = req.header(key, value);
        }
        let http_response = req
            .send()
            .await
            .map_err(|e| FacilitatorClientError::Http { context, source: e })?;

        let status = http_response.status();
        let result = if status.is_success() {
            http_response
                .json::<R>()
                .await
                .map_err(|e| FacilitatorClientError::JsonDeserialization { context, source: e })
        } else {
            let body = http_response.text().await.unwrap_or_default();
            Err(FacilitatorClientError::HttpStatus {
                context,
                status,
                body,
            })
        };

        if let Err(err) = &result {
            tracing::error!(error = %err, "Request to facilitator failed");
        }

        result
    }
}

impl Default for HttpFacilitatorClient {
    fn default() -> Self {
        Self::try_from(DEFAULT_FACILITATOR_URL).expect("default facilitator URL is valid")
    }
}

impl Facilitator for HttpFacilitatorClient {
    fn verify<'a>(
        &'a self,
        proof: &'a PaymentProof,
        requirements: &'a PaymentRequirements,
    ) -> BoxFuture<'a, Result<VerifyResponse, FacilitatorError>> {
        Box::pin(async move {
            let request = VerifyRequest::new(proof, requirements);
            Ok(self.verify_request(&request).await?)
        })
    }

    fn settle<'a>(
        &'a self,
        proof: &'a PaymentProof,
        requirements: &'a PaymentRequirements,
    ) -> BoxFuture<'a, Result<SettleResponse, FacilitatorError>> {
        Box::pin(async move {
            let request = SettleRequest::new(proof, requirements);
            Ok(self.settle_request(&request).await?)
        })
    }
}

/// Converts a string URL into a client, normalising to a single trailing slash.
impl TryFrom<&str> for HttpFacilitatorClient {
    type Error = FacilitatorClientError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let mut normalized = value.trim_end_matches('/').to_string();
        normalized.push('/');
        let url = Url::parse(&normalized).map_err(|e| FacilitatorClientError::UrlParse {
            context: "Failed to parse base url",
            source: e,
        })?;
        Self::try_new(url)
    }
}

impl TryFrom<String> for HttpFacilitatorClient {
    type Error = FacilitatorClientError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}
