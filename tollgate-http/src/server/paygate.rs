//! Core payment gate logic for enforcing x402 payments on tool calls.
//!
//! The [`Paygate`] struct handles the full payment lifecycle for one gated
//! request: decoding the body, deciding whether the call is chargeable,
//! verifying the proof with the facilitator, buffering the downstream
//! response, settling on success, and returning 402 responses when payment
//! is required.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum_core::body::Body;
use axum_core::extract::Request;
use axum_core::response::Response;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST};
use http::request::Parts;
use http::Method;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use serde_json::json;
use tollgate::envelope::Envelope;
use tollgate::facilitator::Facilitator;
use tollgate::proto::{PaymentProof, PaymentRequired, PaymentRequirements, PriceTag};
use tower::Service;
use tracing::{Instrument, instrument};
use url::Url;

use super::error::{PaygateError, VerificationError};
use crate::constants::{DEFAULT_CHARGEABLE_METHOD, DEFAULT_GATED_PREFIX, PAYMENT_HEADER};

/// Header name as shown to callers in rejection messages.
const PAYMENT_HEADER_DISPLAY: &str = "X-PAYMENT";

/// Decides which requests are gated and which calls are chargeable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeSelector {
    /// Only POST requests whose path starts with this prefix are inspected.
    pub path_prefix: String,
    /// JSON-RPC methods that require payment.
    pub methods: Vec<String>,
}

impl Default for ChargeSelector {
    fn default() -> Self {
        Self {
            path_prefix: DEFAULT_GATED_PREFIX.to_owned(),
            methods: vec![DEFAULT_CHARGEABLE_METHOD.to_owned()],
        }
    }
}

impl ChargeSelector {
    /// Returns `true` if the request must have its body inspected.
    #[must_use]
    pub fn gates(&self, method: &Method, path: &str) -> bool {
        method == Method::POST && path.starts_with(self.path_prefix.as_str())
    }

    /// Returns `true` if the decoded body invokes a chargeable method.
    #[must_use]
    pub fn is_chargeable(&self, envelope: &Envelope) -> bool {
        envelope.invokes_any(&self.methods)
    }
}

/// Settings shared by every request passing through one payment layer.
#[derive(Debug, Clone)]
pub struct GateSettings {
    /// Terms charged per chargeable call.
    pub price_tag: PriceTag,
    /// Which requests are gated.
    pub selector: ChargeSelector,
    /// Public origin of the service. When unset the resource URL is built
    /// from the `Host` header and [`Self::resource_scheme`].
    pub base_url: Option<Url>,
    /// Scheme used for resource URLs built from the `Host` header.
    pub resource_scheme: String,
    /// Ceiling for the gated request body.
    pub max_request_body: usize,
    /// Ceiling for the buffered downstream response.
    pub max_buffered_response: usize,
    /// Deadline for a facilitator `verify` call.
    pub verify_timeout: Duration,
    /// Deadline for a facilitator `settle` call.
    pub settle_timeout: Duration,
}

impl GateSettings {
    /// Default gated request body ceiling (1 MiB).
    pub const DEFAULT_MAX_REQUEST_BODY: usize = 1024 * 1024;
    /// Default buffered response ceiling (8 MiB).
    pub const DEFAULT_MAX_BUFFERED_RESPONSE: usize = 8 * 1024 * 1024;
    /// Default facilitator call deadline.
    pub const DEFAULT_FACILITATOR_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates settings charging `price_tag` with every other value defaulted.
    #[must_use]
    pub fn new(price_tag: PriceTag) -> Self {
        Self {
            price_tag,
            selector: ChargeSelector::default(),
            base_url: None,
            resource_scheme: "https".to_owned(),
            max_request_body: Self::DEFAULT_MAX_REQUEST_BODY,
            max_buffered_response: Self::DEFAULT_MAX_BUFFERED_RESPONSE,
            verify_timeout: Self::DEFAULT_FACILITATOR_TIMEOUT,
            settle_timeout: Self::DEFAULT_FACILITATOR_TIMEOUT,
        }
    }
}

/// Outcome of inspecting a gated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Not a chargeable call; forward untouched.
    Passthrough,
    /// Chargeable, and payment was not accepted.
    Rejected {
        /// Terms the caller can retry with.
        requirements: PaymentRequirements,
        /// Why the payment was refused.
        reason: VerificationError,
    },
    /// Chargeable, and the facilitator accepted the proof.
    Verified {
        /// The proof to settle.
        proof: PaymentProof,
        /// The terms it was verified against.
        requirements: PaymentRequirements,
    },
}

/// Payment gate for one request.
#[allow(missing_debug_implementations)]
pub struct Paygate<TFacilitator> {
    /// The facilitator for verifying and settling payments
    pub facilitator: TFacilitator,
    /// Layer-wide settings
    pub settings: Arc<GateSettings>,
}

impl<TFacilitator> Paygate<TFacilitator> {
    /// Calls the inner service inside its own span.
    async fn call_inner<S>(mut inner: S, req: Request) -> Response
    where
        S: Service<Request, Response = Response, Error = Infallible>,
    {
        match inner.call(req).instrument(tracing::info_span!("inner")).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }

    /// Full URL of the requested resource, without the query string.
    #[must_use]
    pub fn resource_url(&self, parts: &Parts) -> String {
        let path = parts.uri.path();
        if let Some(base) = &self.settings.base_url {
            let mut url = base.clone();
            url.set_path(path);
            url.set_query(None);
            return url.to_string();
        }
        let host = parts
            .headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .filter(|host| !host.is_empty())
            .or_else(|| parts.uri.authority().map(http::uri::Authority::as_str))
            .unwrap_or("localhost");
        format!("{}://{host}{path}", self.settings.resource_scheme)
    }
}

impl<TFacilitator> Paygate<TFacilitator>
where
    TFacilitator: Facilitator,
{
    /// Handles a gated request, turning every failure into a response.
    ///
    /// # Errors
    ///
    /// This method is infallible (`Infallible` error type).
    #[instrument(name = "tollgate.paygate", skip_all)]
    pub async fn handle_request<S>(self, inner: S, req: Request) -> Result<Response, Infallible>
    where
        S: Service<Request, Response = Response, Error = Infallible>,
    {
        match self.handle_request_fallible(inner, req).await {
            Ok(response) => Ok(response),
            Err(err) => Ok(error_into_response(err)),
        }
    }

    /// Handles a gated request, returning refusals and body errors as
    /// [`PaygateError`].
    ///
    /// # Errors
    ///
    /// Returns [`PaygateError`] if payment is required or a body exceeds its ceiling.
    pub async fn handle_request_fallible<S>(
        &self,
        inner: S,
        req: Request,
    ) -> Result<Response, PaygateError>
    where
        S: Service<Request, Response = Response, Error = Infallible>,
    {
        let (parts, body) = req.into_parts();
        let body = self.read_request_body(body).await?;
        let envelope = Envelope::decode(&body);

        match self.decide(&parts, &envelope).await {
            GateDecision::Passthrough => {
                tracing::debug!("not a chargeable call, passing through");
                let req = Request::from_parts(parts, Body::from(body));
                Ok(Self::call_inner(inner, req).await)
            }
            GateDecision::Rejected {
                requirements,
                reason,
            } => {
                tracing::info!(resource = %requirements.resource, %reason, "payment required");
                Err(PaygateError::PaymentRequired {
                    reason,
                    requirements: Box::new(requirements),
                })
            }
            GateDecision::Verified {
                proof,
                requirements,
            } => {
                let req = Request::from_parts(parts, Body::from(body));
                self.execute(inner, req, &proof, &requirements).await
            }
        }
    }

    /// Decides what to do with a gated request whose body is `envelope`.
    pub async fn decide(&self, parts: &Parts, envelope: &Envelope) -> GateDecision {
        if !self.settings.selector.is_chargeable(envelope) {
            return GateDecision::Passthrough;
        }
        let requirements = self
            .settings
            .price_tag
            .requirements_for(self.resource_url(parts));

        let Some(header) = parts.headers.get(PAYMENT_HEADER) else {
            return GateDecision::Rejected {
                requirements,
                reason: VerificationError::PaymentHeaderRequired(PAYMENT_HEADER_DISPLAY),
            };
        };
        let Some(proof) = PaymentProof::decode(header.as_bytes()) else {
            return GateDecision::Rejected {
                requirements,
                reason: VerificationError::InvalidPaymentHeader,
            };
        };

        match self.verify(&proof, &requirements).await {
            Ok(()) => GateDecision::Verified {
                proof,
                requirements,
            },
            Err(reason) => GateDecision::Rejected {
                requirements,
                reason,
            },
        }
    }

    async fn read_request_body(&self, body: Body) -> Result<Bytes, PaygateError> {
        let limit = self.settings.max_request_body;
        match Limited::new(body, limit).collect().await {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(err) if err.is::<LengthLimitError>() => Err(PaygateError::RequestTooLarge { limit }),
            Err(err) => Err(PaygateError::RequestBody(err.to_string())),
        }
    }

    /// Asks the facilitator about `proof`. A timeout counts as invalid.
    async fn verify(
        &self,
        proof: &PaymentProof,
        requirements: &PaymentRequirements,
    ) -> Result<(), VerificationError> {
        let verification = tokio::time::timeout(
            self.settings.verify_timeout,
            self.facilitator.verify(proof, requirements),
        )
        .await;

        match verification {
            Ok(Ok(response)) if response.is_valid => {
                tracing::debug!(payer = ?response.payer, "payment verified");
                Ok(())
            }
            Ok(Ok(response)) => Err(VerificationError::VerificationFailed(
                response
                    .invalid_reason
                    .unwrap_or_else(|| "Payment verification failed".to_owned()),
            )),
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "facilitator verify failed");
                Err(VerificationError::VerificationFailed(format!(
                    "Payment verification failed: {err}"
                )))
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.settings.verify_timeout, "facilitator verify timed out");
                Err(VerificationError::VerificationFailed(
                    "Payment verification timed out".to_owned(),
                ))
            }
        }
    }

    /// Runs the downstream service with the response buffered, settles if it
    /// succeeded, then replays the buffered response.
    async fn execute<S>(
        &self,
        inner: S,
        req: Request,
        proof: &PaymentProof,
        requirements: &PaymentRequirements,
    ) -> Result<Response, PaygateError>
    where
        S: Service<Request, Response = Response, Error = Infallible>,
    {
        let response = Self::call_inner(inner, req).await;
        let (parts, body) = response.into_parts();

        let limit = self.settings.max_buffered_response;
        let body = match Limited::new(body, limit).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) if err.is::<LengthLimitError>() => {
                tracing::error!(limit, "downstream response too large to buffer, not settling");
                return Err(PaygateError::ResponseTooLarge { limit });
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to buffer downstream response, not settling");
                return Err(PaygateError::ResponseBody(err.to_string()));
            }
        };

        if parts.status.as_u16() < 400 {
            self.settle(proof, requirements).await;
        } else {
            tracing::debug!(status = %parts.status, "downstream failed, skipping settlement");
        }

        Ok(Response::from_parts(parts, Body::from(body)))
    }

    /// Settles a verified payment. Failures are logged and never reach the caller.
    async fn settle(&self, proof: &PaymentProof, requirements: &PaymentRequirements) {
        let settlement = tokio::time::timeout(
            self.settings.settle_timeout,
            self.facilitator.settle(proof, requirements),
        )
        .await;

        match settlement {
            Ok(Ok(response)) if response.success => {
                tracing::info!(
                    transaction = ?response.transaction,
                    payer = ?response.payer,
                    "payment settled"
                );
            }
            Ok(Ok(response)) => {
                tracing::warn!(reason = ?response.error_reason, "payment settlement rejected");
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "payment settlement failed");
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.settings.settle_timeout, "payment settlement timed out");
            }
        }
    }
}

/// Converts a [`PaygateError`] into an HTTP response.
///
/// Refusals become a 402 with a [`PaymentRequired`] body. Everything else is
/// a JSON `{"error": ...}` body with the status from [`PaygateError::status`].
pub(crate) fn error_into_response(err: PaygateError) -> Response {
    let status = err.status();
    let body = match err {
        PaygateError::PaymentRequired {
            reason,
            requirements,
        } => {
            let payment_required = PaymentRequired::new(reason.to_string(), *requirements);
            serde_json::to_vec(&payment_required).expect("serialization failed")
        }
        err => json!({ "error": err.to_string() }).to_string().into_bytes(),
    };
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("Fail to construct response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use tollgate::amount::TokenAmount;

    fn gate(base_url: Option<&str>) -> Paygate<()> {
        let mut settings = GateSettings::new(PriceTag::new(
            "base-sepolia",
            "0xpayee",
            TokenAmount::new(1_000),
            "0xasset",
        ));
        settings.base_url = base_url.map(|url| Url::parse(url).unwrap());
        Paygate {
            facilitator: (),
            settings: Arc::new(settings),
        }
    }

    fn parts(uri: &str, host: Option<&str>) -> Parts {
        let mut builder = http::Request::post(uri);
        if let Some(host) = host {
            builder = builder.header(HOST, host);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn resource_url_uses_host_and_drops_query() {
        let gate = gate(None);
        let url = gate.resource_url(&parts("/mcp?session=1", Some("tools.example.com")));
        assert_eq!(url, "https://tools.example.com/mcp");
    }

    #[test]
    fn resource_url_falls_back_to_localhost() {
        assert_eq!(gate(None).resource_url(&parts("/mcp", None)), "https://localhost/mcp");
    }

    #[test]
    fn resource_url_prefers_base_url() {
        let gate = gate(Some("https://public.example.org/"));
        let url = gate.resource_url(&parts("/mcp/tools", Some("internal:8080")));
        assert_eq!(url, "https://public.example.org/mcp/tools");
    }

    #[test]
    fn selector_gates_post_under_prefix_only() {
        let selector = ChargeSelector::default();
        assert!(selector.gates(&Method::POST, "/mcp"));
        assert!(selector.gates(&Method::POST, "/mcp/messages"));
        assert!(!selector.gates(&Method::GET, "/mcp"));
        assert!(!selector.gates(&Method::POST, "/api"));
    }

    #[test]
    fn refusal_renders_as_payment_required() {
        let requirements = gate(None).settings.price_tag.requirements_for("https://a/mcp");
        let response = error_into_response(PaygateError::PaymentRequired {
            reason: VerificationError::PaymentHeaderRequired(PAYMENT_HEADER_DISPLAY),
            requirements: Box::new(requirements),
        });
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
    }

    #[test]
    fn body_errors_render_with_their_status() {
        let response = error_into_response(PaygateError::RequestTooLarge { limit: 10 });
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let response = error_into_response(PaygateError::ResponseTooLarge { limit: 10 });
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
