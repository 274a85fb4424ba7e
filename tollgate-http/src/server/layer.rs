//! Tower layer for enforcing [x402](https://www.x402.org) payments on tool calls.
//!
//! Only POST requests under the gated path prefix have their body inspected.
//! Of those, only calls to a chargeable JSON-RPC method (by default
//! `tools/call`) require payment; every other request is forwarded with its
//! body replayed byte for byte.
//!
//! ## Settlement
//!
//! Settlement happens **after** the downstream service has produced a
//! successful (status below 400) response. The response is buffered until
//! settlement completes, so a failed call is never charged. Settlement
//! failures are logged and never change the response.
//!
//! ## Configuration Notes
//!
//! - **[`PaymentGate::with_base_url`]** sets the public origin used in resource URLs.
//!   If not set, the `Host` header and [`PaymentGate::with_resource_scheme`] are used.
//! - **[`PaymentGate::with_max_buffered_response`]** bounds the buffered response.
//!   Larger responses fail with `502 Bad Gateway` and are not settled.
//! - **[`PaymentGate::with_max_request_body`]** bounds the inspected request body.
//!   Larger bodies fail with `413 Payload Too Large`.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum_core::extract::Request;
use axum_core::response::Response;
use tollgate::facilitator::Facilitator;
use tollgate::proto::PriceTag;
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service};
use url::Url;

use super::paygate::{GateSettings, Paygate};

/// Payment enforcement layer builder.
///
/// Holds the facilitator and the settings shared by every request.
#[derive(Clone)]
pub struct PaymentGate<F> {
    facilitator: F,
    settings: Arc<GateSettings>,
}

impl<F: std::fmt::Debug> std::fmt::Debug for PaymentGate<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentGate")
            .field("facilitator", &self.facilitator)
            .field("settings", &self.settings)
            .finish()
    }
}

impl<F> PaymentGate<F> {
    /// Creates a gate charging `price_tag` for every chargeable call.
    #[must_use]
    pub fn new(facilitator: F, price_tag: PriceTag) -> Self {
        Self {
            facilitator,
            settings: Arc::new(GateSettings::new(price_tag)),
        }
    }

    /// Returns a reference to the underlying facilitator.
    pub const fn facilitator(&self) -> &F {
        &self.facilitator
    }

    /// Returns the current settings.
    #[must_use]
    pub fn settings(&self) -> &GateSettings {
        &self.settings
    }

    fn map_settings(mut self, f: impl FnOnce(&mut GateSettings)) -> Self {
        f(Arc::make_mut(&mut self.settings));
        self
    }

    /// Sets the path prefix under which POST bodies are inspected.
    #[must_use]
    pub fn with_path_prefix(self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.map_settings(|s| s.selector.path_prefix = prefix)
    }

    /// Replaces the JSON-RPC methods that require payment.
    #[must_use]
    pub fn with_chargeable_methods<I, S>(self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let methods = methods.into_iter().map(Into::into).collect();
        self.map_settings(|s| s.selector.methods = methods)
    }

    /// Sets the public origin used to build resource URLs.
    #[must_use]
    pub fn with_base_url(self, base_url: Url) -> Self {
        self.map_settings(|s| s.base_url = Some(base_url))
    }

    /// Sets the scheme used when the resource URL is built from the `Host` header.
    #[must_use]
    pub fn with_resource_scheme(self, scheme: impl Into<String>) -> Self {
        let scheme = scheme.into();
        self.map_settings(|s| s.resource_scheme = scheme)
    }

    /// Sets the ceiling for the inspected request body.
    #[must_use]
    pub fn with_max_request_body(self, limit: usize) -> Self {
        self.map_settings(|s| s.max_request_body = limit)
    }

    /// Sets the ceiling for the buffered downstream response.
    #[must_use]
    pub fn with_max_buffered_response(self, limit: usize) -> Self {
        self.map_settings(|s| s.max_buffered_response = limit)
    }

    /// Sets the facilitator `verify` deadline.
    #[must_use]
    pub fn with_verify_timeout(self, timeout: Duration) -> Self {
        self.map_settings(|s| s.verify_timeout = timeout)
    }

    /// Sets the facilitator `settle` deadline.
    #[must_use]
    pub fn with_settle_timeout(self, timeout: Duration) -> Self {
        self.map_settings(|s| s.settle_timeout = timeout)
    }
}

impl<S, F> Layer<S> for PaymentGate<F>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    F: Facilitator + Clone + 'static,
{
    type Service = PaymentGateService<F>;

    fn layer(&self, inner: S) -> Self::Service {
        PaymentGateService {
            facilitator: self.facilitator.clone(),
            settings: Arc::clone(&self.settings),
            inner: BoxCloneSyncService::new(inner),
        }
    }
}

/// Service produced by [`PaymentGate`].
#[derive(Clone)]
#[allow(missing_debug_implementations)] // BoxCloneSyncService does not implement Debug
pub struct PaymentGateService<F> {
    /// Payment facilitator
    facilitator: F,
    /// Layer-wide settings
    settings: Arc<GateSettings>,
    /// The wrapped service
    inner: BoxCloneSyncService<Request, Response, Infallible>,
}

impl<F> Service<Request> for PaymentGateService<F>
where
    F: Facilitator + Clone + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    /// Delegates readiness polling to the wrapped inner service.
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    /// Forwards ungated requests directly and runs gated ones through a [`Paygate`].
    fn call(&mut self, req: Request) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if !self
            .settings
            .selector
            .gates(req.method(), req.uri().path())
        {
            return Box::pin(inner.call(req));
        }

        let gate = Paygate {
            facilitator: self.facilitator.clone(),
            settings: Arc::clone(&self.settings),
        };
        Box::pin(gate.handle_request(inner, req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::test_support::{FakeFacilitator, Verdict};
    use axum::Router;
    use axum::body::{Body, Bytes};
    use axum::routing::{get, post};
    use base64::prelude::*;
    use http::StatusCode;
    use serde_json::{Value, json};
    use tollgate::amount::TokenAmount;
    use tollgate::proto::VerifyRequest;
    use tower::ServiceExt;

    const CALL: &str =
        r#"{"jsonrpc":"2.0","id":7,"method":"tools/call","params":{"name":"lookup","arguments":{}}}"#;
    const PROOF: &str = r#"{"x402Version":1,"scheme":"exact","payload":{"signature":"0xsig"}}"#;

    fn price_tag() -> PriceTag {
        PriceTag::new("base-sepolia", "0xpayee", TokenAmount::new(10_000), "0xasset")
            .with_asset_extra("USDC", "2")
    }

    fn app(gate: PaymentGate<FakeFacilitator>) -> Router {
        Router::new()
            .route("/mcp", post(|body: Bytes| async move { body }).get(|| async { "stream" }))
            .route(
                "/mcp/fail",
                post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "tool exploded") }),
            )
            .route("/mcp/big", post(|| async { "x".repeat(64) }))
            .route("/status", get(|| async { "up" }))
            .layer(gate)
    }

    fn call(path: &str, body: &str, proof: Option<&str>) -> http::Request<Body> {
        let mut builder = http::Request::post(path)
            .header("host", "tools.example.com")
            .header("content-type", "application/json");
        if let Some(proof) = proof {
            builder = builder.header("X-Payment", proof);
        }
        builder.body(Body::from(body.to_owned())).unwrap()
    }

    async fn send(app: Router, req: http::Request<Body>) -> (StatusCode, Bytes) {
        let response = app.oneshot(req).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body)
    }

    fn json_body(body: &Bytes) -> Value {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn get_requests_pass_through() {
        let facilitator = FakeFacilitator::new(Verdict::Valid);
        let gate = PaymentGate::new(facilitator.clone(), price_tag());
        let req = http::Request::get("/mcp").body(Body::empty()).unwrap();
        let (status, body) = send(app(gate), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"stream");
        assert!(facilitator.verifies().is_empty());
    }

    #[tokio::test]
    async fn non_chargeable_method_is_replayed_byte_for_byte() {
        let facilitator = FakeFacilitator::new(Verdict::Valid);
        let gate = PaymentGate::new(facilitator.clone(), price_tag());
        let list = "{ \"jsonrpc\": \"2.0\", \"id\": 1, \"method\": \"tools/list\" }\n";
        let (status, body) = send(app(gate), call("/mcp", list, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], list.as_bytes());
        assert!(facilitator.verifies().is_empty());
    }

    #[tokio::test]
    async fn undecodable_body_passes_through() {
        let gate = PaymentGate::new(FakeFacilitator::new(Verdict::Valid), price_tag());
        let (status, body) = send(app(gate), call("/mcp", "not json", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"not json");
    }

    #[tokio::test]
    async fn missing_proof_yields_payment_required() {
        let facilitator = FakeFacilitator::new(Verdict::Valid);
        let gate = PaymentGate::new(facilitator.clone(), price_tag());
        let (status, body) = send(app(gate), call("/mcp", CALL, None)).await;

        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        let body = json_body(&body);
        assert_eq!(body["x402Version"], 1);
        assert_eq!(body["error"], "X-PAYMENT header is required");
        assert_eq!(body["accepts"][0]["resource"], "https://tools.example.com/mcp");
        assert_eq!(body["accepts"][0]["maxAmountRequired"], "10000");
        assert_eq!(body["accepts"][0]["extra"]["name"], "USDC");
        assert!(facilitator.verifies().is_empty());
    }

    #[tokio::test]
    async fn malformed_proof_is_rejected_without_facilitator_call() {
        let facilitator = FakeFacilitator::new(Verdict::Valid);
        let gate = PaymentGate::new(facilitator.clone(), price_tag());
        let (status, body) = send(app(gate), call("/mcp", CALL, Some("invalid{json"))).await;

        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(json_body(&body)["error"], "Invalid or malformed payment header");
        assert!(facilitator.verifies().is_empty());
    }

    #[tokio::test]
    async fn invalid_proof_is_rejected_with_reason_and_not_settled() {
        let facilitator = FakeFacilitator::new(Verdict::Invalid("insufficient_funds".into()));
        let gate = PaymentGate::new(facilitator.clone(), price_tag());
        let (status, body) = send(app(gate), call("/mcp", CALL, Some(PROOF))).await;

        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(json_body(&body)["error"], "insufficient_funds");
        assert_eq!(facilitator.verifies().len(), 1);
        assert!(facilitator.settles().is_empty());
    }

    #[tokio::test]
    async fn valid_proof_settles_once_with_verified_terms() {
        let facilitator = FakeFacilitator::new(Verdict::Valid);
        let gate = PaymentGate::new(facilitator.clone(), price_tag());
        let (status, body) = send(app(gate), call("/mcp", CALL, Some(PROOF))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], CALL.as_bytes());

        let verifies = facilitator.verifies();
        let settles = facilitator.settles();
        assert_eq!(verifies.len(), 1);
        assert_eq!(settles, verifies);
        let expected: Value = serde_json::from_str(PROOF).unwrap();
        assert_eq!(settles[0].payment_payload, expected);
        assert_eq!(
            settles[0].payment_requirements.resource,
            "https://tools.example.com/mcp"
        );
    }

    #[tokio::test]
    async fn base64_proof_is_accepted() {
        let facilitator = FakeFacilitator::new(Verdict::Valid);
        let gate = PaymentGate::new(facilitator.clone(), price_tag());
        let encoded = BASE64_STANDARD.encode(PROOF);
        let (status, _) = send(app(gate), call("/mcp", CALL, Some(&encoded))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(facilitator.settles().len(), 1);
    }

    #[tokio::test]
    async fn downstream_failure_is_returned_and_not_settled() {
        let facilitator = FakeFacilitator::new(Verdict::Valid);
        let gate = PaymentGate::new(facilitator.clone(), price_tag());
        let (status, body) = send(app(gate), call("/mcp/fail", CALL, Some(PROOF))).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(&body[..], b"tool exploded");
        assert_eq!(facilitator.verifies().len(), 1);
        assert!(facilitator.settles().is_empty());
    }

    #[tokio::test]
    async fn settlement_failure_does_not_alter_response() {
        let facilitator = FakeFacilitator::new(Verdict::Valid).with_failing_settle();
        let gate = PaymentGate::new(facilitator.clone(), price_tag());
        let (status, body) = send(app(gate), call("/mcp", CALL, Some(PROOF))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], CALL.as_bytes());
        assert_eq!(facilitator.settles().len(), 1);
    }

    #[tokio::test]
    async fn facilitator_error_fails_closed() {
        let facilitator = FakeFacilitator::new(Verdict::Unreachable);
        let gate = PaymentGate::new(facilitator.clone(), price_tag());
        let (status, body) = send(app(gate), call("/mcp", CALL, Some(PROOF))).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        let error = json_body(&body)["error"].as_str().unwrap().to_owned();
        assert!(error.starts_with("Payment verification failed"));
        assert!(facilitator.settles().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn verify_timeout_fails_closed() {
        let facilitator =
            FakeFacilitator::new(Verdict::Valid).with_delay(Duration::from_secs(60));
        let gate = PaymentGate::new(facilitator.clone(), price_tag())
            .with_verify_timeout(Duration::from_secs(5));
        let (status, body) = send(app(gate), call("/mcp", CALL, Some(PROOF))).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(json_body(&body)["error"], "Payment verification timed out");
        assert!(facilitator.settles().is_empty());
    }

    #[tokio::test]
    async fn oversize_response_fails_without_settlement() {
        let facilitator = FakeFacilitator::new(Verdict::Valid);
        let gate = PaymentGate::new(facilitator.clone(), price_tag()).with_max_buffered_response(16);
        let (status, body) = send(app(gate), call("/mcp/big", CALL, Some(PROOF))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(json_body(&body)["error"], "Response body exceeds 16 bytes");
        assert!(facilitator.settles().is_empty());
    }

    #[tokio::test]
    async fn oversize_request_is_rejected() {
        let facilitator = FakeFacilitator::new(Verdict::Valid);
        let gate = PaymentGate::new(facilitator.clone(), price_tag()).with_max_request_body(32);
        let (status, _) = send(app(gate), call("/mcp", CALL, Some(PROOF))).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert!(facilitator.verifies().is_empty());
    }

    #[tokio::test]
    async fn base_url_overrides_host_in_resource() {
        let gate = PaymentGate::new(FakeFacilitator::new(Verdict::Valid), price_tag())
            .with_base_url(Url::parse("https://api.example.net").unwrap());
        let (_, body) = send(app(gate), call("/mcp", CALL, None)).await;
        assert_eq!(
            json_body(&body)["accepts"][0]["resource"],
            "https://api.example.net/mcp"
        );
    }

    #[tokio::test]
    async fn batch_with_a_tool_call_is_gated() {
        let facilitator = FakeFacilitator::new(Verdict::Valid);
        let gate = PaymentGate::new(facilitator, price_tag());
        let batch = json!([
            {"jsonrpc": "2.0", "id": 1, "method": "tools/list"},
            {"jsonrpc": "2.0", "id": 2, "method": "tools/call", "params": {"name": "lookup"}}
        ])
        .to_string();
        let (status, _) = send(app(gate), call("/mcp", &batch, None)).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    }

    #[tokio::test]
    async fn tool_call_with_non_string_version_is_gated() {
        let facilitator = FakeFacilitator::new(Verdict::Valid);
        let gate = PaymentGate::new(facilitator.clone(), price_tag());
        let body = r#"{"jsonrpc":2,"id":7,"method":"tools/call","params":{"name":"lookup"}}"#;
        let (status, body) = send(app(gate), call("/mcp", body, None)).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(json_body(&body)["error"], "X-PAYMENT header is required");
        assert!(facilitator.verifies().is_empty());
    }

    #[tokio::test]
    async fn batch_member_with_odd_envelope_is_gated() {
        let gate = PaymentGate::new(FakeFacilitator::new(Verdict::Valid), price_tag());
        let batch = json!([
            {"jsonrpc": "2.0", "id": 1, "method": "tools/list"},
            {"jsonrpc": 2, "id": {"nested": true}, "method": "tools/call"}
        ])
        .to_string();
        let (status, _) = send(app(gate), call("/mcp", &batch, None)).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    }

    #[tokio::test]
    async fn custom_prefix_and_methods() {
        let facilitator = FakeFacilitator::new(Verdict::Valid);
        let gate = PaymentGate::new(facilitator, price_tag())
            .with_path_prefix("/rpc")
            .with_chargeable_methods(["tools/list"]);
        let list = r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#;

        let app = Router::new()
            .route("/rpc", post(|| async { "listed" }))
            .route("/mcp", post(|| async { "free" }))
            .layer(gate);
        let (status, _) = send(app.clone(), call("/rpc", list, None)).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        let (status, body) = send(app, call("/mcp", CALL, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"free");
    }

    #[test]
    fn verify_request_shape_matches_facilitator_contract() {
        let proof = tollgate::proto::PaymentProof::decode(PROOF.as_bytes()).unwrap();
        let requirements = price_tag().requirements_for("https://tools.example.com/mcp");
        let value = serde_json::to_value(VerifyRequest::new(&proof, &requirements)).unwrap();
        assert_eq!(value["x402Version"], 1);
        assert_eq!(value["paymentPayload"]["payload"]["signature"], "0xsig");
        assert_eq!(value["paymentRequirements"]["payTo"], "0xpayee");
    }
}
