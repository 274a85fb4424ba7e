//! Assembles the gateway router from configuration.
//!
//! Layer order, outermost first: CORS, request tracing, capture, payment,
//! then the upstream proxy. Capture sits outside payment so rejected calls
//! are recorded too.

use std::sync::Arc;
use std::time::Duration;

use axum::http::Method;
use axum::routing::get;
use axum::{Json, Router};
use tollgate_http::{
    BatchTransport, CaptureLayer, HttpFacilitatorClient, PaymentGate, TransportStats,
};
use tower_http::cors;
use tower_http::trace::TraceLayer;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::proxy::{Upstream, proxy};

/// A ready-to-serve router and the transport behind its capture layer.
#[allow(missing_debug_implementations)] // Router does not implement Debug
pub struct Gateway {
    /// The full request pipeline.
    pub router: Router,
    /// Log transport, present when capture is enabled.
    pub transport: Option<BatchTransport>,
}

impl Gateway {
    /// Builds the pipeline described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] if a client cannot be built or the price is invalid.
    pub fn build(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let upstream = Upstream::new(
            config.server.upstream.clone(),
            Duration::from_secs(config.server.upstream_timeout),
            config.server.max_body,
        )?;

        let mut router = Router::new()
            .route("/health", get(health))
            .fallback(proxy)
            .with_state(upstream);

        if config.payment.enabled {
            let payment = &config.payment;
            let facilitator = HttpFacilitatorClient::try_from(payment.facilitator_url.as_str())?
                .with_timeout(payment.facilitator_timeout());
            tracing::info!(
                facilitator = %facilitator.base_url(),
                prefix = %payment.gated_prefix,
                methods = ?payment.chargeable_methods,
                "payment enforcement enabled"
            );
            let mut gate = PaymentGate::new(Arc::new(facilitator), payment.price_tag()?)
                .with_path_prefix(payment.gated_prefix.as_str())
                .with_chargeable_methods(payment.chargeable_methods.iter().cloned())
                .with_resource_scheme(payment.resource_scheme.as_str())
                .with_max_request_body(config.server.max_body)
                .with_max_buffered_response(payment.max_buffered_response)
                .with_verify_timeout(payment.facilitator_timeout())
                .with_settle_timeout(payment.facilitator_timeout());
            if let Some(base_url) = &payment.base_url {
                gate = gate.with_base_url(base_url.clone());
            }
            router = router.layer(gate);
        }

        let transport = if config.capture.enabled {
            let transport = BatchTransport::new(config.capture.transport_config());
            tracing::info!(
                ingest = %config.capture.ingest_url,
                agent_id = %config.capture.agent_id,
                "request capture enabled"
            );
            router = router.layer(
                CaptureLayer::new(transport.clone()).with_config(config.capture.capture_config()),
            );
            Some(transport)
        } else {
            None
        };

        let router = router.layer(TraceLayer::new_for_http()).layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

        Ok(Self { router, transport })
    }
}

/// Closes `transport`, logging the outcome of its final flush.
pub async fn drain(transport: &BatchTransport) -> TransportStats {
    match transport.close().await {
        Ok(sent) => tracing::info!(sent, "final log flush complete"),
        Err(err) => tracing::error!(error = %err, "final log flush failed"),
    }
    let stats = transport.stats();
    tracing::info!(
        sent = stats.sent,
        dropped = stats.dropped,
        buffered = stats.buffered,
        "log transport drained"
    );
    stats
}

/// Health check endpoint.
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CALL: &str = r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"forecast"}}"#;

    fn config(upstream: &MockServer, facilitator: &MockServer, ingest: &MockServer) -> GatewayConfig {
        let toml = format!(
            r#"
            [server]
            upstream = "{upstream}"

            [payment]
            enabled = true
            facilitator_url = "{facilitator}"
            pay_to = "0xpayee"
            amount = "2500"
            asset = "0xasset"

            [capture]
            enabled = true
            agent_id = "agent-9"
            api_key = "key-9"
            ingest_url = "{ingest}/v1/ingest"
            batch_size = 1
            "#,
            upstream = upstream.uri(),
            facilitator = facilitator.uri(),
            ingest = ingest.uri(),
        );
        let config = GatewayConfig::parse(&toml, |_| None).unwrap();
        config.validate().unwrap();
        config
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_served_locally() {
        let gateway = Gateway::build(&GatewayConfig::default()).unwrap();
        assert!(gateway.transport.is_none());
        let req = Request::get("/health").body(Body::empty()).unwrap();
        let response = gateway.router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn drain_flushes_and_reports_failures() {
        let ingest = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&ingest)
            .await;
        let url = format!("{}/v1/ingest", ingest.uri()).parse().unwrap();
        let transport = BatchTransport::new(tollgate_http::TransportConfig::new(url, "k", "a"));
        transport.add(tollgate::log::LogEntry::new("POST", "/mcp"));
        let stats = drain(&transport).await;
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.buffered, 0);

        let down = BatchTransport::new(tollgate_http::TransportConfig::new(
            "http://127.0.0.1:9/v1/ingest".parse().unwrap(),
            "k",
            "a",
        ));
        down.add(tollgate::log::LogEntry::new("POST", "/mcp"));
        let stats = drain(&down).await;
        assert_eq!(stats.sent, 0);
        assert_eq!(stats.buffered, 1);
    }

    #[tokio::test]
    async fn unpaid_call_is_rejected_and_captured() {
        let upstream = MockServer::start().await;
        let facilitator = MockServer::start().await;
        let ingest = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&upstream)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/ingest"))
            .and(header("authorization", "Bearer key-9"))
            .and(body_partial_json(serde_json::json!({"agent_id": "agent-9"})))
            .respond_with(ResponseTemplate::new(200))
            .mount(&ingest)
            .await;

        let gateway = Gateway::build(&config(&upstream, &facilitator, &ingest)).unwrap();
        let req = Request::post("/mcp")
            .header("host", "gw.example.com")
            .body(Body::from(CALL))
            .unwrap();
        let response = gateway.router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        let body = body_json(response).await;
        assert_eq!(body["accepts"][0]["resource"], "https://gw.example.com/mcp");
        assert_eq!(body["accepts"][0]["maxAmountRequired"], "2500");

        let transport = gateway.transport.unwrap();
        transport.close().await.unwrap();
        let requests = ingest.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let batch: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(batch["entries"][0]["statusCode"], 402);
        assert_eq!(batch["entries"][0]["toolName"], "forecast");
    }

    #[tokio::test]
    async fn paid_call_is_forwarded_and_settled() {
        let upstream = MockServer::start().await;
        let facilitator = MockServer::start().await;
        let ingest = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"result\":\"sunny\"}"))
            .expect(1)
            .mount(&upstream)
            .await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"isValid": true, "payer": "0xpayer"})),
            )
            .expect(1)
            .mount(&facilitator)
            .await;
        Mock::given(method("POST"))
            .and(path("/settle"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"success": true, "transaction": "0xtx"})),
            )
            .expect(1)
            .mount(&facilitator)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&ingest)
            .await;

        let gateway = Gateway::build(&config(&upstream, &facilitator, &ingest)).unwrap();
        let req = Request::post("/mcp")
            .header("host", "gw.example.com")
            .header("x-payment", r#"{"x402Version":1,"payload":{"signature":"0x1"}}"#)
            .body(Body::from(CALL))
            .unwrap();
        let response = gateway.router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["result"], "sunny");

        gateway.transport.unwrap().close().await.unwrap();
    }
}
