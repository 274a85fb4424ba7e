//! Forwarding to the upstream service.
//!
//! Requests are forwarded with their method, path, query, headers and body.
//! Hop-by-hop headers are stripped in both directions. Response bodies are
//! streamed back without buffering; the payment layer buffers on its own
//! when it needs to.

use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{self, HeaderMap, HeaderName};
use axum::http::Uri;
use axum::response::{IntoResponse, Response};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use url::Url;

use crate::error::UpstreamError;

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Client for the upstream service, shared across requests.
#[derive(Debug, Clone)]
pub struct Upstream {
    client: reqwest::Client,
    base: Url,
    max_body: usize,
}

impl Upstream {
    /// Creates a client forwarding to `base`.
    ///
    /// # Errors
    ///
    /// Returns [`reqwest::Error`] if the HTTP client cannot be built.
    pub fn new(base: Url, timeout: Duration, max_body: usize) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base,
            max_body,
        })
    }

    /// Upstream URL for an incoming request URI. The base path is kept as a prefix.
    #[must_use]
    pub fn target(&self, uri: &Uri) -> Url {
        let mut url = self.base.clone();
        let prefix = self.base.path().trim_end_matches('/');
        url.set_path(&format!("{prefix}{}", uri.path()));
        url.set_query(uri.query());
        url
    }

    /// Forwards `req` and returns the upstream response.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError`] if the body is too large or the upstream
    /// cannot be reached.
    pub async fn forward(&self, req: Request) -> Result<Response, UpstreamError> {
        let (parts, body) = req.into_parts();
        let body = match Limited::new(body, self.max_body).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) if err.is::<LengthLimitError>() => {
                return Err(UpstreamError::BodyTooLarge {
                    limit: self.max_body,
                });
            }
            Err(err) => return Err(UpstreamError::Body(err.to_string())),
        };

        let url = self.target(&parts.uri);
        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        tracing::debug!(method = %parts.method, %url, "forwarding upstream");
        let upstream = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Removes hop-by-hop headers, including any named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::try_from(name.trim()).ok())
        .collect();
    for name in &named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Fallback handler forwarding every unmatched request upstream.
pub async fn proxy(State(upstream): State<Upstream>, req: Request) -> Response {
    match upstream.forward(req).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(error = %err, "upstream request failed");
            err.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use tower::ServiceExt;
    use wiremock::matchers::{body_string, header as header_eq, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn upstream(base: &str) -> Upstream {
        Upstream::new(Url::parse(base).unwrap(), Duration::from_secs(5), 1024).unwrap()
    }

    fn app(upstream: Upstream) -> Router {
        Router::new().fallback(proxy).with_state(upstream)
    }

    #[test]
    fn target_keeps_base_path_and_query() {
        let upstream = upstream("http://tools.internal:7000/api/");
        let uri: Uri = "/mcp/call?x=1".parse().unwrap();
        assert_eq!(
            upstream.target(&uri).as_str(),
            "http://tools.internal:7000/api/mcp/call?x=1"
        );
    }

    #[test]
    fn strips_connection_named_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "keep-alive, x-session".parse().unwrap());
        headers.insert("x-session", "abc".parse().unwrap());
        headers.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::CONTENT_TYPE));
    }

    #[tokio::test]
    async fn forwards_method_path_query_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(query_param("session", "9"))
            .and(header_eq("x-agent-id", "agent-7"))
            .and(body_string("{\"jsonrpc\":\"2.0\"}"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("x-upstream", "yes")
                    .set_body_string("created"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let req = axum::http::Request::post("/mcp?session=9")
            .header("x-agent-id", "agent-7")
            .header("connection", "close")
            .body(Body::from("{\"jsonrpc\":\"2.0\"}"))
            .unwrap();
        let response = app(upstream(&server.uri())).oneshot(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-upstream"], "yes");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"created");
    }

    #[tokio::test]
    async fn upstream_errors_pass_through_unchanged() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let req = axum::http::Request::get("/anything").body(Body::empty()).unwrap();
        let response = app(upstream(&server.uri())).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_bad_gateway() {
        let req = axum::http::Request::get("/").body(Body::empty()).unwrap();
        let response = app(upstream("http://127.0.0.1:9")).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn oversize_body_is_rejected_before_forwarding() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let req = axum::http::Request::post("/upload")
            .body(Body::from(vec![b'x'; 2048]))
            .unwrap();
        let response = app(upstream(&server.uri())).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
