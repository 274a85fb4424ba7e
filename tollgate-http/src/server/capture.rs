//! Observability capture layer.
//!
//! [`CaptureLayer`] records exactly one [`LogEntry`] per request/response
//! cycle and hands it to a [`LogSink`] (normally a
//! [`BatchTransport`](crate::transport::BatchTransport)). It sees everything
//! beneath it, including requests the payment layer rejects, so it should be
//! the outermost layer.
//!
//! Request and response bodies are observed while they stream; nothing is
//! buffered beyond the configured ceiling. The entry is completed when the
//! response body finishes or is dropped, or when the request is abandoned
//! before any response existed (status `0`).

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use axum::extract::ConnectInfo;
use axum_core::body::Body;
use axum_core::extract::Request;
use axum_core::response::Response;
use http::header::CONTENT_LENGTH;
use http::{HeaderMap, HeaderValue};
use http_body::Body as _;
use tokio::time::Instant;
use tollgate::extract::{DefaultExtractor, Extractor, ProtocolTag};
use tollgate::log::{LogEntry, LogSink, truncate_body};
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service};

use super::body::{BodyRecorder, CaptureBody, TeeBody};
use super::paths::PathSet;
use crate::constants::{
    AGENT_ID_HEADER, CAPTURED_HEADERS, DEFAULT_BODY_LIMIT, DEFAULT_EXCLUDED_PATHS,
    FORWARDED_FOR_HEADER, PAYMENT_HEADER, REAL_IP_HEADER,
};

/// What the capture layer records.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Ceiling for captured body text, in bytes.
    pub body_limit: usize,
    /// Whether body text is recorded at all. Sizes are always recorded.
    pub capture_bodies: bool,
    /// Paths that produce no entry.
    pub excluded_paths: PathSet,
    /// Paths whose entries omit body text.
    pub bodyless_paths: PathSet,
    /// Fixed protocol tag; detected from the path when `None`.
    pub protocol: Option<ProtocolTag>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            body_limit: DEFAULT_BODY_LIMIT,
            capture_bodies: true,
            excluded_paths: PathSet::new(DEFAULT_EXCLUDED_PATHS),
            bodyless_paths: PathSet::default(),
            protocol: None,
        }
    }
}

impl CaptureConfig {
    /// Sets the body text ceiling.
    #[must_use]
    pub const fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    /// Enables or disables body text capture.
    #[must_use]
    pub const fn with_capture_bodies(mut self, enabled: bool) -> Self {
        self.capture_bodies = enabled;
        self
    }

    /// Replaces the excluded path set.
    #[must_use]
    pub fn with_excluded_paths(mut self, paths: PathSet) -> Self {
        self.excluded_paths = paths;
        self
    }

    /// Replaces the bodyless path set.
    #[must_use]
    pub fn with_bodyless_paths(mut self, paths: PathSet) -> Self {
        self.bodyless_paths = paths;
        self
    }

    /// Pins the protocol tag instead of detecting it per request.
    #[must_use]
    pub const fn with_protocol(mut self, protocol: ProtocolTag) -> Self {
        self.protocol = Some(protocol);
        self
    }

    fn records_bodies_for(&self, path: &str) -> bool {
        self.capture_bodies && !self.bodyless_paths.contains(path)
    }
}

/// Tower [`Layer`] that records every request/response cycle.
#[derive(Clone)]
pub struct CaptureLayer {
    config: Arc<CaptureConfig>,
    sink: Arc<dyn LogSink>,
    extractor: Arc<dyn Extractor>,
}

impl std::fmt::Debug for CaptureLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureLayer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CaptureLayer {
    /// Creates a layer with default settings feeding `sink`.
    #[must_use]
    pub fn new(sink: impl LogSink + 'static) -> Self {
        Self {
            config: Arc::new(CaptureConfig::default()),
            sink: Arc::new(sink),
            extractor: Arc::new(DefaultExtractor),
        }
    }

    /// Replaces the capture settings.
    #[must_use]
    pub fn with_config(mut self, config: CaptureConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    /// Replaces the tool-name and payment-field extractor.
    #[must_use]
    pub fn with_extractor(mut self, extractor: impl Extractor + 'static) -> Self {
        self.extractor = Arc::new(extractor);
        self
    }
}

impl<S> Layer<S> for CaptureLayer
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    type Service = CaptureService;

    fn layer(&self, inner: S) -> Self::Service {
        CaptureService {
            config: Arc::clone(&self.config),
            sink: Arc::clone(&self.sink),
            extractor: Arc::clone(&self.extractor),
            inner: BoxCloneSyncService::new(inner),
        }
    }
}

/// Service produced by [`CaptureLayer`].
#[derive(Clone)]
#[allow(missing_debug_implementations)] // BoxCloneSyncService does not implement Debug
pub struct CaptureService {
    config: Arc<CaptureConfig>,
    sink: Arc<dyn LogSink>,
    extractor: Arc<dyn Extractor>,
    inner: BoxCloneSyncService<Request, Response, Infallible>,
}

impl Service<Request> for CaptureService {
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if self.config.excluded_paths.contains(req.uri().path()) {
            return Box::pin(inner.call(req));
        }

        let declared = req.body().size_hint().exact().or_else(|| {
            header_str(req.headers(), CONTENT_LENGTH.as_str()).and_then(|len| len.parse().ok())
        });
        let request_recorder = Arc::new(Mutex::new(
            BodyRecorder::new(self.config.body_limit).with_declared(declared),
        ));
        let mut pending = PendingEntry::start(
            &req,
            Arc::clone(&self.config),
            Arc::clone(&self.sink),
            Arc::clone(&self.extractor),
            Arc::clone(&request_recorder),
        );
        let req = req.map(|body| Body::new(TeeBody::new(body, request_recorder)));

        Box::pin(async move {
            // Dropping this future before the response exists drops `pending`,
            // which records the cycle with status 0.
            let response = inner.call(req).await?;
            pending.status = response.status().as_u16();
            Ok(response.map(|body| Body::new(CaptureBody::new(body, pending))))
        })
    }
}

/// Metadata for one in-flight cycle. Emits its entry exactly once, on drop.
pub(crate) struct PendingEntry {
    started: Instant,
    method: String,
    path: String,
    protocol: ProtocolTag,
    headers: BTreeMap<String, String>,
    client_ip: Option<String>,
    customer_id: Option<String>,
    payment_header: Option<HeaderValue>,
    request: Arc<Mutex<BodyRecorder>>,
    response: BodyRecorder,
    status: u16,
    config: Arc<CaptureConfig>,
    sink: Arc<dyn LogSink>,
    extractor: Arc<dyn Extractor>,
}

impl PendingEntry {
    fn start(
        req: &Request,
        config: Arc<CaptureConfig>,
        sink: Arc<dyn LogSink>,
        extractor: Arc<dyn Extractor>,
        request: Arc<Mutex<BodyRecorder>>,
    ) -> Self {
        let path = req.uri().path().to_owned();
        let headers = req.headers();
        Self {
            started: Instant::now(),
            method: req.method().as_str().to_owned(),
            protocol: config
                .protocol
                .unwrap_or_else(|| ProtocolTag::detect(&path)),
            path,
            headers: captured_headers(headers),
            client_ip: client_ip(req),
            customer_id: header_str(headers, AGENT_ID_HEADER).map(str::to_owned),
            payment_header: headers.get(PAYMENT_HEADER).cloned(),
            request,
            response: BodyRecorder::new(config.body_limit),
            status: 0,
            config,
            sink,
            extractor,
        }
    }

    pub(crate) fn record_response(&mut self, chunk: &[u8]) {
        self.response.record(chunk);
    }

    fn build(&self) -> LogEntry {
        let request = self
            .request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let with_bodies = self.config.records_bodies_for(&self.path);
        let limit = self.config.body_limit;
        let text = |recorder: &BodyRecorder| {
            (with_bodies && !recorder.captured().is_empty())
                .then(|| truncate_body(recorder.captured(), limit))
        };
        let size = |recorder: &BodyRecorder| (recorder.total() > 0).then(|| recorder.total());

        let mut entry = LogEntry::new(self.method.clone(), self.path.clone());
        entry.set_status(self.status);
        entry.response_time_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        entry.protocol = self.protocol;
        entry.tool_name = self
            .extractor
            .tool_name(self.protocol, request.captured(), &self.path);
        entry.request_body = text(&request);
        entry.response_body = text(&self.response);
        entry.request_body_size = size(&request);
        entry.response_body_size = size(&self.response);
        entry.headers = (!self.headers.is_empty()).then(|| self.headers.clone());
        entry.client_ip = self.client_ip.clone();
        entry.customer_id = self.customer_id.clone();
        entry.set_payment(
            self.extractor
                .payment_fields(self.payment_header.as_ref().map(HeaderValue::as_bytes)),
        );
        entry
    }
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let entry = self.build();
            tracing::debug!(
                request_id = %entry.request_id,
                method = %entry.method,
                path = %entry.path,
                status = entry.status_code,
                "request captured"
            );
            self.sink.add(entry);
        }));
        if outcome.is_err() {
            tracing::error!(path = %self.path, "failed to record request, entry discarded");
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn captured_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    CAPTURED_HEADERS
        .iter()
        .filter_map(|name| header_str(headers, name).map(|v| ((*name).to_owned(), v.to_owned())))
        .collect()
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`, then the socket peer.
fn client_ip(req: &Request) -> Option<String> {
    let headers = req.headers();
    header_str(headers, FORWARDED_FOR_HEADER)
        .and_then(|chain| chain.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .or_else(|| header_str(headers, REAL_IP_HEADER))
        .map(str::to_owned)
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
}
