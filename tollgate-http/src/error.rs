//! Error types for log delivery.

use http::StatusCode;

/// Errors that can occur while delivering a batch to the ingest API.
///
/// None of these reach the request path: the transport absorbs them through
/// requeueing, the circuit breaker and the retry budget.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// HTTP transport failure, including timeouts.
    #[error("ingest request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Ingest answered with a non-2xx status.
    #[error("ingest rejected batch with status {status}: {body}")]
    Status {
        /// The HTTP status code.
        status: StatusCode,
        /// The response body, if readable.
        body: String,
    },
    /// The batch could not be serialized.
    #[error("failed to serialize batch: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The transport has been closed.
    #[error("transport is closed")]
    Closed,
    /// The circuit breaker is open; no network call was made.
    #[error("circuit breaker is open")]
    CircuitOpen,
}
