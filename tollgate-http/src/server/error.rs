//! Error types for the payment gate.
//!
//! A refused payment becomes a `402 Payment Required` response carrying the
//! payment requirements. Body handling errors become plain JSON errors.

use http::StatusCode;
use tollgate::proto::PaymentRequirements;

/// Reasons a chargeable request was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    /// Required payment header is missing.
    #[error("{0} header is required")]
    PaymentHeaderRequired(&'static str),
    /// Payment header is present but malformed.
    #[error("Invalid or malformed payment header")]
    InvalidPaymentHeader,
    /// The facilitator rejected the proof, failed, or timed out.
    #[error("{0}")]
    VerificationFailed(String),
}

/// Paygate error type covering payment refusal and body handling.
#[derive(Debug, thiserror::Error)]
pub enum PaygateError {
    /// Payment is required and was not accepted.
    #[error("{reason}")]
    PaymentRequired {
        /// Why the payment was refused.
        reason: VerificationError,
        /// Terms the caller can retry with.
        requirements: Box<PaymentRequirements>,
    },
    /// The gated request body exceeded its ceiling.
    #[error("Request body exceeds {limit} bytes")]
    RequestTooLarge {
        /// Configured ceiling in bytes.
        limit: usize,
    },
    /// The gated request body could not be read.
    #[error("Failed to read request body: {0}")]
    RequestBody(String),
    /// The downstream response exceeded the buffering ceiling.
    #[error("Response body exceeds {limit} bytes")]
    ResponseTooLarge {
        /// Configured ceiling in bytes.
        limit: usize,
    },
    /// The downstream response body could not be read.
    #[error("Failed to read response body: {0}")]
    ResponseBody(String),
}

impl PaygateError {
    /// HTTP status this error is reported with.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::PaymentRequired { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::RequestTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RequestBody(_) => StatusCode::BAD_REQUEST,
            Self::ResponseTooLarge { .. } | Self::ResponseBody(_) => StatusCode::BAD_GATEWAY,
        }
    }
}
