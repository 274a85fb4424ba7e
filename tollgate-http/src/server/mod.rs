//! Tower interceptors for the gateway pipeline.
//!
//! - [`PaymentGate`] enforces x402 payment on chargeable tool calls,
//!   verifying with a facilitator before the call and settling after it.
//! - [`CaptureLayer`] records one [`LogEntry`](tollgate::LogEntry) per
//!   request/response cycle and hands it to a [`LogSink`](tollgate::LogSink).
//!
//! Put the capture layer outside the payment layer so rejected calls are
//! recorded too:
//!
//! ```ignore
//! let app = Router::new()
//!     .route("/mcp", post(handler))
//!     .layer(PaymentGate::new(facilitator, price_tag))
//!     .layer(CaptureLayer::new(transport.clone()));
//! ```

mod body;
pub mod capture;
pub mod error;
pub mod layer;
pub mod paths;
pub mod paygate;

#[cfg(test)]
mod test_support;

pub use capture::{CaptureConfig, CaptureLayer, CaptureService};
pub use error::{PaygateError, VerificationError};
pub use layer::{PaymentGate, PaymentGateService};
pub use paths::PathSet;
pub use paygate::{ChargeSelector, GateDecision, GateSettings, Paygate};
