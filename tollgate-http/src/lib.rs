#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! HTTP side of the tollgate request-gateway pipeline.
//!
//! Provides the remote facilitator client, the tower interceptors that sit in
//! front of a service, and the batching transport that ships captured log
//! entries to the ingest API.
//!
//! # Modules
//!
//! - [`constants`] - Header names, default URLs and default limits
//! - [`error`] - Delivery error types
//! - [`facilitator`] - HTTP client for a remote x402 facilitator
//! - [`server`] - Payment and capture tower layers (feature: `server`)
//! - [`transport`] - Batched, circuit-broken log delivery (feature: `transport`)

pub mod constants;
pub mod error;
pub mod facilitator;

#[cfg(feature = "server")]
pub mod server;

#[cfg(feature = "transport")]
pub mod transport;

pub use facilitator::{FacilitatorClientError, HttpFacilitatorClient};

#[cfg(feature = "server")]
pub use server::{CaptureConfig, CaptureLayer, PaymentGate, PathSet};

#[cfg(feature = "transport")]
pub use transport::{BatchTransport, TransportConfig, TransportStats};
