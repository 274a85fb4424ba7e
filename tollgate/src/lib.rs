#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Core types for payment-gated, observable request gateways.
//!
//! This crate holds everything the gateway pipeline needs that does not touch
//! the network: the x402 wire types exchanged with a payment facilitator, the
//! analytics log model shipped to the ingest API, and the best-effort decoding
//! used to classify request bodies.
//!
//! The HTTP interceptors and the batching transport live in `tollgate-http`.
//!
//! # Modules
//!
//! - [`amount`] - Integer token amounts in the smallest currency unit
//! - [`envelope`] - Tagged decoding of JSON-RPC and agent request bodies
//! - [`extract`] - Tool-name, protocol and payment-field extraction
//! - [`facilitator`] - Trait for verifying and settling payment proofs
//! - [`log`] - Captured request records and delivery batches
//! - [`proto`] - x402 payment requirements and facilitator messages

pub mod amount;
pub mod envelope;
pub mod extract;
pub mod facilitator;
pub mod log;
pub mod proto;

pub use envelope::Envelope;
pub use extract::{DefaultExtractor, Extractor, PaymentFields, ProtocolTag};
pub use facilitator::{BoxFuture, Facilitator, FacilitatorError};
pub use log::{LogBatch, LogEntry, LogSink};
pub use proto::{PaymentProof, PaymentRequired, PaymentRequirements, PriceTag};
