//! Tollgate gateway server.
//!
//! A reverse proxy that sits in front of a tool service, charges x402
//! payments for chargeable JSON-RPC calls and ships a log entry for every
//! request to the ingest API.
//!
//! # Modules
//!
//! - [`app`] - Router assembly from configuration
//! - [`config`] - TOML configuration with environment variable expansion
//! - [`error`] - Startup and upstream error types
//! - [`proxy`] - Forwarding to the upstream service
//! - [`util`] - Shutdown signal handling

pub mod app;
pub mod config;
pub mod error;
pub mod proxy;
pub mod util;

pub use app::Gateway;
pub use config::GatewayConfig;
