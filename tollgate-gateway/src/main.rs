//! Tollgate gateway binary.
//!
//! # Usage
//!
//! ```bash
//! # Run with the default config (tollgate.toml in the current directory)
//! cargo run -p tollgate-gateway --release
//!
//! # Run with a custom config path
//! tollgate-gateway --config /etc/tollgate/gateway.toml
//!
//! # Configure logging level
//! RUST_LOG=debug tollgate-gateway
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG` - Path to TOML configuration file (default: `tollgate.toml`)
//! - `HOST` - Override bind address (default: `0.0.0.0`)
//! - `PORT` - Override port (default: `8080`)
//! - `RUST_LOG` - Log level filter (default: `info`)
//!
//! A `.env` file in the working directory is loaded first when present.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tollgate_gateway::error::GatewayError;
use tollgate_gateway::util::SigDown;
use tollgate_gateway::{Gateway, GatewayConfig, app};

#[derive(Parser)]
#[command(name = "tollgate-gateway", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "CONFIG", default_value = "tollgate.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(&cli.config).await {
        tracing::error!("Gateway failed: {e}");
        std::process::exit(1);
    }
}

async fn run(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = GatewayConfig::load(config_path)?;
    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        upstream = %config.server.upstream,
        payment = config.payment.enabled,
        capture = config.capture.enabled,
        "Loaded configuration"
    );

    let sig_down = SigDown::try_new()?;
    let Gateway { router, transport } = Gateway::build(&config)?;

    if let Some(transport) = &transport {
        transport.start_auto_flush();
        transport.verify_connection().await;
    }

    let addr = SocketAddr::new(config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| GatewayError::Bind { addr, source })?;
    tracing::info!("Gateway listening on http://{addr}");

    let shutdown = sig_down.cancellation_token();
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.cancelled_owned())
    .await?;

    if let Some(transport) = &transport {
        app::drain(transport).await;
    }

    sig_down.recv().await;
    tracing::info!("Gateway shut down gracefully");
    Ok(())
}
