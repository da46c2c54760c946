use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use burrow_core::{Maintainer, ProjectInfo};
use burrow_server::{HttpFetcher, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "burrow", version, about = "WebSocket HTTP-tunneling server")]
struct Args {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on. 0 picks a free port.
    #[arg(long, default_value_t = 9690)]
    port: u16,

    /// Path prefix the protocol surface lives under.
    #[arg(long, default_value = "/")]
    prefix: String,

    /// Milliseconds a declared request body may take to arrive.
    #[arg(long = "request-timeout", default_value_t = 30_000)]
    request_timeout_ms: u64,

    /// Maximum request/response body size in bytes.
    #[arg(long, default_value_t = 68_718_297_088)]
    max_body_size: u64,

    /// Maximum binary frame size in bytes, header included.
    #[arg(long, default_value_t = 1_048_576)]
    max_packet_size: usize,

    /// Maintainer contact email, advertised on the metadata endpoint.
    #[arg(long, requires = "maintainer_website")]
    maintainer_email: Option<String>,

    /// Maintainer website, advertised on the metadata endpoint.
    #[arg(long, requires = "maintainer_email")]
    maintainer_website: Option<String>,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let maintainer = args
        .maintainer_email
        .zip(args.maintainer_website)
        .map(|(email, website)| Maintainer { email, website });

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        prefix: args.prefix,
        request_timeout: Duration::from_millis(args.request_timeout_ms),
        max_body_size: args.max_body_size,
        max_packet_size: args.max_packet_size,
        maintainer,
        // env! resolves per crate, so build the binary's identity here
        // rather than inheriting the library's.
        project: ProjectInfo {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: Some(env!("CARGO_PKG_DESCRIPTION").to_string()).filter(|d| !d.is_empty()),
            repository: Some(env!("CARGO_PKG_REPOSITORY").to_string()).filter(|r| !r.is_empty()),
        },
        ..ServerConfig::default()
    };

    let handle = burrow_server::start(config, Arc::new(HttpFetcher::new()))
        .await
        .expect("Failed to start server");

    tracing::info!(port = handle.port, "Burrow server ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for ctrl+c");

    tracing::info!("Shutting down");
}
