//! webproxy
//!
//! A templated forwarding proxy built with Tokio, Axum and hyper.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────────────▶ http::server ──▶ proxy::ProxyHandler
//!                     (context,        │  auth gate
//!                      credentials)    │  target template → status | backend URL
//!                                      │  header template
//!                                      ▼
//!                              ┌────────────────────┐
//!                              │ extended CONNECT?  │── yes ──▶ dial + websocket handshake
//!                              └────────┬───────────┘            → 200, splice
//!                                       │ no
//!                                       ▼
//!                              net::transport roundtrip ──▶ Backend
//!                                       │
//!                          101 → splice │ other → location rewrite, dump
//!     Client Response ◀─────────────────┘
//! ```

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use webproxy::config::load_config;
use webproxy::lifecycle::{wait_for_signal, Shutdown};
use webproxy::net::HyperTransport;
use webproxy::observability::{init_logging, init_metrics};
use webproxy::{HttpServer, ProxyHandler};

#[derive(Parser)]
#[command(name = "webproxy")]
#[command(about = "Templated HTTP forwarding proxy", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "webproxy.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let config = load_config(&cli.config)?;
    init_logging(&config.observability)?;

    tracing::info!(
        config = %cli.config.display(),
        bind_address = %config.listener.bind_address,
        proxy_pass = %config.proxy.pass,
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        init_metrics(config.observability.metrics_address.parse()?)?;
    }

    let shutdown = Shutdown::new();
    let transport = Arc::new(HyperTransport::new(&config.timeouts)?);
    let handler = ProxyHandler::load(&config.proxy, transport, &shutdown).await?;

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tokio::spawn(wait_for_signal(shutdown.clone()));

    HttpServer::new(Arc::new(handler))
        .run(listener, shutdown)
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
