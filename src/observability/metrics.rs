//! Metrics exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): requests by forwarding mode and status
//! - `proxy_tunnels_total` (counter): spliced sessions by kind
//!
//! # Design Decisions
//! - Counters are recorded with the `metrics` macros where the event happens
//! - The Prometheus exporter is installed only when enabled in config

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and serve `/metrics` on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    metrics::describe_counter!(
        "proxy_requests_total",
        "Requests handled, by forwarding mode and response status"
    );
    metrics::describe_counter!("proxy_tunnels_total", "Spliced tunnel sessions, by kind");
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}
