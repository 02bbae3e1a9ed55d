//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events with structured fields (request span carries request_id)
//!     → metrics counters (proxy_requests_total, proxy_tunnels_total)
//!
//! Consumers:
//!     → logging.rs  stdout, pretty or JSON
//!     → metrics.rs  Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - `RUST_LOG` overrides the configured level
//! - Metric updates are no-ops until an exporter is installed

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::init_metrics;
