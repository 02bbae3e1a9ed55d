//! Request forwarding engine.
//!
//! # Data Flow
//! ```text
//! ProxyHandler::serve(request, &mut RequestContext)
//!     → auth gate                      (401)
//!     → target.rs   render + parse     (status short-circuit, 503)
//!     → extended CONNECT websocket?
//!         → tunnel.rs  dial, handshake, 200, splice
//!     → forward.rs  forwarded headers, header template, roundtrip
//!         → 101        relay + splice
//!         → otherwise  connection-header strip, location rewrite, dump.rs
//! ```
//!
//! # Design Decisions
//! - `ProxyHandler` is immutable after load and shared across requests
//! - Failures never escape `serve`; each becomes a response via `ProxyError`
//! - Tunnel sessions outlive the request future and run on their own task

pub mod dump;
pub mod error;
mod forward;
pub mod handler;
pub mod headers;
pub mod target;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testing;

pub use error::ProxyError;
pub use handler::{LoadError, ProxyHandler};
pub use target::Target;
pub use tunnel::{splice, Outcome, SpliceReport};
