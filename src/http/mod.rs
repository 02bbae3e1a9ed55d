//! HTTP serving layer.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, HTTP/1.1 + HTTP/2, RequestContext)
//!     → request.rs (host, Basic credentials, extended CONNECT detection)
//!     → proxy::ProxyHandler::serve
//!     → Send to client
//! ```

pub mod request;
pub mod server;

pub use server::HttpServer;
