//! Templated HTTP forwarding proxy library

pub mod auth;
pub mod config;
pub mod context;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod proxy;
pub mod template;

pub use config::schema::ProxyConfig;
pub use context::RequestContext;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use proxy::ProxyHandler;
