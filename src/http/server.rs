//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum Router with a catch-all forwarding handler
//! - Wire up request tracing
//! - Build the `RequestContext` for each request
//! - Serve HTTP/1.1 and HTTP/2 with graceful shutdown
//!
//! # Design Decisions
//! - No server-side request deadline: the transport owns the upstream
//!   deadline and reports its expiry as `504`

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header::USER_AGENT, Request},
    response::Response,
    Router,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::context::{AuthUserInfo, RequestContext, UserAgent};
use crate::http::request::basic_credentials;
use crate::lifecycle::Shutdown;
use crate::proxy::ProxyHandler;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<ProxyHandler>,
    pub server_addr: SocketAddr,
}

/// HTTP front end for a `ProxyHandler`.
pub struct HttpServer {
    handler: Arc<ProxyHandler>,
}

impl HttpServer {
    pub fn new(handler: Arc<ProxyHandler>) -> Self {
        Self { handler }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(&self, server_addr: SocketAddr) -> Router {
        let state = AppState {
            handler: Arc::clone(&self.handler),
            server_addr,
        };
        Router::new()
            .fallback(proxy_handler)
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Serve connections from `listener` until `shutdown` fires.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self
            .build_router(addr)
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Build the request context and hand the request to the forwarding engine.
async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!(
        "proxy",
        request_id = %request_id,
        method = %request.method(),
        uri = %request.uri(),
        remote_addr = %remote_addr,
    );

    let mut ctx = RequestContext::new(remote_addr, state.server_addr);
    ctx.span = span;
    if let Some(agent) = request.headers().get(USER_AGENT).and_then(|v| v.to_str().ok()) {
        ctx.user_agent = UserAgent::from_raw(agent);
    }
    if let Some((username, password)) = basic_credentials(request.headers()) {
        ctx.auth_user = AuthUserInfo::new(username, password);
    }

    state.handler.serve(request, &mut ctx).await
}
