//! The forwarding handler.
//!
//! # Data Flow
//! ```text
//! request + RequestContext
//!     → authorize (401 on failure)
//!     → render target (status short-circuit, 503 on bad target)
//!     → insert Host if the client sent only an authority
//!     → extended CONNECT?  yes → websocket tunnel (200 + splice)
//!                          no  → roundtrip (forward.rs)
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::HOST;
use axum::http::request::Parts;
use axum::http::{HeaderValue, Request, Response, StatusCode};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tracing::Instrument;
use url::Url;

use super::error::{status_response, unauthorized_response, ProxyError};
use super::headers::apply_header_lines;
use super::target::{parse_target, Target};
use super::tunnel::{open_websocket_tunnel, splice, WEBSOCKET};
use crate::auth::{authorize, AuthError, AuthTableLoader, AuthUserChecker, LoadingAuthUserChecker};
use crate::config::ProxySettings;
use crate::context::RequestContext;
use crate::http::request::{extended_connect_protocol, request_host};
use crate::lifecycle::Shutdown;
use crate::net::{BufferPool, Transport};
use crate::template::{RouteTemplates, RouteView, TemplateError, TemplateKind};

/// Failures that keep the handler from accepting traffic.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("load auth table {table:?}: {source}")]
    Auth {
        table: String,
        #[source]
        source: AuthError,
    },
}

/// Which path a request took, for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Mode {
    Rejected,
    Status,
    Tunnel,
    RoundTrip,
    SwitchProtocols,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Mode::Rejected => "rejected",
            Mode::Status => "status",
            Mode::Tunnel => "tunnel",
            Mode::RoundTrip => "roundtrip",
            Mode::SwitchProtocols => "switch_protocols",
        }
    }
}

/// Immutable per-route forwarding state shared by all requests.
pub struct ProxyHandler {
    pub(super) transport: Arc<dyn Transport>,
    pub(super) templates: RouteTemplates,
    pub(super) checker: Option<Arc<dyn AuthUserChecker>>,
    pub(super) realm: String,
    pub(super) dump_failure: bool,
    pub(super) buffers: BufferPool,
}

impl ProxyHandler {
    pub fn new(transport: Arc<dyn Transport>, templates: RouteTemplates) -> Self {
        Self {
            transport,
            templates,
            checker: None,
            realm: "proxy".to_string(),
            dump_failure: false,
            buffers: BufferPool::new(),
        }
    }

    pub fn with_checker(mut self, checker: Arc<dyn AuthUserChecker>, realm: impl Into<String>) -> Self {
        self.checker = Some(checker);
        self.realm = realm.into();
        self
    }

    pub fn with_dump_failure(mut self, dump_failure: bool) -> Self {
        self.dump_failure = dump_failure;
        self
    }

    /// Compile templates and load the auth table from settings.
    ///
    /// The auth table reloader runs until `shutdown` fires.
    pub async fn load(
        settings: &ProxySettings,
        transport: Arc<dyn Transport>,
        shutdown: &Shutdown,
    ) -> Result<Self, LoadError> {
        let templates = RouteTemplates::compile(&settings.pass, &settings.set_headers)?;
        let mut handler =
            ProxyHandler::new(transport, templates).with_dump_failure(settings.dump_failure);

        if !settings.auth_table.is_empty() {
            let loader = AuthTableLoader::from_setting(&settings.auth_table);
            let checker = LoadingAuthUserChecker::load(loader)
                .await
                .map_err(|source| LoadError::Auth {
                    table: settings.auth_table.clone(),
                    source,
                })?;
            tracing::info!(
                proxy_pass = %settings.pass,
                auth_table = %settings.auth_table,
                auth_table_size = checker.len(),
                "Auth table loaded"
            );

            let checker = Arc::new(checker);
            if settings.auth_reload_secs > 0 {
                Arc::clone(&checker).spawn_reload(
                    Duration::from_secs(settings.auth_reload_secs),
                    shutdown.subscribe(),
                );
            }
            handler = handler.with_checker(checker, settings.auth_realm.clone());
        }

        Ok(handler)
    }

    /// Handle one request. Every failure becomes an HTTP response.
    pub async fn serve(&self, req: Request<Body>, ctx: &mut RequestContext) -> Response<Body> {
        let span = ctx.span.clone();
        let (mode, response) = self.dispatch(req, ctx).instrument(span).await;

        metrics::counter!(
            "proxy_requests_total",
            "mode" => mode.as_str(),
            "status" => response.status().as_str().to_string()
        )
        .increment(1);
        response
    }

    async fn dispatch(&self, req: Request<Body>, ctx: &mut RequestContext) -> (Mode, Response<Body>) {
        if let Err(e) = authorize(self.checker.as_deref(), &mut ctx.auth_user) {
            tracing::error!(
                error = %e,
                username = %ctx.auth_user.username,
                user_attrs = ?ctx.auth_user.attrs,
                "Proxy authorization failed"
            );
            return (Mode::Rejected, unauthorized_response(&self.realm, &e));
        }

        let (mut parts, body) = req.into_parts();

        let target = match self.resolve_target(&parts, ctx) {
            Ok(Some(Target::Status(status))) => return (Mode::Status, status_response(status)),
            Ok(Some(Target::Backend(url))) => Some(url),
            Ok(None) => None,
            Err(e) => return (Mode::Status, failure(e)),
        };

        if !parts.headers.contains_key(HOST) {
            if let Some(value) = request_host(&parts).and_then(|h| HeaderValue::from_str(&h).ok()) {
                parts.headers.insert(HOST, value);
            }
        }

        if let Some(protocol) = extended_connect_protocol(&parts).map(str::to_string) {
            let response = self
                .tunnel(parts, &protocol, target.as_ref(), ctx)
                .await
                .unwrap_or_else(failure);
            return (Mode::Tunnel, response);
        }

        self.forward(parts, body, target, ctx).await
    }

    /// Render the target template. `None` when no target is configured.
    fn resolve_target(
        &self,
        parts: &Parts,
        ctx: &RequestContext,
    ) -> Result<Option<Target>, ProxyError> {
        if !self.templates.has(TemplateKind::Pass) {
            return Ok(None);
        }

        let mut buf = self.buffers.get();
        if let Err(e) = self
            .templates
            .render(TemplateKind::Pass, &RouteView::new(parts, ctx), &mut *buf)
        {
            tracing::error!(error = %e, "Target template render failed");
            buf.clear();
        }

        let target = parse_target(&buf.to_string_lossy())?;
        tracing::debug!(proxypass = ?target, "Target resolved");
        Ok(Some(target))
    }

    /// Render the header template onto the outgoing request.
    pub(super) fn set_headers(&self, parts: &mut Parts, ctx: &RequestContext) {
        if !self.templates.has(TemplateKind::SetHeaders) {
            return;
        }

        let mut buf = self.buffers.get();
        match self
            .templates
            .render(TemplateKind::SetHeaders, &RouteView::new(parts, ctx), &mut *buf)
        {
            Ok(()) => apply_header_lines(&buf.to_string_lossy(), parts),
            Err(e) => tracing::error!(error = %e, "Header template render failed"),
        }
    }

    /// Extended CONNECT: hand-built websocket handshake, then splice.
    async fn tunnel(
        &self,
        mut parts: Parts,
        protocol: &str,
        target: Option<&Url>,
        ctx: &RequestContext,
    ) -> Result<Response<Body>, ProxyError> {
        if protocol != WEBSOCKET {
            return Err(ProxyError::UnsupportedProtocol(protocol.to_string()));
        }
        let target = target.ok_or(ProxyError::NoRoute)?;

        self.set_headers(&mut parts, ctx);
        let host = request_host(&parts).unwrap_or_default();

        let (head, backend) = open_websocket_tunnel(
            self.transport.as_ref(),
            &self.buffers,
            &parts,
            protocol,
            target,
            &host,
        )
        .await?;

        let client = parts
            .extensions
            .remove::<OnUpgrade>()
            .ok_or(ProxyError::HijackUnavailable)?;

        tokio::spawn(
            async move {
                match client.await {
                    Ok(upgraded) => splice(TokioIo::new(upgraded), backend).await.log(WEBSOCKET),
                    Err(e) => tracing::warn!(error = %e, "Client tunnel upgrade failed"),
                }
            }
            .instrument(ctx.span.clone()),
        );
        metrics::counter!("proxy_tunnels_total", "kind" => "extended_connect").increment(1);

        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::OK;
        for (name, value) in head.headers.iter() {
            response.headers_mut().append(name, value.clone());
        }
        Ok(response)
    }
}

/// Log a forwarding failure at the level its class deserves, then render it.
pub(super) fn failure(err: ProxyError) -> Response<Body> {
    match &err {
        ProxyError::NoRoute => tracing::debug!("No target configured"),
        ProxyError::UpstreamTimeout(e) | ProxyError::Upstream(e) => {
            tracing::warn!(error = %e, status = err.status().as_u16(), "Proxy pass failed")
        }
        _ => tracing::error!(error = %err, status = err.status().as_u16(), "Proxy pass failed"),
    }
    axum::response::IntoResponse::into_response(err)
}
