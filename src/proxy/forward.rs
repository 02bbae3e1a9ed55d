//! Roundtrip forwarding and response shaping.

use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, HOST, UPGRADE};
use axum::http::request::Parts;
use axum::http::{response, HeaderValue, Method, Request, Response, StatusCode, Version};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tracing::Instrument;
use url::Url;

use super::dump::DumpBody;
use super::error::ProxyError;
use super::handler::{failure, Mode, ProxyHandler};
use super::headers::{rewrite_location, set_forwarded_headers, strip_legacy_connection_headers};
use super::target::set_target;
use super::tunnel::splice;
use crate::context::RequestContext;
use crate::http::request::request_host;

impl ProxyHandler {
    /// Send the request through the transport and shape the backend's answer.
    pub(super) async fn forward(
        &self,
        mut parts: Parts,
        body: Body,
        target: Option<Url>,
        ctx: &RequestContext,
    ) -> (Mode, Response<Body>) {
        let inbound_version = parts.version;

        if let Some(url) = &target {
            if let Err(e) = set_target(&mut parts, url) {
                return (Mode::RoundTrip, failure(e));
            }
        }
        set_forwarded_headers(&mut parts.headers, ctx);
        self.set_headers(&mut parts, ctx);

        let body = if inbound_version >= Version::HTTP_3 && parts.method == Method::GET {
            parts.headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
            Body::empty()
        } else {
            body
        };

        let client_upgrade = if parts.headers.contains_key(UPGRADE) {
            parts.extensions.remove::<OnUpgrade>()
        } else {
            None
        };
        let outgoing_host = parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| request_host(&parts))
            .unwrap_or_default();
        let outgoing_uri = parts.uri.to_string();

        let response = match self.transport.round_trip(Request::from_parts(parts, body)).await {
            Ok(response) => response,
            Err(_) if target.is_none() => return (Mode::RoundTrip, failure(ProxyError::NoRoute)),
            Err(e) => {
                tracing::warn!(req_host = %outgoing_host, req_url = %outgoing_uri, "Proxy pass roundtrip failed");
                let err = if e.is_timeout() {
                    ProxyError::UpstreamTimeout(e)
                } else {
                    ProxyError::Upstream(e)
                };
                return (Mode::RoundTrip, failure(err));
            }
        };

        let (mut head, body) = response.into_parts();
        tracing::info!(
            http_status = head.status.as_u16(),
            http_content_length = head
                .headers
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-"),
            "Proxy pass request"
        );

        if inbound_version >= Version::HTTP_2 {
            strip_legacy_connection_headers(&mut head.headers);
        }

        if head.status == StatusCode::SWITCHING_PROTOCOLS {
            let response = switch_protocols(head, client_upgrade, ctx).unwrap_or_else(failure);
            return (Mode::SwitchProtocols, response);
        }

        rewrite_location(&mut head.headers, &outgoing_host, ctx.is_tls());

        let body = if self.dump_failure && head.status.as_u16() >= 400 {
            Body::new(DumpBody::new(&head, body, ctx.span.clone()))
        } else {
            body
        };
        (Mode::RoundTrip, Response::from_parts(head, body))
    }
}

/// Relay a backend `101` and splice the two upgraded connections.
///
/// hyper hands out the client's raw connection only after the `101` head is
/// written, so the splice runs on its own task.
fn switch_protocols(
    mut head: response::Parts,
    client: Option<OnUpgrade>,
    ctx: &RequestContext,
) -> Result<Response<Body>, ProxyError> {
    let backend = head
        .extensions
        .remove::<OnUpgrade>()
        .ok_or(ProxyError::NotUpgradable)?;
    let client = client.ok_or(ProxyError::HijackUnavailable)?;

    tokio::spawn(
        async move {
            match tokio::try_join!(client, backend) {
                Ok((client, backend)) => {
                    splice(TokioIo::new(client), TokioIo::new(backend))
                        .await
                        .log("switch_protocols")
                }
                Err(e) => tracing::warn!(error = %e, "Protocol switch upgrade failed"),
            }
        }
        .instrument(ctx.span.clone()),
    );
    metrics::counter!("proxy_tunnels_total", "kind" => "switch_protocols").increment(1);

    Ok(Response::from_parts(head, Body::empty()))
}
