//! Forwarding failures and the responses they become.

use std::io;

use axum::body::Body;
use axum::http::header::{CONTENT_TYPE, WWW_AUTHENTICATE, X_CONTENT_TYPE_OPTIONS};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::auth::AuthError;
use crate::net::TransportError;

/// Everything that ends a request before a backend response is relayed.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("bad proxypass {0:?}")]
    BadTarget(String),

    #[error("use a static file handler instead of file://")]
    FileTarget,

    #[error("pseudo protocol {0} is not supported")]
    UnsupportedProtocol(String),

    #[error("dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("tls handshake with {addr}: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("write upgrade request to {addr}: {source}")]
    UpgradeWrite {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("read upgrade response from {addr}: {source}")]
    UpgradeRead {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("switch protocols failed, resp statuscode: {0}")]
    UpgradeRejected(u16),

    #[error("internal error: 101 switching protocols response with non-writable body")]
    NotUpgradable,

    #[error("client connection cannot be taken over")]
    HijackUnavailable,

    #[error("504 Gateway Timeout")]
    UpstreamTimeout(#[source] TransportError),

    #[error("502 Bad Gateway")]
    Upstream(#[source] TransportError),

    #[error("404 page not found")]
    NoRoute,
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadTarget(_) | ProxyError::FileTarget => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::NotUpgradable => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::NoRoute => StatusCode::NOT_FOUND,
            ProxyError::UnsupportedProtocol(_)
            | ProxyError::Dial { .. }
            | ProxyError::Handshake { .. }
            | ProxyError::UpgradeWrite { .. }
            | ProxyError::UpgradeRead { .. }
            | ProxyError::UpgradeRejected(_)
            | ProxyError::HijackUnavailable
            | ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        error_response(self.status(), &self.to_string())
    }
}

/// Plain-text error page.
pub fn error_response(status: StatusCode, message: &str) -> Response {
    let mut response = Response::new(Body::from(format!("{}\n", message)));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    response
}

/// The short-circuit response for a target that rendered to a status code.
///
/// An informational code cannot be a final response, so a 1xx target
/// answers `500` instead.
pub fn status_response(status: StatusCode) -> Response {
    if status.is_informational() {
        tracing::error!(status = status.as_u16(), "Informational status cannot end a request");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("500 Internal Server Error: status {} cannot end a request", status.as_u16()),
        );
    }
    let reason = status.canonical_reason().unwrap_or_default();
    error_response(status, format!("{} {}", status.as_u16(), reason).trim_end())
}

/// `401` with a Basic challenge for `realm`.
pub fn unauthorized_response(realm: &str, err: &AuthError) -> Response {
    let mut response = error_response(
        StatusCode::UNAUTHORIZED,
        &format!("401 Unauthorized: {}", err),
    );
    if let Ok(challenge) = HeaderValue::from_str(&format!("Basic realm=\"{}\"", realm)) {
        response.headers_mut().insert(WWW_AUTHENTICATE, challenge);
    }
    response
}
