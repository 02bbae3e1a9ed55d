//! Target resolution.
//!
//! The rendered `pass` template is either a status code (100-999) that ends
//! the request, or a backend URL.

use std::str::FromStr;

use axum::http::request::Parts;
use axum::http::uri::{Authority, PathAndQuery, Scheme};
use axum::http::{StatusCode, Uri};
use url::{Host, Url};

use super::error::ProxyError;

/// Where a request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Answer locally with this status.
    Status(StatusCode),
    /// Forward to this backend.
    Backend(Url),
}

/// Interpret rendered target text.
pub fn parse_target(text: &str) -> Result<Target, ProxyError> {
    let text = text.trim();

    if let Ok(code) = text.parse::<u16>() {
        if (100..=999).contains(&code) {
            if let Ok(status) = StatusCode::from_u16(code) {
                return Ok(Target::Status(status));
            }
        }
    }

    let url = Url::parse(text).map_err(|_| ProxyError::BadTarget(text.to_string()))?;
    if url.scheme() == "file" {
        return Err(ProxyError::FileTarget);
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ProxyError::BadTarget(text.to_string()));
    }
    Ok(Target::Backend(url))
}

/// `host[:port]` as written in the target (IPv6 bracketed).
pub fn target_authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

/// `host:port` to dial, defaulting the port by scheme.
pub fn dial_address(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    let port = url
        .port_or_known_default()
        .unwrap_or(if is_secure(url) { 443 } else { 80 });
    format!("{}:{}", host, port)
}

/// Host name to present for TLS server name indication.
pub fn server_name(url: &Url) -> String {
    match url.host() {
        Some(Host::Domain(domain)) => domain.to_string(),
        Some(Host::Ipv4(addr)) => addr.to_string(),
        Some(Host::Ipv6(addr)) => addr.to_string(),
        None => String::new(),
    }
}

pub fn is_secure(url: &Url) -> bool {
    matches!(url.scheme(), "https" | "wss")
}

/// Point the outgoing request's URI at `url`, keeping path and query.
pub fn set_target(parts: &mut Parts, url: &Url) -> Result<(), ProxyError> {
    let bad_target = || ProxyError::BadTarget(url.to_string());

    let scheme = match url.scheme() {
        "https" | "wss" => Scheme::HTTPS,
        "http" | "ws" => Scheme::HTTP,
        other => Scheme::from_str(other).map_err(|_| bad_target())?,
    };
    let authority = Authority::from_str(&target_authority(url)).map_err(|_| bad_target())?;

    let mut uri_parts = parts.uri.clone().into_parts();
    uri_parts.scheme = Some(scheme);
    uri_parts.authority = Some(authority);
    if uri_parts.path_and_query.is_none() {
        uri_parts.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    parts.uri = Uri::from_parts(uri_parts).map_err(|_| bad_target())?;
    Ok(())
}
