//! Outgoing header rewriting.
//!
//! # Responsibilities
//! - Forwarding headers (`x-forwarded-for`, `x-real-ip`, `x-forwarded-proto`, `x-ja4`)
//! - `key: value` lines from the header template
//! - Response fixups (legacy connection headers, self-referential redirects)

use std::net::IpAddr;
use std::str::FromStr;

use axum::http::header::{CONNECTION, HOST, LOCATION};
use axum::http::request::Parts;
use axum::http::uri::Authority;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Uri};

use crate::context::RequestContext;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_JA4: HeaderName = HeaderName::from_static("x-ja4");
const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");

/// Loopback, RFC 1918 and IPv6 unique-local addresses.
fn is_loopback_or_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// Add the caller to the forwarding headers.
///
/// IPv4-mapped IPv6 callers are recorded and classified as IPv4.
pub fn set_forwarded_headers(headers: &mut HeaderMap, ctx: &RequestContext) {
    let ip = ctx.remote_addr.ip().to_canonical();
    let ip_text = ip.to_string();

    let forwarded_for = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{}, {}", existing, ip_text),
        _ => ip_text.clone(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if !is_loopback_or_private(ip) {
        if let Ok(value) = HeaderValue::from_str(&ip_text) {
            headers.insert(X_REAL_IP, value);
        }
    }

    if ctx.is_tls() {
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));
        if let Ok(value) = HeaderValue::from_str(&ctx.ja4) {
            headers.insert(X_JA4, value);
        }
    }
}

/// Apply rendered `key: value` lines to the outgoing request.
///
/// Lines without a `:` are skipped. A `host` key rewrites both the URI
/// authority and the Host header; other keys replace any existing values.
pub fn apply_header_lines(text: &str, parts: &mut Parts) {
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() {
            continue;
        }

        if key.eq_ignore_ascii_case("host") {
            set_host(parts, value);
            continue;
        }

        match (HeaderName::from_str(key), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                parts.headers.insert(name, value);
            }
            _ => tracing::debug!(line = %line, "Skipping invalid header line"),
        }
    }
}

fn set_host(parts: &mut Parts, host: &str) {
    let (Ok(authority), Ok(value)) = (Authority::from_str(host), HeaderValue::from_str(host)) else {
        tracing::debug!(host = %host, "Skipping invalid host rewrite");
        return;
    };

    let mut uri_parts = parts.uri.clone().into_parts();
    if uri_parts.scheme.is_some() {
        uri_parts.authority = Some(authority);
        if let Ok(uri) = Uri::from_parts(uri_parts) {
            parts.uri = uri;
        }
    }
    parts.headers.insert(HOST, value);
}

/// Drop headers that mean nothing on multiplexed connections.
pub fn strip_legacy_connection_headers(headers: &mut HeaderMap) {
    headers.remove(CONNECTION);
    headers.remove(KEEP_ALIVE);
}

/// Turn `http://<host>/path` redirects into `/path` for TLS clients.
pub fn rewrite_location(headers: &mut HeaderMap, host: &str, tls: bool) {
    if !tls || host.is_empty() {
        return;
    }
    let Some(location) = headers.get(LOCATION).and_then(|v| v.to_str().ok()) else {
        return;
    };

    let prefix = format!("http://{}/", host);
    if let Some(path) = location.strip_prefix(&prefix) {
        if let Ok(value) = HeaderValue::from_str(&format!("/{}", path)) {
            headers.insert(LOCATION, value);
        }
    }
}
