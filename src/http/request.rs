//! Request inspection helpers.
//!
//! # Responsibilities
//! - Determine the inbound host (Host header or HTTP/2 authority)
//! - Extract Basic proxy credentials
//! - Detect the HTTP/2 extended CONNECT form

use axum::http::header::{AUTHORIZATION, HOST, PROXY_AUTHORIZATION};
use axum::http::request::Parts;
use axum::http::{HeaderMap, Method, Version};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Host the client addressed: the Host header, else the URI authority.
pub fn request_host(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.as_str().to_string()))
}

/// Decode `Basic` credentials from `Proxy-Authorization`, then `Authorization`.
pub fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    [PROXY_AUTHORIZATION, AUTHORIZATION]
        .iter()
        .filter_map(|name| headers.get(name))
        .filter_map(|value| value.to_str().ok())
        .find_map(decode_basic)
}

fn decode_basic(value: &str) -> Option<(String, String)> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// The `:protocol` of an HTTP/2 extended CONNECT, if this is one.
pub fn extended_connect_protocol(parts: &Parts) -> Option<&str> {
    if parts.version != Version::HTTP_2 || parts.method != Method::CONNECT {
        return None;
    }
    if !parts.uri.path().starts_with('/') {
        return None;
    }
    parts
        .extensions
        .get::<hyper::ext::Protocol>()
        .map(hyper::ext::Protocol::as_str)
}
