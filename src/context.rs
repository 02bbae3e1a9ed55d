//! Per-request metadata handed to the forwarding core.
//!
//! # Responsibilities
//! - Carry connection facts computed by the serving layer (addresses, TLS, JA4)
//! - Carry the pre-parsed user agent
//! - Carry the mutable authenticated-user record the auth gate fills in
//!
//! # Design Decisions
//! - Built once per request and passed explicitly into `ProxyHandler::serve`
//! - `tls_version` is zero for plaintext connections

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::Serialize;

/// Credentials and attributes of the user attempting to proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthUserInfo {
    pub username: String,
    pub password: String,
    /// Attributes copied from the auth table on a successful check.
    pub attrs: HashMap<String, String>,
}

impl AuthUserInfo {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            attrs: HashMap::new(),
        }
    }

    /// Returns true if the user carries `allow_proxy = "1"`.
    pub fn allows_proxy(&self) -> bool {
        self.attrs.get("allow_proxy").map(String::as_str) == Some("1")
    }
}

/// Parsed user agent, exposed to routing templates.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UserAgent {
    pub raw: String,
    pub name: String,
    pub version: String,
    pub os: String,
    pub device: String,
    pub mobile: bool,
    pub bot: bool,
}

impl UserAgent {
    /// A record carrying only the raw header value.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            ..Self::default()
        }
    }
}

/// Connection and identity facts for one inbound request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub remote_addr: SocketAddr,
    pub server_addr: SocketAddr,
    /// Negotiated TLS version (e.g. `0x0304`), zero for plaintext.
    pub tls_version: u16,
    pub ja4: String,
    pub user_agent: UserAgent,
    pub auth_user: AuthUserInfo,
    /// Span all records for this request are emitted under.
    pub span: tracing::Span,
}

impl RequestContext {
    /// Plaintext context with no fingerprint, user agent or credentials.
    pub fn new(remote_addr: SocketAddr, server_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            server_addr,
            tls_version: 0,
            ja4: String::new(),
            user_agent: UserAgent::default(),
            auth_user: AuthUserInfo::default(),
            span: tracing::Span::none(),
        }
    }

    pub fn is_tls(&self) -> bool {
        self.tls_version != 0
    }
}
