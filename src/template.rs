//! Routing templates.
//!
//! # Responsibilities
//! - Compile the target (`pass`) and header (`set_headers`) templates at load
//! - Expose a fixed view of the request to both templates
//! - Register helper functions available to operators
//!
//! # Design Decisions
//! - Compile errors are load errors; nothing is parsed per request
//! - Undefined fields render empty instead of failing
//! - Rendering writes into caller-provided (pooled) buffers

use std::collections::BTreeMap;
use std::io;

use axum::http::request::Parts;
use minijinja::Environment;
use serde::Serialize;
use thiserror::Error;

use crate::context::{RequestContext, UserAgent};
use crate::http::request::request_host;

/// Which compiled template to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Pass,
    SetHeaders,
}

impl TemplateKind {
    fn name(self) -> &'static str {
        match self {
            TemplateKind::Pass => "pass",
            TemplateKind::SetHeaders => "set_headers",
        }
    }
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("compile {name} template: {source}")]
    Compile {
        name: &'static str,
        #[source]
        source: minijinja::Error,
    },

    #[error("render {name} template: {source}")]
    Render {
        name: &'static str,
        #[source]
        source: minijinja::Error,
    },
}

/// The two compiled templates. Immutable after `compile`.
#[derive(Debug)]
pub struct RouteTemplates {
    env: Environment<'static>,
    has_pass: bool,
    has_headers: bool,
}

impl RouteTemplates {
    /// Compile both templates. An empty source leaves that template unset.
    pub fn compile(pass: &str, set_headers: &str) -> Result<Self, TemplateError> {
        let mut env = Environment::new();
        register_helpers(&mut env);

        let has_pass = !pass.trim().is_empty();
        let has_headers = !set_headers.trim().is_empty();

        for (kind, source, present) in [
            (TemplateKind::Pass, pass, has_pass),
            (TemplateKind::SetHeaders, set_headers, has_headers),
        ] {
            if present {
                env.add_template_owned(kind.name(), source.to_string())
                    .map_err(|source| TemplateError::Compile {
                        name: kind.name(),
                        source,
                    })?;
            }
        }

        Ok(Self {
            env,
            has_pass,
            has_headers,
        })
    }

    pub fn has(&self, kind: TemplateKind) -> bool {
        match kind {
            TemplateKind::Pass => self.has_pass,
            TemplateKind::SetHeaders => self.has_headers,
        }
    }

    /// Render `kind` against `view` into `out`. Unset templates render nothing.
    pub fn render<W: io::Write>(
        &self,
        kind: TemplateKind,
        view: &RouteView,
        out: W,
    ) -> Result<(), TemplateError> {
        if !self.has(kind) {
            return Ok(());
        }
        let render_err = |source| TemplateError::Render {
            name: kind.name(),
            source,
        };
        let template = self.env.get_template(kind.name()).map_err(render_err)?;
        template.render_captured_to(view, out).map_err(render_err)?;
        Ok(())
    }
}

fn register_helpers(env: &mut Environment<'static>) {
    env.add_function("has_prefix", |s: &str, prefix: &str| s.starts_with(prefix));
    env.add_function("has_suffix", |s: &str, suffix: &str| s.ends_with(suffix));
    env.add_function("host_only", |hostport: &str| host_only(hostport).to_string());
    env.add_function("split", |s: &str, sep: &str| {
        s.split(sep).map(str::to_string).collect::<Vec<_>>()
    });
    env.add_function("env", |name: &str| std::env::var(name).unwrap_or_default());
}

/// Strip the port from `host:port`, `[v6]:port` or a bare host.
pub fn host_only(hostport: &str) -> &str {
    if let Some(rest) = hostport.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match hostport.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            host
        }
        _ => hostport,
    }
}

/// Request fields visible to templates as `request.*`.
#[derive(Debug, Clone, Serialize)]
pub struct RequestView {
    pub method: String,
    pub uri: String,
    pub scheme: &'static str,
    pub host: String,
    pub path: String,
    pub query: String,
    pub version: String,
    /// Lower-case header name → first value.
    pub headers: BTreeMap<String, String>,
    pub remote_addr: String,
    pub remote_ip: String,
}

/// Everything a template can reference.
#[derive(Debug, Clone, Serialize)]
pub struct RouteView<'a> {
    pub request: RequestView,
    pub ja4: &'a str,
    pub user_agent: &'a UserAgent,
    pub server_addr: String,
}

impl<'a> RouteView<'a> {
    pub fn new(parts: &Parts, ctx: &'a RequestContext) -> Self {
        let mut headers = BTreeMap::new();
        for (name, value) in parts.headers.iter() {
            if let Ok(value) = value.to_str() {
                headers
                    .entry(name.as_str().to_string())
                    .or_insert_with(|| value.to_string());
            }
        }

        let request = RequestView {
            method: parts.method.to_string(),
            uri: parts.uri.to_string(),
            scheme: if ctx.is_tls() { "https" } else { "http" },
            host: request_host(parts).unwrap_or_default(),
            path: parts.uri.path().to_string(),
            query: parts.uri.query().unwrap_or_default().to_string(),
            version: format!("{:?}", parts.version),
            headers,
            remote_addr: ctx.remote_addr.to_string(),
            remote_ip: ctx.remote_addr.ip().to_string(),
        };

        Self {
            request,
            ja4: &ctx.ja4,
            user_agent: &ctx.user_agent,
            server_addr: ctx.server_addr.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn view_parts(uri: &str) -> (Parts, RequestContext) {
        let (parts, _) = Request::builder()
            .uri(uri)
            .header("host", "www.example.com")
            .header("x-tenant", "blue")
            .body(())
            .unwrap()
            .into_parts();
        let mut ctx = RequestContext::new(
            "203.0.113.9:40000".parse().unwrap(),
            "10.0.0.2:443".parse().unwrap(),
        );
        ctx.ja4 = "t13d1516h2_8daaf6152771_b186095e22b6".into();
        ctx.user_agent = UserAgent::from_raw("curl/8.5.0");
        (parts, ctx)
    }

    fn render(templates: &RouteTemplates, kind: TemplateKind, uri: &str) -> String {
        let (parts, ctx) = view_parts(uri);
        let view = RouteView::new(&parts, &ctx);
        let mut out = Vec::new();
        templates.render(kind, &view, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn pass_template_sees_request_fields() {
        let templates = RouteTemplates::compile(
            "{% if has_prefix(request.path, '/admin') %}403{% else %}http://{{ request.headers['x-tenant'] }}.svc:8080{% endif %}",
            "",
        )
        .unwrap();

        assert_eq!(render(&templates, TemplateKind::Pass, "/admin/users"), "403");
        assert_eq!(
            render(&templates, TemplateKind::Pass, "/api?q=1"),
            "http://blue.svc:8080"
        );
    }

    #[test]
    fn context_fields_are_exposed() {
        let templates = RouteTemplates::compile(
            "",
            "x-ja4: {{ ja4 }}\nx-ua: {{ user_agent.raw }}\nx-server: {{ server_addr }}\nx-host: {{ host_only(request.host) }}",
        )
        .unwrap();

        let out = render(&templates, TemplateKind::SetHeaders, "/");
        assert!(out.contains("x-ja4: t13d1516h2_8daaf6152771_b186095e22b6"));
        assert!(out.contains("x-ua: curl/8.5.0"));
        assert!(out.contains("x-server: 10.0.0.2:443"));
        assert!(out.contains("x-host: www.example.com"));
    }

    #[test]
    fn syntax_error_fails_compile() {
        let err = RouteTemplates::compile("{% if %}", "").unwrap_err();
        assert!(matches!(err, TemplateError::Compile { name: "pass", .. }));

        let err = RouteTemplates::compile("http://ok", "{{ unclosed").unwrap_err();
        assert!(matches!(err, TemplateError::Compile { name: "set_headers", .. }));
    }

    #[test]
    fn unset_templates_render_nothing() {
        let templates = RouteTemplates::compile("", "  ").unwrap();
        assert!(!templates.has(TemplateKind::Pass));
        assert!(!templates.has(TemplateKind::SetHeaders));
        assert_eq!(render(&templates, TemplateKind::Pass, "/"), "");
    }

    #[test]
    fn undefined_fields_render_empty() {
        let templates = RouteTemplates::compile("[{{ request.nope }}]", "").unwrap();
        assert_eq!(render(&templates, TemplateKind::Pass, "/"), "[]");
    }

    #[test]
    fn host_only_strips_ports() {
        assert_eq!(host_only("example.com:8443"), "example.com");
        assert_eq!(host_only("example.com"), "example.com");
        assert_eq!(host_only("[::1]:80"), "::1");
        assert_eq!(host_only("::1"), "::1");
    }
}
