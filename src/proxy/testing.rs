//! Test doubles for the forwarding engine.

use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, Response, StatusCode, Uri, Version};
use bytes::Bytes;
use http_body_util::BodyExt;
use rustls::ClientConfig;
use tokio::net::TcpStream;

use crate::net::{Transport, TransportError};

/// What the fake transport was asked to send.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

type Responder = Box<dyn Fn(&SeenRequest) -> Result<Response<Body>, TransportError> + Send + Sync>;

/// Records roundtrips and answers them from a closure; dials real TCP.
#[derive(Default)]
pub struct FakeTransport {
    seen: Mutex<Vec<SeenRequest>>,
    responder: Option<Responder>,
}

impl FakeTransport {
    pub fn responding<F>(responder: F) -> Self
    where
        F: Fn(&SeenRequest) -> Result<Response<Body>, TransportError> + Send + Sync + 'static,
    {
        Self {
            seen: Mutex::new(Vec::new()),
            responder: Some(Box::new(responder)),
        }
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>, TransportError> {
        let (parts, body) = req.into_parts();
        let body = body
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .unwrap_or_default();
        let seen = SeenRequest {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body,
        };
        self.seen.lock().unwrap().push(seen.clone());

        match &self.responder {
            Some(respond) => respond(&seen),
            None => Ok(Response::builder()
                .status(StatusCode::OK)
                .body(Body::empty())
                .unwrap()),
        }
    }

    async fn dial(&self, addr: &str) -> io::Result<TcpStream> {
        TcpStream::connect(addr).await
    }

    fn tls_config(&self) -> Arc<ClientConfig> {
        Arc::new(
            ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .unwrap()
                .with_root_certificates(rustls::RootCertStore::empty())
                .with_no_client_auth(),
        )
    }
}
