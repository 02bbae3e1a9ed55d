//! Outbound transport.
//!
//! # Responsibilities
//! - Execute pooled request/response roundtrips to backends
//! - Dial raw TCP connections for hand-built upgrade tunnels
//! - Own the TLS client configuration shared by both paths
//! - Classify failures (timeout vs. other) for the forwarding engine
//!
//! # Design Decisions
//! - The engine only sees the `Transport` trait so tests can substitute it
//! - Outgoing requests are always sent as HTTP/1.1; the inbound version is
//!   not carried across
//! - Pooled connections belong to the hyper client, never to a request

use std::error::Error as StdError;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response, Version};
use hyper_rustls::{ConfigBuilderExt, HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::{TokioExecutor, TokioTimer},
};
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::config::TimeoutConfig;

/// Errors returned by a roundtrip.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream request canceled")]
    Canceled,

    #[error("upstream I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("upstream request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
}

impl TransportError {
    /// Deadline, cancellation and OS-level timeouts all count as timeouts.
    pub fn is_timeout(&self) -> bool {
        match self {
            TransportError::Timeout(_) | TransportError::Canceled => true,
            TransportError::Io(e) => chain_has_timeout(e),
            TransportError::Client(e) => chain_has_timeout(e),
        }
    }
}

/// Walk an error's source chain looking for a timeout or cancellation.
pub fn chain_has_timeout(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::TimedOut {
                return true;
            }
        }
        if e.is::<tokio::time::error::Elapsed>() {
            return true;
        }
        if let Some(hyper_err) = e.downcast_ref::<hyper::Error>() {
            if hyper_err.is_timeout() || hyper_err.is_canceled() {
                return true;
            }
        }
        current = e.source();
    }
    false
}

/// Byte stream to a backend, plain or TLS.
pub trait UpstreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> UpstreamIo for T {}

pub type BoxedIo = Box<dyn UpstreamIo>;

/// Outbound capability used by the forwarding engine.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and return the backend's response head with a streaming body.
    async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>, TransportError>;

    /// Open a fresh TCP connection to `host:port`.
    async fn dial(&self, addr: &str) -> io::Result<TcpStream>;

    /// TLS configuration for secure backends.
    fn tls_config(&self) -> Arc<ClientConfig>;
}

/// Run a TLS client handshake over an established connection.
pub async fn connect_tls(
    config: Arc<ClientConfig>,
    host: &str,
    stream: TcpStream,
) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    TlsConnector::from(config).connect(server_name, stream).await
}

/// TLS client configuration trusting the platform's root certificates.
pub fn default_tls_config() -> io::Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(io::Error::other)?
        .with_native_roots()?
        .with_no_client_auth();
    Ok(config)
}

/// Pooled hyper client transport.
#[derive(Clone)]
pub struct HyperTransport {
    client: Client<HttpsConnector<HttpConnector>, Body>,
    tls: Arc<ClientConfig>,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl HyperTransport {
    /// Build a transport using the platform root store.
    pub fn new(timeouts: &TimeoutConfig) -> io::Result<Self> {
        Ok(Self::with_tls_config(timeouts, Arc::new(default_tls_config()?)))
    }

    pub fn with_tls_config(timeouts: &TimeoutConfig, tls: Arc<ClientConfig>) -> Self {
        let connect_timeout = Duration::from_secs(timeouts.connect_secs);

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        http.set_connect_timeout(Some(connect_timeout));

        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls.as_ref().clone())
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(Duration::from_secs(timeouts.idle_secs))
            .build(https);

        Self {
            client,
            tls,
            connect_timeout,
            request_timeout: Duration::from_secs(timeouts.request_secs),
        }
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn round_trip(&self, mut req: Request<Body>) -> Result<Response<Body>, TransportError> {
        *req.version_mut() = Version::HTTP_11;

        match tokio::time::timeout(self.request_timeout, self.client.request(req)).await {
            Ok(Ok(response)) => {
                let (parts, body) = response.into_parts();
                Ok(Response::from_parts(parts, Body::new(body)))
            }
            Ok(Err(e)) => Err(TransportError::Client(e)),
            Err(_) => Err(TransportError::Timeout(self.request_timeout)),
        }
    }

    async fn dial(&self, addr: &str) -> io::Result<TcpStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, format!("dial {} timed out", addr))
            })??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn tls_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.tls)
    }
}
