//! Raw byte tunnels.
//!
//! # Responsibilities
//! - Hand-build the HTTP/1.1 websocket handshake for an extended CONNECT
//! - Read the backend's response head line by line
//! - Splice two duplex streams until either side closes
//!
//! # Design Decisions
//! - One copy direction runs on a `JoinSet` task, the other on the caller;
//!   whichever ends first aborts and joins the other
//! - Both directions' outcomes are reported, never dropped

use std::fmt;
use std::io::{self, Write as _};

use axum::http::header::{CONNECTION, HOST, SEC_WEBSOCKET_KEY, UPGRADE};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::{JoinError, JoinSet};
use url::Url;

use super::error::ProxyError;
use super::target::{dial_address, is_secure, server_name};
use crate::net::transport::connect_tls;
use crate::net::{BoxedIo, BufferPool, PooledBuffer, Transport};

/// The only extended CONNECT protocol that is tunnelled.
pub const WEBSOCKET: &str = "websocket";

/// Longest accepted response head line.
const MAX_LINE_LEN: u64 = 8 * 1024;

/// Most header lines accepted in a response head.
const MAX_HEAD_LINES: usize = 128;

/// Headers the handshake writes itself.
const HANDSHAKE_HEADERS: [HeaderName; 4] = [HOST, CONNECTION, UPGRADE, SEC_WEBSOCKET_KEY];

/// A fresh `Sec-WebSocket-Key`: 16 random bytes, base64.
///
/// The key is a handshake nonce and carries no secrecy, so the fast
/// non-cryptographic generator is enough.
pub fn websocket_key() -> String {
    let mut nonce = [0u8; 16];
    fastrand::fill(&mut nonce);
    STANDARD.encode(nonce)
}

/// Write a legacy upgrade request for `parts` into `buf`.
pub fn write_upgrade_request(
    buf: &mut PooledBuffer,
    parts: &Parts,
    protocol: &str,
    host: &str,
    key: &str,
) -> io::Result<()> {
    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .filter(|p| !p.is_empty())
        .unwrap_or("/");
    write!(buf, "GET {} HTTP/1.1\r\n", path)?;

    for (name, value) in parts.headers.iter() {
        if HANDSHAKE_HEADERS.contains(name) {
            continue;
        }
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    write!(buf, "Sec-WebSocket-Key: {}\r\n", key)?;
    write!(buf, "Upgrade: {}\r\n", protocol)?;
    write!(buf, "Host: {}\r\n", host)?;
    buf.push_str("Connection: Upgrade\r\n\r\n");
    Ok(())
}

/// Status and headers of a backend's handshake response.
#[derive(Debug)]
pub struct UpgradeHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Read a response head, leaving any bytes after it in `reader`.
pub async fn read_response_head<R>(reader: &mut R) -> io::Result<UpgradeHead>
where
    R: AsyncBufRead + Unpin,
{
    let status_line = read_line(reader).await?;
    let status = parse_status_line(&status_line)?;

    let mut headers = HeaderMap::new();
    for _ in 0..MAX_HEAD_LINES {
        let line = read_line(reader).await?;
        if line.is_empty() {
            return Ok(UpgradeHead { status, headers });
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(invalid(format!("malformed header line {:?}", line)));
        };
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| invalid(format!("invalid header name {:?}", name)))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| invalid(format!("invalid value for header {}", name)))?;
        headers.append(name, value);
    }
    Err(invalid("too many header lines".to_string()))
}

/// One line without its terminator. EOF before the terminator is an error.
async fn read_line<R>(reader: &mut R) -> io::Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = (&mut *reader).take(MAX_LINE_LEN).read_line(&mut line).await?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before response head",
        ));
    }
    if !line.ends_with('\n') {
        if n as u64 == MAX_LINE_LEN {
            return Err(invalid("response head line too long".to_string()));
        }
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed inside response head",
        ));
    }
    let trimmed = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(trimmed);
    Ok(line)
}

fn parse_status_line(line: &str) -> io::Result<StatusCode> {
    let mut fields = line.splitn(3, ' ');
    let version = fields.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(invalid(format!("malformed status line {:?}", line)));
    }
    fields
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| invalid(format!("malformed status line {:?}", line)))
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

/// Dial `target`, send the websocket handshake and require `101`.
///
/// The returned reader still holds any bytes the backend sent after its
/// response head.
pub async fn open_websocket_tunnel(
    transport: &dyn Transport,
    buffers: &BufferPool,
    parts: &Parts,
    protocol: &str,
    target: &Url,
    host: &str,
) -> Result<(UpgradeHead, BufReader<BoxedIo>), ProxyError> {
    let addr = dial_address(target);

    let stream = transport
        .dial(&addr)
        .await
        .map_err(|source| ProxyError::Dial {
            addr: addr.clone(),
            source,
        })?;

    let mut io: BoxedIo = if is_secure(target) {
        let tls = connect_tls(transport.tls_config(), &server_name(target), stream)
            .await
            .map_err(|source| ProxyError::Handshake {
                addr: addr.clone(),
                source,
            })?;
        Box::new(tls)
    } else {
        Box::new(stream)
    };

    let write_err = |source| ProxyError::UpgradeWrite {
        addr: addr.clone(),
        source,
    };
    let mut request = buffers.get();
    write_upgrade_request(&mut request, parts, protocol, host, &websocket_key()).map_err(write_err)?;
    io.write_all(&request).await.map_err(write_err)?;
    io.flush().await.map_err(write_err)?;
    drop(request);

    let mut reader = BufReader::new(io);
    let head = read_response_head(&mut reader)
        .await
        .map_err(|source| ProxyError::UpgradeRead {
            addr: addr.clone(),
            source,
        })?;

    tracing::info!(
        hostport = %addr,
        resp_statuscode = head.status.as_u16(),
        resp_header = ?head.headers,
        "Upgrade response received"
    );

    if head.status != StatusCode::SWITCHING_PROTOCOLS {
        return Err(ProxyError::UpgradeRejected(head.status.as_u16()));
    }
    Ok((head, reader))
}

/// How one copy direction ended.
#[derive(Debug)]
pub enum Outcome {
    /// Reached EOF after copying this many bytes.
    Finished(u64),
    Failed(io::Error),
    /// Aborted because the other direction ended first.
    TornDown,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Finished(bytes) => write!(f, "finished after {} bytes", bytes),
            Outcome::Failed(e) => write!(f, "failed: {}", e),
            Outcome::TornDown => f.write_str("torn down"),
        }
    }
}

/// Result of a splice, one outcome per direction.
#[derive(Debug)]
pub struct SpliceReport {
    /// Client to backend.
    pub upstream: Outcome,
    /// Backend to client.
    pub downstream: Outcome,
}

impl SpliceReport {
    pub fn log(&self, kind: &'static str) {
        let failed = matches!(self.upstream, Outcome::Failed(_))
            || matches!(self.downstream, Outcome::Failed(_));
        if failed {
            tracing::warn!(
                kind,
                upstream = %self.upstream,
                downstream = %self.downstream,
                "Tunnel closed with error"
            );
        } else {
            tracing::debug!(
                kind,
                upstream = %self.upstream,
                downstream = %self.downstream,
                "Tunnel closed"
            );
        }
    }
}

/// Copy bytes both ways between `client` and `backend` until either side ends.
pub async fn splice<C, B>(client: C, backend: B) -> SpliceReport
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let mut downstream = JoinSet::new();
    downstream.spawn(async move {
        let copied = tokio::io::copy(&mut backend_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        copied
    });

    let upstream = async {
        let copied = tokio::io::copy(&mut client_read, &mut backend_write).await;
        let _ = backend_write.shutdown().await;
        copied
    };
    tokio::pin!(upstream);

    tokio::select! {
        copied = &mut upstream => {
            downstream.abort_all();
            SpliceReport {
                upstream: copied_outcome(copied),
                downstream: joined_outcome(downstream.join_next().await),
            }
        }
        joined = downstream.join_next() => SpliceReport {
            upstream: Outcome::TornDown,
            downstream: joined_outcome(joined),
        },
    }
}

fn copied_outcome(copied: io::Result<u64>) -> Outcome {
    match copied {
        Ok(bytes) => Outcome::Finished(bytes),
        Err(e) => Outcome::Failed(e),
    }
}

fn joined_outcome(joined: Option<Result<io::Result<u64>, JoinError>>) -> Outcome {
    match joined {
        Some(Ok(copied)) => copied_outcome(copied),
        Some(Err(e)) if e.is_panic() => Outcome::Failed(io::Error::other("copy task panicked")),
        Some(Err(_)) | None => Outcome::TornDown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::testing::FakeTransport;
    use axum::http::{Method, Request, Version};
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    fn connect_parts() -> Parts {
        Request::builder()
            .method(Method::CONNECT)
            .version(Version::HTTP_2)
            .uri("https://chat.example/socket?room=1")
            .header("sec-websocket-version", "13")
            .header("origin", "https://chat.example")
            .header("host", "should-not-repeat")
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    #[test]
    fn websocket_key_is_16_bytes() {
        let key = websocket_key();
        assert_eq!(STANDARD.decode(&key).unwrap().len(), 16);
        assert_ne!(key, websocket_key());
    }

    #[test]
    fn upgrade_request_layout() {
        let pool = BufferPool::new();
        let mut buf = pool.get();
        write_upgrade_request(&mut buf, &connect_parts(), "websocket", "chat.example", "a2V5")
            .unwrap();
        let text = buf.to_string_lossy();

        assert!(text.starts_with("GET /socket?room=1 HTTP/1.1\r\n"));
        assert!(text.contains("sec-websocket-version: 13\r\n"));
        assert!(text.contains("origin: https://chat.example\r\n"));
        assert!(text.contains("Sec-WebSocket-Key: a2V5\r\n"));
        assert!(text.contains("Upgrade: websocket\r\n"));
        assert!(text.contains("Host: chat.example\r\n"));
        assert!(!text.contains("should-not-repeat"));
        assert!(text.ends_with("Connection: Upgrade\r\n\r\n"));
    }

    #[tokio::test]
    async fn response_head_leaves_trailing_bytes() {
        let raw: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nSec-WebSocket-Accept: abc\r\n\r\nframe";
        let mut reader = BufReader::new(raw);

        let head = read_response_head(&mut reader).await.unwrap();
        assert_eq!(head.status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(head.headers["upgrade"], "websocket");
        assert_eq!(head.headers["sec-websocket-accept"], "abc");

        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "frame");
    }

    #[tokio::test]
    async fn truncated_head_is_error() {
        let raw: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: webs";
        let err = read_response_head(&mut BufReader::new(raw)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        let raw: &[u8] = b"SSH-2.0-OpenSSH\r\n\r\n";
        let err = read_response_head(&mut BufReader::new(raw)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn splice_is_transparent_and_closes_both_sides() {
        let (mut client, client_proxy) = duplex(1024);
        let (backend_proxy, mut backend) = duplex(1024);
        let session = tokio::spawn(splice(client_proxy, backend_proxy));

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        backend.write_all(b"world").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        drop(client);
        let report = tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(report.upstream, Outcome::Finished(5)));

        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), backend.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn backend_close_tears_down_client() {
        let (mut client, client_proxy) = duplex(1024);
        let (backend_proxy, backend) = duplex(1024);
        let session = tokio::spawn(splice(client_proxy, backend_proxy));

        drop(backend);
        let report = tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(report.downstream, Outcome::Finished(0)));
        assert!(matches!(report.upstream, Outcome::TornDown));

        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).await.unwrap(), 0);
    }

    async fn handshake_backend(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut head = String::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                head.push_str(&line);
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            reader.get_mut().write_all(response.as_bytes()).await.unwrap();
            head
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn tunnel_opens_on_101() {
        let (addr, backend) = handshake_backend(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nSec-WebSocket-Accept: xyz\r\n\r\n",
        )
        .await;
        let transport = FakeTransport::default();
        let target = Url::parse(&format!("ws://{}", addr)).unwrap();

        let (head, _reader) = open_websocket_tunnel(
            &transport,
            &BufferPool::new(),
            &connect_parts(),
            WEBSOCKET,
            &target,
            "chat.example",
        )
        .await
        .unwrap();

        assert_eq!(head.headers["sec-websocket-accept"], "xyz");
        let sent = backend.await.unwrap();
        assert!(sent.starts_with("GET /socket?room=1 HTTP/1.1\r\n"));
        assert!(sent.contains("Upgrade: websocket\r\n"));
    }

    #[tokio::test]
    async fn non_101_is_rejected_with_code() {
        let (addr, _backend) =
            handshake_backend("HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n").await;
        let transport = FakeTransport::default();
        let target = Url::parse(&format!("http://{}", addr)).unwrap();

        let err = open_websocket_tunnel(
            &transport,
            &BufferPool::new(),
            &connect_parts(),
            WEBSOCKET,
            &target,
            "chat.example",
        )
        .await
        .err()
        .expect("handshake fails");

        assert!(matches!(err, ProxyError::UpgradeRejected(403)));
        assert!(err.to_string().contains("403"));
    }

    #[tokio::test]
    async fn dial_failure_is_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = FakeTransport::default();
        let target = Url::parse(&format!("ws://{}", addr)).unwrap();
        let err = open_websocket_tunnel(
            &transport,
            &BufferPool::new(),
            &connect_parts(),
            WEBSOCKET,
            &target,
            "chat.example",
        )
        .await
        .err()
        .expect("handshake fails");

        assert!(matches!(err, ProxyError::Dial { .. }));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }
}
