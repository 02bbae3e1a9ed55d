//! Diagnostic capture of failing upstream responses.
//!
//! The response body is wrapped so the client still receives the stream
//! unchanged; the first `DUMP_LIMIT` bytes are kept and logged together with
//! the response head once the body finishes or is dropped.

use std::fmt::Write as _;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::response::Parts;
use bytes::Bytes;
use http_body::{Body as HttpBody, Frame, SizeHint};

/// Maximum body bytes kept for a dump.
pub const DUMP_LIMIT: usize = 64 * 1024;

/// Body adaptor that tees a prefix of the stream into a log record.
pub struct DumpBody {
    inner: Body,
    head: String,
    status: u16,
    captured: Vec<u8>,
    truncated: bool,
    error: Option<String>,
    span: tracing::Span,
}

impl DumpBody {
    pub fn new(parts: &Parts, inner: Body, span: tracing::Span) -> Self {
        Self {
            inner,
            head: format_head(parts),
            status: parts.status.as_u16(),
            captured: Vec::new(),
            truncated: false,
            error: None,
            span,
        }
    }

    fn capture(&mut self, data: &Bytes) {
        let room = DUMP_LIMIT.saturating_sub(self.captured.len());
        if data.len() > room {
            self.truncated = true;
        }
        self.captured.extend_from_slice(&data[..data.len().min(room)]);
    }
}

fn format_head(parts: &Parts) -> String {
    let mut head = format!(
        "{:?} {} {}\r\n",
        parts.version,
        parts.status.as_u16(),
        parts.status.canonical_reason().unwrap_or_default()
    );
    for (name, value) in parts.headers.iter() {
        let _ = write!(
            head,
            "{}: {}\r\n",
            name,
            String::from_utf8_lossy(value.as_bytes())
        );
    }
    head.push_str("\r\n");
    head
}

impl HttpBody for DumpBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.capture(data);
                }
            }
            Poll::Ready(Some(Err(e))) => this.error = Some(e.to_string()),
            _ => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for DumpBody {
    fn drop(&mut self) {
        let mut data = self.head.clone();
        data.push_str(&String::from_utf8_lossy(&self.captured));

        match &self.error {
            Some(error) => tracing::warn!(
                parent: &self.span,
                status = self.status,
                error = %error,
                data = %data,
                "Dump failure response incomplete"
            ),
            None => tracing::info!(
                parent: &self.span,
                status = self.status,
                truncated = self.truncated,
                data = %data,
                "Dump failure response"
            ),
        }
    }
}
