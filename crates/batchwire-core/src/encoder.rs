//! `multipart/mixed` request encoder.
//!
//! Each registered request becomes one `application/http` part:
//!
//! ```text
//! --<boundary>\r\n
//! Content-ID: request-<seq>-<suffix>\r\n
//! Content-Type: application/http; msgtype=request\r\n
//! \r\n
//! GET /path?query HTTP/1.1\r\n
//! <request headers>\r\n
//! \r\n
//! <body bytes>\r\n
//! ```
//!
//! followed by a single `--<boundary>--\r\n`. The buffered [`BatchEncoder::encode`]
//! drains the same segments as [`BatchEncoder::into_stream`], so both are
//! byte-identical.

use bytes::{BufMut, Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use uuid::Uuid;

use crate::error::BatchError;
use crate::message::{collect_stream, once_stream, BodyStream, ContentId, Headers, Request};

/// Builds one batch body. Single use: consumed by `into_stream`/`encode`.
#[derive(Debug)]
pub struct BatchEncoder {
    boundary: String,
    suffix: String,
    requests: Vec<(ContentId, Request)>,
}

impl Default for BatchEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchEncoder {
    /// Encoder with a random boundary and ContentId suffix.
    pub fn new() -> Self {
        let id = Uuid::new_v4().simple().to_string();
        let suffix = id[..12].to_string();
        Self::with_boundary(format!("batch_{id}"), suffix)
    }

    /// Encoder with a fixed boundary and suffix.
    pub fn with_boundary(boundary: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            suffix: suffix.into(),
            requests: Vec::new(),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Register a request and return its correlation id (1-based sequence).
    pub fn add_request(&mut self, request: Request) -> ContentId {
        let seq = self.requests.len() + 1;
        let id = ContentId::new(format!("request-{seq}-{}", self.suffix));
        self.requests.push((id.clone(), request));
        id
    }

    /// Outer `Content-Type` value.
    pub fn content_type(&self) -> String {
        format!("multipart/mixed; boundary={}", self.boundary)
    }

    /// Merge the multipart content type over `base`.
    pub fn headers(&self, base: Option<Headers>) -> Headers {
        let mut headers = base.unwrap_or_default();
        headers.insert("Content-Type", self.content_type());
        headers
    }

    /// Lazily pulled batch body. Stream bodies are forwarded chunk by chunk.
    pub fn into_stream(self) -> Result<BodyStream, BatchError> {
        let mut segments: Vec<BodyStream> = Vec::with_capacity(self.requests.len() * 3 + 1);
        let parts = self.requests.len();
        for (id, request) in self.requests {
            segments.push(once_stream(part_head(&self.boundary, &id, &request)?));
            segments.push(request.body.into_stream()?);
            segments.push(once_stream(Bytes::from_static(b"\r\n")));
        }
        segments.push(once_stream(Bytes::from(format!("--{}--\r\n", self.boundary))));

        tracing::debug!(parts, boundary = %self.boundary, "encoded batch body");
        Ok(Box::pin(stream::iter(segments).flatten()))
    }

    /// Fully buffered batch body.
    pub async fn encode(self) -> Result<Bytes, BatchError> {
        collect_stream(self.into_stream()?).await
    }
}

/// Delimiter, part headers and the embedded request head.
fn part_head(boundary: &str, id: &ContentId, request: &Request) -> Result<Bytes, BatchError> {
    let target = request.target();
    check_token("method", &request.method)?;
    check_line("request target", &target)?;

    let mut buf = BytesMut::with_capacity(256);
    put_line(&mut buf, &format!("--{boundary}"));
    put_line(&mut buf, &format!("Content-ID: {id}"));
    put_line(&mut buf, "Content-Type: application/http; msgtype=request");
    put_line(&mut buf, "");
    put_line(&mut buf, &format!("{} {target} HTTP/1.1", request.method));
    for (name, value) in request.effective_headers().iter() {
        check_token("header name", name)?;
        check_line("header value", value)?;
        put_line(&mut buf, &format!("{name}: {value}"));
    }
    put_line(&mut buf, "");
    Ok(buf.freeze())
}

fn put_line(buf: &mut BytesMut, line: &str) {
    buf.put_slice(line.as_bytes());
    buf.put_slice(b"\r\n");
}

fn check_token(what: &str, s: &str) -> Result<(), BatchError> {
    if s.is_empty() || s.bytes().any(|b| b <= b' ' || b == b':' || b >= 0x7f) {
        return Err(BatchError::InvalidRequest(format!("invalid {what}: {s:?}")));
    }
    Ok(())
}

fn check_line(what: &str, s: &str) -> Result<(), BatchError> {
    if s.bytes().any(|b| b == b'\r' || b == b'\n') {
        return Err(BatchError::InvalidRequest(format!("{what} contains a line break")));
    }
    Ok(())
}
