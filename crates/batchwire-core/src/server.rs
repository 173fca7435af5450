//! Endpoint side of the batch protocol.
//!
//! [`decode_batch_request`] unpacks a body produced by
//! [`BatchEncoder`](crate::encoder::BatchEncoder); [`BatchResponseBuilder`]
//! writes the matching `multipart/mixed` reply.

use bytes::{BufMut, Bytes, BytesMut};
use url::Url;

use crate::decoder::buffered::split_parts;
use crate::decoder::{header_divider, is_http_part, parse_boundary, parse_header_block, split_head};
use crate::error::DecodeError;
use crate::message::{Body, ContentId, Headers, Request};
use crate::pattern::PatternSearch;

/// Split an encoded batch request into its embedded requests.
///
/// Request targets are resolved against `base`. Non-http parts are skipped.
pub fn decode_batch_request(
    content_type: &str,
    body: Bytes,
    base: &Url,
) -> Result<Vec<(ContentId, Request)>, DecodeError> {
    let boundary = parse_boundary(content_type)?;
    let crlf = PatternSearch::new(&b"\r\n"[..]);
    let divider = header_divider();

    let mut out = Vec::new();
    for part in split_parts(&boundary, &body)? {
        if !is_http_part(&part.headers) {
            continue;
        }
        let content_id = part
            .headers
            .get("content-id")
            .and_then(ContentId::from_header)
            .ok_or(DecodeError::MissingContentId)?;

        let content = &part.content[..];
        let line_end = crlf
            .search(content)
            .ok_or_else(|| DecodeError::InvalidMessage("missing request line".into()))?;
        let line = String::from_utf8_lossy(&content[..line_end]);
        let mut fields = line.split(' ');
        let (method, target) = match (fields.next(), fields.next(), fields.next()) {
            (Some(m), Some(t), Some(v)) if !m.is_empty() && v.starts_with("HTTP/") => (m, t),
            _ => return Err(DecodeError::InvalidMessage(format!("invalid request line: {line}"))),
        };
        let url = base
            .join(target)
            .map_err(|e| DecodeError::InvalidMessage(format!("invalid request target {target}: {e}")))?;

        let (head, payload) = split_head(&divider, &content[line_end + 2..])
            .ok_or_else(|| DecodeError::InvalidMessage("embedded headers are not terminated".into()))?;
        let payload = part.content.slice_ref(payload);
        let mut request = Request::new(method, url);
        request.headers = parse_header_block(head);
        if !payload.is_empty() {
            request.body = Body::Bytes(payload);
        }
        out.push((content_id, request));
    }
    tracing::debug!(requests = out.len(), "decoded batch request");
    Ok(out)
}

/// Writes a `multipart/mixed` batch reply.
#[derive(Debug)]
pub struct BatchResponseBuilder {
    boundary: String,
    buf: BytesMut,
    parts: usize,
}

impl BatchResponseBuilder {
    pub fn new(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            buf: BytesMut::new(),
            parts: 0,
        }
    }

    pub fn content_type(&self) -> String {
        format!("multipart/mixed; boundary={}", self.boundary)
    }

    pub fn len(&self) -> usize {
        self.parts
    }

    pub fn is_empty(&self) -> bool {
        self.parts == 0
    }

    /// Append the response to the request identified by `content_id`.
    pub fn push(
        &mut self,
        content_id: &ContentId,
        status: u16,
        status_text: &str,
        headers: &Headers,
        body: &[u8],
    ) -> &mut Self {
        let buf = &mut self.buf;
        put_line(buf, &format!("--{}", self.boundary));
        put_line(buf, "Content-Type: application/http; msgtype=response");
        put_line(buf, &format!("Content-ID: response-{content_id}"));
        put_line(buf, "");
        put_line(buf, format!("HTTP/1.1 {status} {status_text}").trim_end());
        for (name, value) in headers.iter() {
            put_line(buf, &format!("{name}: {value}"));
        }
        put_line(buf, "");
        buf.put_slice(body);
        put_line(buf, "");
        self.parts += 1;
        self
    }

    /// The finished body, closing delimiter included.
    pub fn build(mut self) -> Bytes {
        put_line(&mut self.buf, &format!("--{}--", self.boundary));
        self.buf.freeze()
    }
}

fn put_line(buf: &mut BytesMut, line: &str) {
    buf.put_slice(line.as_bytes());
    buf.put_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::BufferedDecoder;
    use crate::encoder::BatchEncoder;
    use crate::message::collect_stream;

    #[tokio::test]
    async fn encoded_requests_decode_back() {
        let mut enc = BatchEncoder::with_boundary("srv", "s1");
        let get = enc.add_request(Request::get("https://api.test/v1/a?x=1").unwrap());
        let post = enc.add_request(
            Request::new("POST", Url::parse("https://api.test/v1/b").unwrap())
                .header("X-Req", "2")
                .json(serde_json::json!({"k": "v"})),
        );
        let ct = enc.content_type();
        let body = enc.encode().await.unwrap();

        let base = Url::parse("https://api.test/").unwrap();
        let requests = decode_batch_request(&ct, body, &base).unwrap();
        assert_eq!(requests.len(), 2);

        let (id, req) = &requests[0];
        assert_eq!(id, &get);
        assert_eq!(req.method, "GET");
        assert_eq!(req.url.as_str(), "https://api.test/v1/a?x=1");
        assert!(matches!(req.body, Body::Empty));

        let (id, req) = requests.into_iter().nth(1).unwrap();
        assert_eq!(id, post);
        assert_eq!(req.headers.get("x-req"), Some("2"));
        assert_eq!(req.headers.get("content-type"), Some("application/json"));
        let bytes = collect_stream(req.body.into_stream().unwrap()).await.unwrap();
        assert_eq!(&bytes[..], b"{\"k\":\"v\"}");
    }

    #[tokio::test]
    async fn built_reply_decodes() {
        let mut builder = BatchResponseBuilder::new("r");
        let headers: Headers = [("Content-Type", "text/plain")].into_iter().collect();
        builder
            .push(&ContentId::new("request-1-s"), 200, "OK", &headers, b"hello")
            .push(&ContentId::new("request-2-s"), 204, "No Content", &Headers::new(), b"");
        assert_eq!(builder.len(), 2);
        let ct = builder.content_type();
        let body = builder.build();

        let mut dec = BufferedDecoder::new(&ct, body).unwrap();
        let first = dec.get_response("request-1-s").unwrap().unwrap();
        assert_eq!(first.content_type(), Some("text/plain"));
        assert_eq!(first.text().await.unwrap(), "hello");
        let second = dec.get_response("request-2-s").unwrap().unwrap();
        assert_eq!(second.status, 204);
    }

    #[test]
    fn rejects_bad_request_line() {
        let body = "--b\r\nContent-Type: application/http\r\nContent-ID: x\r\n\r\nGET\r\n\r\n\r\n--b--\r\n";
        let base = Url::parse("https://h.test/").unwrap();
        let err = decode_batch_request("multipart/mixed; boundary=b", Bytes::from(body), &base).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidMessage(_)));
    }
}
