//! Buffered batch reply decoder.
//!
//! Operates on a body that has already been read into memory. Parts are
//! located with a single [`PatternSearch::search_all`] pass and parsed the
//! first time a response is looked up.

use bytes::Bytes;

use crate::error::DecodeError;
use crate::message::{ContentId, Headers, Response, ResponseBody};
use crate::pattern::PatternSearch;

use super::{header_divider, is_http_part, parse_boundary, parse_header_block, parse_status_line, split_head};

/// One body part: its MIME headers and the bytes after the blank line.
#[derive(Debug, Clone)]
pub(crate) struct RawPart {
    pub headers: Headers,
    pub content: Bytes,
}

/// Split a complete multipart body into its parts.
///
/// A delimiter is `--boundary` at the start of the body or right after a
/// CRLF, followed by optional transport padding and CRLF (or `--` for the
/// closing delimiter). Anything before the first and after the last
/// delimiter is ignored.
pub(crate) fn split_parts(boundary: &str, body: &Bytes) -> Result<Vec<RawPart>, DecodeError> {
    let opening = PatternSearch::new(format!("--{boundary}").into_bytes());
    let delimiters: Vec<Delimiter> = opening
        .search_all(body)
        .into_iter()
        .filter_map(|at| classify(body, at, opening.len()))
        .collect();

    let first = delimiters.first().ok_or(DecodeError::BoundaryNotFound)?;
    if first.closing {
        return Ok(Vec::new());
    }

    let divider = header_divider();
    let mut parts = Vec::new();
    for pair in delimiters.windows(2) {
        let (open, next) = (&pair[0], &pair[1]);
        // the CRLF before the next delimiter belongs to it
        let end = (next.at - 2).max(open.content_start);
        let content = &body[open.content_start..end];
        let (head, rest) = split_head(&divider, content)
            .ok_or_else(|| DecodeError::InvalidMessage("part headers are not terminated".into()))?;
        parts.push(RawPart {
            headers: parse_header_block(head),
            content: body.slice_ref(rest),
        });
        if next.closing {
            return Ok(parts);
        }
    }
    Err(DecodeError::NoClosingBoundary)
}

struct Delimiter {
    at: usize,
    closing: bool,
    content_start: usize,
}

fn classify(body: &[u8], at: usize, len: usize) -> Option<Delimiter> {
    if at != 0 && (at < 2 || &body[at - 2..at] != b"\r\n") {
        return None;
    }
    let after = &body[at + len..];
    if after.starts_with(b"--") {
        return Some(Delimiter {
            at,
            closing: true,
            content_start: body.len(),
        });
    }
    let padding = after.iter().take_while(|b| matches!(b, b' ' | b'\t')).count();
    after[padding..].starts_with(b"\r\n").then(|| Delimiter {
        at,
        closing: false,
        content_start: at + len + padding + 2,
    })
}

/// A decoded embedded response, kept as plain data until handed out.
#[derive(Debug, Clone)]
struct DecodedPart {
    content_id: ContentId,
    status: u16,
    status_text: String,
    headers: Headers,
    body: Bytes,
}

impl DecodedPart {
    fn to_response(&self) -> Response {
        Response::new(
            self.status,
            self.status_text.clone(),
            self.headers.clone(),
            ResponseBody::Full(self.body.clone()),
        )
    }
}

/// Decoder over a fully buffered `multipart/mixed` reply.
#[derive(Debug)]
pub struct BufferedDecoder {
    boundary: String,
    body: Bytes,
    parts: Option<Vec<DecodedPart>>,
}

impl BufferedDecoder {
    pub fn new(content_type: &str, body: Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            boundary: parse_boundary(content_type)?,
            body,
            parts: None,
        })
    }

    /// First response whose Content-ID contains `id_substring`.
    pub fn get_response(&mut self, id_substring: &str) -> Result<Option<Response>, DecodeError> {
        let parts = self.parse()?;
        Ok(parts
            .iter()
            .find(|p| p.content_id.as_str().contains(id_substring))
            .map(DecodedPart::to_response))
    }

    /// Every response in wire order.
    pub fn into_responses(mut self) -> Result<Vec<(ContentId, Response)>, DecodeError> {
        self.parse()?;
        Ok(self
            .parts
            .unwrap_or_default()
            .into_iter()
            .map(|p| {
                let response = p.to_response();
                (p.content_id, response)
            })
            .collect())
    }

    fn parse(&mut self) -> Result<&[DecodedPart], DecodeError> {
        if self.parts.is_none() {
            let mut decoded = Vec::new();
            for part in split_parts(&self.boundary, &self.body)? {
                if !is_http_part(&part.headers) {
                    tracing::trace!(
                        content_type = part.headers.get("content-type").unwrap_or(""),
                        "skipping non-http part"
                    );
                    continue;
                }
                decoded.push(decode_part(part)?);
            }
            tracing::debug!(parts = decoded.len(), "decoded buffered batch reply");
            self.parts = Some(decoded);
        }
        Ok(self.parts.as_deref().unwrap_or_default())
    }
}

fn decode_part(part: RawPart) -> Result<DecodedPart, DecodeError> {
    let content_id = part
        .headers
        .get("content-id")
        .and_then(ContentId::from_header)
        .ok_or(DecodeError::MissingContentId)?;

    let content = &part.content[..];
    let line_end = PatternSearch::new(&b"\r\n"[..])
        .search(content)
        .ok_or_else(|| DecodeError::InvalidStatusLine(String::from_utf8_lossy(content).into_owned()))?;
    let (status, status_text) = parse_status_line(&String::from_utf8_lossy(&content[..line_end]))?;

    let (head, body) = split_head(&header_divider(), &content[line_end + 2..])
        .ok_or_else(|| DecodeError::InvalidMessage("embedded headers are not terminated".into()))?;
    Ok(DecodedPart {
        content_id,
        status,
        status_text,
        headers: parse_header_block(head),
        body: part.content.slice_ref(body),
    })
}
