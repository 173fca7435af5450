//! `multipart/mixed` batch reply decoders.
//!
//! - [`streaming`] — incremental state machine over a chunk stream; bodies
//!   are handed out as pull-based streams while the reply is still arriving.
//! - [`buffered`] — slices a fully read body, parses lazily on first lookup.
//! - [`text`] — line-oriented fallback for replies only available as text.
//!
//! All three share the head parsing helpers below.

pub mod buffered;
pub mod streaming;
pub mod text;
pub mod tokenizer;

pub use buffered::BufferedDecoder;
pub use streaming::StreamingDecoder;
pub use text::decode_text;
pub use tokenizer::{DecoderState, PartToken, PartTokenizer};

use crate::error::DecodeError;
use crate::message::{ContentId, Headers};
use crate::pattern::PatternSearch;

/// `true` if the media type of `content_type` is `multipart/mixed`.
pub fn is_multipart_mixed(content_type: &str) -> bool {
    media_type(content_type).eq_ignore_ascii_case("multipart/mixed")
}

/// Extract the `boundary` parameter of a `multipart/mixed` content type.
pub fn parse_boundary(content_type: &str) -> Result<String, DecodeError> {
    if !is_multipart_mixed(content_type) {
        return Err(DecodeError::NotMultipart(content_type.to_string()));
    }
    content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|b| !b.is_empty())
        .ok_or(DecodeError::MissingBoundary)
}

fn media_type(content_type: &str) -> &str {
    content_type.split(';').next().unwrap_or("").trim()
}

/// Part headers are acceptable for an embedded HTTP message.
pub(crate) fn is_http_part(headers: &Headers) -> bool {
    headers
        .get("content-type")
        .map(|ct| media_type(ct).to_ascii_lowercase().starts_with("application/http"))
        .unwrap_or(false)
}

/// Validate part headers and return the part's Content-ID.
pub(crate) fn part_content_id(headers: &Headers) -> Result<ContentId, DecodeError> {
    if !is_http_part(headers) {
        return Err(DecodeError::InvalidPartContentType(
            headers.get("content-type").map(str::to_string),
        ));
    }
    headers
        .get("content-id")
        .and_then(ContentId::from_header)
        .ok_or(DecodeError::MissingContentId)
}

/// Parse header lines, honouring obsolete line folding.
///
/// A line starting with a space or tab continues the previous header's
/// value. Lines without a colon (or with an empty name) are ignored.
pub(crate) fn parse_header_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Headers {
    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            headers.continue_last(line.trim());
            continue;
        }
        match line.split_once(':') {
            Some((name, value)) if !name.trim().is_empty() && !name.contains(' ') => {
                headers.append(name.trim(), value.trim());
            }
            _ => tracing::trace!(line, "ignoring malformed header line"),
        }
    }
    headers
}

/// Parse a CRLF-separated header block (without the terminating blank line).
pub(crate) fn parse_header_block(block: &[u8]) -> Headers {
    let text = String::from_utf8_lossy(block);
    parse_header_lines(text.split("\r\n"))
}

/// Parse `HTTP/1.1 200 OK` into status and reason phrase.
pub(crate) fn parse_status_line(line: &str) -> Result<(u16, String), DecodeError> {
    let invalid = || DecodeError::InvalidStatusLine(line.to_string());
    let line = line.trim_end_matches(['\r', '\n']);
    let (version, rest) = line.split_once(' ').ok_or_else(invalid)?;
    if !version.starts_with("HTTP/") {
        return Err(invalid());
    }
    let rest = rest.trim_start();
    let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let status: u16 = code.parse().map_err(|_| invalid())?;
    if !(100..=599).contains(&status) {
        return Err(invalid());
    }
    Ok((status, reason.trim().to_string()))
}

/// Split `bytes` at the blank line ending a header block.
///
/// Returns `(head, rest)`; a block starting with CRLF has an empty head.
pub(crate) fn split_head<'a>(divider: &PatternSearch, bytes: &'a [u8]) -> Option<(&'a [u8], &'a [u8])> {
    if bytes.starts_with(b"\r\n") {
        return Some((&[], &bytes[2..]));
    }
    let i = divider.search(bytes)?;
    Some((&bytes[..i], &bytes[i + divider.len()..]))
}

/// The `\r\n\r\n` header/body divider.
pub(crate) fn header_divider() -> PatternSearch {
    PatternSearch::new(&b"\r\n\r\n"[..])
}
