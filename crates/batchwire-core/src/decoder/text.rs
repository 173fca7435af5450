//! Line-oriented decoder for replies only available as a string.
//!
//! Accepts both CRLF and bare LF line endings. Body bytes are kept exactly,
//! except the line break that precedes the next delimiter.

use bytes::Bytes;

use crate::error::DecodeError;
use crate::message::{ContentId, Response, ResponseBody};

use super::{is_http_part, parse_boundary, parse_header_lines, parse_status_line};

enum Line {
    Delimiter,
    Close,
    Other,
}

/// Decode a whole `multipart/mixed` reply held as text.
pub fn decode_text(content_type: &str, text: &str) -> Result<Vec<(ContentId, Response)>, DecodeError> {
    let boundary = parse_boundary(content_type)?;
    let opening = format!("--{boundary}");
    let classify = |line: &str| {
        let line = line.trim_end_matches(['\r', '\n']).trim_end_matches([' ', '\t']);
        match line.strip_prefix(opening.as_str()) {
            Some("") => Line::Delimiter,
            Some("--") => Line::Close,
            _ => Line::Other,
        }
    };

    let mut lines = text.split_inclusive('\n');
    loop {
        match lines.next().map(classify) {
            Some(Line::Delimiter) => break,
            Some(Line::Close) => return Ok(Vec::new()),
            Some(Line::Other) => continue,
            None => return Err(DecodeError::BoundaryNotFound),
        }
    }

    let mut out = Vec::new();
    let mut part = String::new();
    for line in lines {
        match classify(line) {
            Line::Other => part.push_str(line),
            kind => {
                let content = strip_eol(&part);
                if let Some(decoded) = decode_part(content)? {
                    out.push(decoded);
                }
                part.clear();
                if let Line::Close = kind {
                    tracing::debug!(parts = out.len(), "decoded text batch reply");
                    return Ok(out);
                }
            }
        }
    }
    Err(DecodeError::NoClosingBoundary)
}

fn decode_part(content: &str) -> Result<Option<(ContentId, Response)>, DecodeError> {
    let (head, rest) = take_block(content);
    let headers = parse_header_lines(head);
    if !is_http_part(&headers) {
        return Ok(None);
    }
    let content_id = headers
        .get("content-id")
        .and_then(ContentId::from_header)
        .ok_or(DecodeError::MissingContentId)?;

    let (status_line, rest) = match rest.split_once('\n') {
        Some((line, rest)) => (line, rest),
        None => (rest, ""),
    };
    let (status, status_text) = parse_status_line(status_line)?;
    let (head, body) = take_block(rest);
    let response = Response::new(
        status,
        status_text,
        parse_header_lines(head),
        ResponseBody::Full(Bytes::copy_from_slice(body.as_bytes())),
    );
    Ok(Some((content_id, response)))
}

/// Lines up to the first blank line, and everything after it.
fn take_block(text: &str) -> (Vec<&str>, &str) {
    let mut lines = Vec::new();
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        offset += line.len();
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return (lines, &text[offset..]);
        }
        lines.push(line);
    }
    (lines, "")
}

fn strip_eol(s: &str) -> &str {
    s.strip_suffix("\r\n")
        .or_else(|| s.strip_suffix('\n'))
        .unwrap_or(s)
}
