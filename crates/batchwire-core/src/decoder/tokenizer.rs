//! Sans-io tokenizer for `multipart/mixed` batch replies.
//!
//! Bytes are pushed in with [`PartTokenizer::feed`] in arbitrarily sized
//! chunks; typed [`PartToken`]s come out of [`PartTokenizer::next_token`].
//! One `MultipartHeader → StatusLine → Header → Body` cycle runs per part:
//!
//! ```text
//! Preamble ──▶ MultipartHeader ──▶ StatusLine ──▶ Header ──▶ Body ─┬─▶ MultipartHeader
//!     │                                                            └─▶ Epilogue ──▶ Done
//!     └─ (closing delimiter first) ──▶ Epilogue
//! ```
//!
//! Every state is bounded by a [`DecoderLimits`] entry so hostile input cannot
//! grow the buffer without limit. Body bytes are released as soon as they
//! cannot be the start of `\r\n--<boundary>`; only the KMP residual is held.

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};

use crate::config::DecoderLimits;
use crate::error::DecodeError;
use crate::message::{is_bodyless_status, ContentId, Headers};
use crate::pattern::PatternSearch;

use super::{header_divider, parse_header_block, parse_status_line, part_content_id};

/// Seeded ahead of the input so a delimiter on the very first line matches
/// like any other line-initial delimiter.
const LINE_START: &[u8] = b"\r\n";

/// Where the tokenizer is within the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    /// Discarding bytes before the first delimiter.
    Preamble,
    /// Reading a part's own headers (`Content-ID`, `Content-Type`).
    MultipartHeader,
    /// Reading the embedded `HTTP/1.1 <code> <reason>` line.
    StatusLine,
    /// Reading the embedded response headers.
    Header,
    /// Streaming the embedded response body.
    Body,
    /// Discarding bytes after the closing delimiter.
    Epilogue,
    /// Input finished cleanly.
    Done,
}

impl DecoderState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Preamble => "preamble",
            Self::MultipartHeader => "multipart header",
            Self::StatusLine => "status line",
            Self::Header => "header",
            Self::Body => "body",
            Self::Epilogue => "epilogue",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for DecoderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed sub-chunk of the reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartToken {
    /// Validated part headers of an `application/http` part.
    PartHeaders { content_id: ContentId, headers: Headers },
    StatusLine { status: u16, status_text: String },
    /// Embedded response headers.
    Headers(Headers),
    /// A slice of the embedded response body.
    Body(Bytes),
    /// End of the current body; `last` when the closing delimiter followed.
    BodyEnd { last: bool },
}

impl PartToken {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PartHeaders { .. } => "part headers",
            Self::StatusLine { .. } => "status line",
            Self::Headers(_) => "headers",
            Self::Body(_) => "body chunk",
            Self::BodyEnd { .. } => "end of body",
        }
    }
}

/// Incremental multipart tokenizer. See the module docs.
#[derive(Debug)]
pub struct PartTokenizer {
    state: DecoderState,
    limits: DecoderLimits,
    buf: BytesMut,
    /// `\r\n--<boundary>`; the preamble is searched behind a virtual leading CRLF.
    delimiter: PatternSearch,
    divider: PatternSearch,
    /// Bytes dropped so far in the current discard state.
    discarded: usize,
    /// Prefix of `buf` already scanned for the current terminator.
    scanned: usize,
    status: u16,
    tokens: VecDeque<PartToken>,
}

impl PartTokenizer {
    pub fn new(boundary: &str, limits: DecoderLimits) -> Self {
        Self {
            state: DecoderState::Preamble,
            limits,
            buf: BytesMut::from(LINE_START),
            delimiter: PatternSearch::new(format!("\r\n--{boundary}")),
            divider: header_divider(),
            discarded: 0,
            scanned: 0,
            status: 0,
            tokens: VecDeque::new(),
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Pop the next decoded token.
    pub fn next_token(&mut self) -> Option<PartToken> {
        self.tokens.pop_front()
    }

    /// Push a chunk of input and tokenize as far as possible.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<(), DecodeError> {
        self.buf.extend_from_slice(chunk);
        while self.step()? {}
        Ok(())
    }

    /// Signal end of input. Fails unless the closing delimiter was seen.
    pub fn finish(&mut self) -> Result<(), DecodeError> {
        match self.state {
            DecoderState::Epilogue | DecoderState::Done => {
                self.transition(DecoderState::Done);
                Ok(())
            }
            DecoderState::Preamble => Err(DecodeError::BoundaryNotFound),
            other => Err(DecodeError::UnexpectedEnd { state: other.name() }),
        }
    }

    /// Run one state; `Ok(true)` if progress was made and another step may succeed.
    fn step(&mut self) -> Result<bool, DecodeError> {
        match self.state {
            DecoderState::Preamble => self.step_preamble(),
            DecoderState::MultipartHeader => self.step_part_headers(),
            DecoderState::StatusLine => self.step_status_line(),
            DecoderState::Header => self.step_headers(),
            DecoderState::Body => self.step_body(),
            DecoderState::Epilogue | DecoderState::Done => self.step_epilogue(),
        }
    }

    fn transition(&mut self, next: DecoderState) {
        tracing::trace!(from = %self.state, to = %next, "multipart decoder state");
        self.state = next;
        self.scanned = 0;
        self.discarded = 0;
    }

    fn step_preamble(&mut self) -> Result<bool, DecodeError> {
        let Some(i) = self.delimiter.search(&self.buf) else {
            let keep = self.delimiter.residual(&self.buf);
            let drop = self.buf.len() - keep;
            self.discard(drop);
            self.check_preamble()?;
            return Ok(false);
        };

        self.discard(i);
        self.check_preamble()?;
        let end = self.delimiter.len();
        if self.buf.len() < end + 2 {
            return Ok(false);
        }
        let lookahead = [self.buf[end], self.buf[end + 1]];
        match &lookahead {
            b"\r\n" => {
                self.buf.advance(end + 2);
                self.transition(DecoderState::MultipartHeader);
            }
            b"--" => {
                // closing delimiter before any part
                self.buf.advance(end + 2);
                self.transition(DecoderState::Epilogue);
            }
            _ => {
                // `--<boundary>` was a prefix of some longer token
                self.discard(1);
            }
        }
        Ok(true)
    }

    fn check_preamble(&self) -> Result<(), DecodeError> {
        let limit = self.limits.max_discard_size;
        if self.discarded.saturating_sub(LINE_START.len()) > limit {
            return Err(DecodeError::PreambleTooLarge { limit });
        }
        Ok(())
    }

    fn step_part_headers(&mut self) -> Result<bool, DecodeError> {
        let Some(block) = self.take_head_block()? else {
            return Ok(false);
        };
        let headers = parse_header_block(&block);
        let content_id = part_content_id(&headers)?;
        self.tokens.push_back(PartToken::PartHeaders { content_id, headers });
        self.transition(DecoderState::StatusLine);
        Ok(true)
    }

    fn step_status_line(&mut self) -> Result<bool, DecodeError> {
        let limit = self.limits.max_status_line_size;
        let from = self.scanned;
        let Some(pos) = self.buf[from..].iter().position(|&b| b == b'\n') else {
            self.scanned = self.buf.len();
            if self.buf.len() > limit {
                return Err(DecodeError::StatusLineTooLarge { limit });
            }
            return Ok(false);
        };
        let nl = from + pos;
        if nl > limit {
            return Err(DecodeError::StatusLineTooLarge { limit });
        }
        let line = self.buf.split_to(nl + 1);
        let (status, status_text) = parse_status_line(&String::from_utf8_lossy(&line))?;
        self.status = status;
        self.tokens
            .push_back(PartToken::StatusLine { status, status_text });
        self.transition(DecoderState::Header);
        Ok(true)
    }

    fn step_headers(&mut self) -> Result<bool, DecodeError> {
        let Some(block) = self.take_head_block()? else {
            return Ok(false);
        };
        self.tokens
            .push_back(PartToken::Headers(parse_header_block(&block)));
        self.transition(DecoderState::Body);
        Ok(true)
    }

    fn step_body(&mut self) -> Result<bool, DecodeError> {
        if self.buf.is_empty() {
            return Ok(false);
        }
        let dlen = self.delimiter.len();
        let Some(i) = self.delimiter.search(&self.buf) else {
            let keep = self.delimiter.residual(&self.buf);
            let release = self.buf.len() - keep;
            if release > 0 {
                let bytes = self.buf.split_to(release).freeze();
                self.emit_body(bytes)?;
            }
            if keep > self.limits.max_chunk_body_size {
                return Err(DecodeError::BodyChunkTooLarge {
                    limit: self.limits.max_chunk_body_size,
                });
            }
            return Ok(false);
        };

        if i > 0 {
            let bytes = self.buf.split_to(i).freeze();
            self.emit_body(bytes)?;
        }
        if self.buf.len() < dlen + 2 {
            return Ok(false);
        }
        let lookahead = [self.buf[dlen], self.buf[dlen + 1]];
        match &lookahead {
            b"\r\n" => {
                self.buf.advance(dlen + 2);
                self.tokens.push_back(PartToken::BodyEnd { last: false });
                self.transition(DecoderState::MultipartHeader);
            }
            b"--" => {
                self.buf.advance(dlen + 2);
                self.tokens.push_back(PartToken::BodyEnd { last: true });
                self.transition(DecoderState::Epilogue);
            }
            _ => {
                // delimiter-like text inside the body
                let byte = self.buf.split_to(1).freeze();
                self.emit_body(byte)?;
            }
        }
        Ok(true)
    }

    fn step_epilogue(&mut self) -> Result<bool, DecodeError> {
        let n = self.buf.len();
        self.discard(n);
        let limit = self.limits.max_discard_size;
        if self.discarded > limit {
            return Err(DecodeError::EpilogueTooLarge { limit });
        }
        Ok(false)
    }

    fn discard(&mut self, n: usize) {
        self.buf.advance(n);
        self.discarded += n;
    }

    /// Take a header block up to its blank line, enforcing `max_header_size`.
    fn take_head_block(&mut self) -> Result<Option<BytesMut>, DecodeError> {
        let limit = self.limits.max_header_size;
        if self.buf.starts_with(b"\r\n") {
            self.buf.advance(2);
            return Ok(Some(BytesMut::new()));
        }
        let m = self.divider.len();
        let from = self.scanned.saturating_sub(m - 1);
        match self.divider.search_from(&self.buf, from) {
            Some(i) => {
                if i > limit {
                    return Err(DecodeError::HeaderTooLarge { limit });
                }
                let block = self.buf.split_to(i);
                self.buf.advance(m);
                Ok(Some(block))
            }
            None => {
                self.scanned = self.buf.len();
                if self.buf.len() > limit + m {
                    return Err(DecodeError::HeaderTooLarge { limit });
                }
                Ok(None)
            }
        }
    }

    fn emit_body(&mut self, mut bytes: Bytes) -> Result<(), DecodeError> {
        if bytes.is_empty() {
            return Ok(());
        }
        if is_bodyless_status(self.status) {
            return Err(DecodeError::NonEmptyBody { status: self.status });
        }
        let max = self.limits.max_chunk_body_size.max(1);
        while bytes.len() > max {
            self.tokens.push_back(PartToken::Body(bytes.split_to(max)));
        }
        self.tokens.push_back(PartToken::Body(bytes));
        Ok(())
    }
}
