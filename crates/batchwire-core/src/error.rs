//! Error types for batching, transport and multipart decoding.

use thiserror::Error;

/// Fatal errors raised while parsing a `multipart/mixed` batch reply.
///
/// Any of these aborts the whole group: every caller still waiting on the
/// batch is rejected with the same error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Outer content type is not `multipart/mixed`.
    #[error("expected multipart/mixed content type, got {0:?}")]
    NotMultipart(String),

    /// `boundary=` parameter missing from the outer content type.
    #[error("multipart content type has no boundary parameter")]
    MissingBoundary,

    /// Input ended before any boundary delimiter was seen.
    #[error("no multipart boundary found in body")]
    BoundaryNotFound,

    /// Parts were found but the closing `--boundary--` never appeared.
    #[error("multipart body has no closing boundary")]
    NoClosingBoundary,

    #[error("multipart preamble too large (limit {limit} bytes)")]
    PreambleTooLarge { limit: usize },

    #[error("header block too large (limit {limit} bytes)")]
    HeaderTooLarge { limit: usize },

    #[error("status line too large (limit {limit} bytes)")]
    StatusLineTooLarge { limit: usize },

    #[error("unflushed body span too large (limit {limit} bytes)")]
    BodyChunkTooLarge { limit: usize },

    #[error("multipart epilogue too large (limit {limit} bytes)")]
    EpilogueTooLarge { limit: usize },

    /// Embedded status line is not `HTTP/x.y <code> [reason]`.
    #[error("malformed status line: {0:?}")]
    InvalidStatusLine(String),

    /// Part `Content-Type` missing or not `application/http`.
    #[error("part content type must be application/http, got {0:?}")]
    InvalidPartContentType(Option<String>),

    /// Part has no usable `Content-ID` header.
    #[error("part is missing a Content-ID header")]
    MissingContentId,

    /// A bodyless status (1xx, 204, 205, 304) carried body bytes.
    #[error("status {status} must not carry a body")]
    NonEmptyBody { status: u16 },

    /// Tokenizer produced a token the driver did not expect in its state.
    #[error("unexpected {found} while waiting for {expected}")]
    UnexpectedToken {
        expected: &'static str,
        found: &'static str,
    },

    /// Input ended in the middle of a part.
    #[error("multipart stream ended unexpectedly in {state} state")]
    UnexpectedEnd { state: &'static str },

    /// The underlying byte stream failed.
    #[error("multipart source error: {0}")]
    Source(String),

    /// A request/response head could not be parsed.
    #[error("malformed embedded message: {0}")]
    InvalidMessage(String),
}

/// Errors surfaced to callers of the batching client.
#[derive(Debug, Clone, Error)]
pub enum BatchError {
    /// Transport failed before any response arrived.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The caller's token or the whole group was cancelled.
    #[error("request cancelled")]
    Cancelled,

    /// The batch reply did not contain a part for this request.
    #[error("response count mismatch: no part for {content_id}")]
    ResponseCountMismatch { content_id: String },

    /// The batch reply could not be decoded.
    #[error("batch decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Reading a response or request body failed.
    #[error("body error: {0}")]
    Body(String),

    /// Response body could not be deserialized.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Request could not be turned into a wire message.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The scheduler dropped the request without settling it.
    #[error("batch scheduler dropped the request")]
    SchedulerClosed,
}

impl BatchError {
    /// Returns `true` if this error came from a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` if the batch reply itself was malformed.
    pub fn is_decode_error(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}

impl From<serde_json::Error> for BatchError {
    fn from(e: serde_json::Error) -> Self {
        Self::Deserialization(e.to_string())
    }
}
