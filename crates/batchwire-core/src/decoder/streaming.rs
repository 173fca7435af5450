//! Streaming batch reply decoder.
//!
//! Wraps a [`PartTokenizer`] around the transport's chunk stream and yields
//! `(ContentId, Response)` pairs while the reply is still arriving. Each
//! response body is its own pull-based [`BodyStream`] reading from the same
//! shared parser, so at most one body is in flight:
//!
//! - [`StreamingDecoder::next_part`] waits until the previous body has been
//!   read to the end or dropped;
//! - a dropped body is drained internally so the parser stays aligned on the
//!   next delimiter.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::{oneshot, Mutex};

use crate::config::DecoderLimits;
use crate::error::{BatchError, DecodeError};
use crate::message::{BodyStream, ContentId, Headers, Response, ResponseBody};

use super::parse_boundary;
use super::tokenizer::{PartToken, PartTokenizer};

struct Shared {
    source: BodyStream,
    tokenizer: PartTokenizer,
    source_done: bool,
    /// Error hit while tokenizing; raised once the tokens queued before it are consumed.
    pending: Option<DecodeError>,
    failed: Option<DecodeError>,
    /// A body was handed out and its `BodyEnd` has not been consumed yet.
    body_open: bool,
}

impl Shared {
    /// Next token, pulling chunks from the source as needed.
    async fn next_token(&mut self) -> Result<Option<PartToken>, DecodeError> {
        loop {
            if let Some(err) = &self.failed {
                return Err(err.clone());
            }
            if let Some(token) = self.tokenizer.next_token() {
                return Ok(Some(token));
            }
            if let Some(err) = self.pending.take() {
                return Err(self.fail(err));
            }
            if self.source_done {
                return Ok(None);
            }
            let step = match self.source.next().await {
                Some(Ok(chunk)) => self.tokenizer.feed(&chunk),
                Some(Err(e)) => Err(DecodeError::Source(e.to_string())),
                None => {
                    self.source_done = true;
                    self.tokenizer.finish()
                }
            };
            if let Err(e) = step {
                tracing::error!(error = %e, state = %self.tokenizer.state(), "multipart decode failed");
                self.source_done = true;
                self.pending = Some(e);
            }
        }
    }

    async fn expect_token(&mut self, expected: &'static str) -> Result<PartToken, DecodeError> {
        match self.next_token().await? {
            Some(token) => Ok(token),
            None => Err(DecodeError::UnexpectedEnd { state: expected }),
        }
    }

    fn fail(&mut self, err: DecodeError) -> DecodeError {
        self.failed = Some(err.clone());
        err
    }
}

/// Head tokens of a part already taken off the tokenizer.
#[derive(Default)]
struct PartHead {
    content_id: Option<ContentId>,
    status: Option<(u16, String)>,
}

/// Incremental decoder for one batch reply. Single use.
///
/// [`next_part`](Self::next_part) is cancel safe: dropping it mid-await
/// loses nothing, the next call resumes where it stopped.
pub struct StreamingDecoder {
    shared: Arc<Mutex<Shared>>,
    body_done: Option<oneshot::Receiver<()>>,
    head: PartHead,
    finished: bool,
}

impl StreamingDecoder {
    /// Validate `content_type` and prepare to read `source`.
    pub fn new(content_type: &str, source: BodyStream, limits: DecoderLimits) -> Result<Self, DecodeError> {
        let boundary = parse_boundary(content_type)?;
        Ok(Self {
            shared: Arc::new(Mutex::new(Shared {
                source,
                tokenizer: PartTokenizer::new(&boundary, limits),
                source_done: false,
                pending: None,
                failed: None,
                body_open: false,
            })),
            body_done: None,
            head: PartHead::default(),
            finished: false,
        })
    }

    /// The next `(ContentId, Response)` pair, or `None` after the closing
    /// delimiter and a clean end of input.
    pub async fn next_part(&mut self) -> Result<Option<(ContentId, Response)>, DecodeError> {
        if self.finished {
            return Ok(None);
        }
        if let Some(done) = self.body_done.as_mut() {
            // resolves when the previous body ends or is dropped
            let _ = done.await;
            self.body_done = None;
        }

        let mut shared = self.shared.lock().await;
        while shared.body_open {
            match shared.expect_token("body").await? {
                PartToken::Body(_) => {}
                PartToken::BodyEnd { .. } => shared.body_open = false,
                other => return Err(shared.fail(unexpected("body", &other))),
            }
        }

        if self.head.content_id.is_none() {
            match shared.next_token().await? {
                None => {
                    self.finished = true;
                    return Ok(None);
                }
                Some(PartToken::PartHeaders { content_id, .. }) => self.head.content_id = Some(content_id),
                Some(other) => return Err(shared.fail(unexpected("part headers", &other))),
            }
        }
        if self.head.status.is_none() {
            match shared.expect_token("status line").await? {
                PartToken::StatusLine { status, status_text } => self.head.status = Some((status, status_text)),
                other => return Err(shared.fail(unexpected("status line", &other))),
            }
        }
        let headers: Headers = match shared.expect_token("headers").await? {
            PartToken::Headers(headers) => headers,
            other => return Err(shared.fail(unexpected("headers", &other))),
        };
        let head = std::mem::take(&mut self.head);
        let (Some(content_id), Some((status, status_text))) = (head.content_id, head.status) else {
            return Err(shared.fail(unexpected("status line", &PartToken::Headers(headers))));
        };
        shared.body_open = true;
        drop(shared);

        tracing::trace!(%content_id, status, "decoded batch part");
        let (tx, rx) = oneshot::channel();
        self.body_done = Some(rx);
        let body = embedded_body(Arc::clone(&self.shared), tx);
        let response = Response::new(status, status_text, headers, ResponseBody::Stream(body));
        Ok(Some((content_id, response)))
    }

    /// Decode every part, buffering each body.
    pub async fn collect(mut self) -> Result<Vec<(ContentId, Response)>, BatchError> {
        let mut out = Vec::new();
        while let Some((id, response)) = self.next_part().await? {
            out.push((id, response.buffered().await?));
        }
        Ok(out)
    }
}

fn unexpected(expected: &'static str, found: &PartToken) -> DecodeError {
    DecodeError::UnexpectedToken {
        expected,
        found: found.kind(),
    }
}

/// Holds the decoder alive for one body; dropping it releases `next_part`.
struct BodyReader {
    shared: Arc<Mutex<Shared>>,
    _done: oneshot::Sender<()>,
}

enum BodyStep {
    Chunk(bytes::Bytes),
    End,
    Failed(DecodeError),
}

fn embedded_body(shared: Arc<Mutex<Shared>>, done: oneshot::Sender<()>) -> BodyStream {
    let reader = BodyReader { shared, _done: done };
    Box::pin(stream::unfold(Some(reader), |reader| async move {
        let reader = reader?;
        let step = {
            let mut shared = reader.shared.lock().await;
            match shared.next_token().await {
                Ok(Some(PartToken::Body(bytes))) => BodyStep::Chunk(bytes),
                Ok(Some(PartToken::BodyEnd { .. })) => {
                    shared.body_open = false;
                    BodyStep::End
                }
                Ok(Some(other)) => BodyStep::Failed(shared.fail(unexpected("body", &other))),
                Ok(None) => BodyStep::Failed(shared.fail(DecodeError::UnexpectedEnd { state: "body" })),
                Err(e) => BodyStep::Failed(e),
            }
        };
        match step {
            BodyStep::Chunk(bytes) => Some((Ok(bytes), Some(reader))),
            BodyStep::End => None,
            BodyStep::Failed(e) => Some((Err(BatchError::Decode(e)), None)),
        }
    }))
}
