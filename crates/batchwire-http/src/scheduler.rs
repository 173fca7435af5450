//! Auto-batching scheduler: coalesce requests issued within one window.
//!
//! Every [`BatchScheduler::fetch`] lands in the open group. When the group's
//! window closes, its entries are sent as one `multipart/mixed` POST to the
//! configured endpoint, and the reply is demultiplexed back to each caller
//! by Content-ID. A lone entry skips the batch envelope unless
//! `always_batch` is set.
//!
//! # Usage
//! ```rust,no_run
//! use batchwire_core::message::Request;
//! use batchwire_http::{BatchConfig, BatchScheduler, ReqwestTransport};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), batchwire_core::BatchError> {
//! let transport = Arc::new(ReqwestTransport::default_for("api")?);
//! let scheduler = BatchScheduler::new(transport, BatchConfig::new("https://api.example.com/batch"));
//! let a = scheduler.fetch(Request::get("https://api.example.com/users/1")?, None);
//! let b = scheduler.fetch(Request::get("https://api.example.com/users/2")?, None);
//! let (a, b) = futures::join!(a, b);
//! # Ok(()) }
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::oneshot;
use url::Url;

use batchwire_core::cancel::{CancelGuard, CancelToken};
use batchwire_core::decoder::{is_multipart_mixed, BufferedDecoder, StreamingDecoder};
use batchwire_core::encoder::BatchEncoder;
use batchwire_core::error::BatchError;
use batchwire_core::message::{Body, ContentId, Request, Response};
use batchwire_core::transport::HttpTransport;

use crate::config::{BatchConfig, DecoderMode};

type Reply = oneshot::Sender<Result<Response, BatchError>>;

/// Identifies one [`BatchScheduler::fetch`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestHandle(u64);

impl RequestHandle {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct PendingRequest {
    request: Request,
    reply: Reply,
    cancel: Option<CancelToken>,
    /// Pre-dispatch subscription on `cancel`.
    guard: Option<CancelGuard>,
}

struct BatchGroup {
    id: u64,
    entries: IndexMap<RequestHandle, PendingRequest>,
    cancel: CancelToken,
    /// Fired by the first caller to await (or drop) its response; closes a zero window.
    flush: CancelToken,
}

#[derive(Default)]
struct SchedulerState {
    /// The group whose window is still open.
    queue: Option<BatchGroup>,
    /// Most recent group, open or in flight.
    current: Option<(u64, CancelToken)>,
}

struct SchedulerInner {
    transport: Arc<dyn HttpTransport>,
    config: BatchConfig,
    state: Mutex<SchedulerState>,
    next_handle: AtomicU64,
    next_group: AtomicU64,
}

/// Batches requests issued within `config.window()` into one exchange.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct BatchScheduler {
    inner: Arc<SchedulerInner>,
}

impl BatchScheduler {
    pub fn new(transport: Arc<dyn HttpTransport>, config: BatchConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                transport,
                config,
                state: Mutex::new(SchedulerState::default()),
                next_handle: AtomicU64::new(1),
                next_group: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    /// Queue `request` into the open group, opening one if needed.
    ///
    /// Must be called from within a Tokio runtime. `cancel` rejects just this
    /// entry with [`BatchError::Cancelled`].
    ///
    /// With a zero window the group closes once the calling task yields. On a
    /// multi-thread runtime that is when any caller first polls or drops its
    /// [`PendingResponse`].
    pub fn fetch(&self, request: Request, cancel: Option<CancelToken>) -> PendingResponse {
        let handle = RequestHandle(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();

        if cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            let _ = tx.send(Err(BatchError::Cancelled));
            return PendingResponse { handle, rx, flush: None };
        }

        let (opened, flush) = {
            let mut state = self.inner.lock();
            let opened = if state.queue.is_none() {
                let id = self.inner.next_group.fetch_add(1, Ordering::Relaxed);
                let token = CancelToken::new();
                state.current = Some((id, token.clone()));
                state.queue = Some(BatchGroup {
                    id,
                    entries: IndexMap::new(),
                    cancel: token.clone(),
                    flush: CancelToken::new(),
                });
                Some((id, token))
            } else {
                None
            };
            let mut flush = None;
            if let Some(group) = state.queue.as_mut() {
                flush = Some(group.flush.clone());
                group.entries.insert(
                    handle,
                    PendingRequest {
                        request,
                        reply: tx,
                        cancel: cancel.clone(),
                        guard: None,
                    },
                );
            }
            (opened, flush)
        };
        let pending = PendingResponse { handle, rx, flush: flush.clone() };

        if let (Some((group, token)), Some(flush)) = (opened, flush) {
            tracing::debug!(group, "opened batch window");
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let window = inner.config.window();
                if window.is_zero() {
                    // On a worker pool the window task can run while the caller is
                    // still enqueuing, so wait until the caller awaits a response.
                    match Handle::current().runtime_flavor() {
                        RuntimeFlavor::CurrentThread => tokio::task::yield_now().await,
                        _ => tokio::select! {
                            _ = flush.cancelled() => {}
                            _ = token.cancelled() => {}
                        },
                    }
                } else {
                    tokio::select! {
                        _ = tokio::time::sleep(window) => {}
                        _ = token.cancelled() => {}
                    }
                }
                inner.dispatch(group).await;
            });
        }

        if let Some(token) = cancel {
            let weak: Weak<SchedulerInner> = Arc::downgrade(&self.inner);
            let guard = token.on_cancel(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.cancel_queued(handle);
                }
            });
            let mut state = self.inner.lock();
            if let Some(entry) = state.queue.as_mut().and_then(|g| g.entries.get_mut(&handle)) {
                entry.guard = Some(guard);
            }
        }
        pending
    }

    /// Abort the most recent group, whether its window is open or its
    /// exchange is in flight. No-op when there is none.
    pub fn cancel(&self) {
        let token = self.inner.lock().current.as_ref().map(|(_, token)| token.clone());
        if let Some(token) = token {
            tracing::warn!("cancelling current batch group");
            token.cancel();
        }
    }

    /// Entries waiting in the open window.
    pub fn pending(&self) -> usize {
        self.inner
            .lock()
            .queue
            .as_ref()
            .map(|g| g.entries.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl HttpTransport for BatchScheduler {
    async fn execute(&self, request: Request, cancel: CancelToken) -> Result<Response, BatchError> {
        self.fetch(request, Some(cancel)).await
    }

    fn name(&self) -> &str {
        &self.inner.config.endpoint
    }
}

/// Settles with the response for one [`BatchScheduler::fetch`].
#[must_use = "the request is queued regardless; await to observe its response"]
pub struct PendingResponse {
    handle: RequestHandle,
    rx: oneshot::Receiver<Result<Response, BatchError>>,
    flush: Option<CancelToken>,
}

impl PendingResponse {
    pub fn handle(&self) -> RequestHandle {
        self.handle
    }
}

impl Future for PendingResponse {
    type Output = Result<Response, BatchError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(flush) = self.flush.take() {
            flush.cancel();
        }
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|settled| settled.unwrap_or(Err(BatchError::SchedulerClosed)))
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if let Some(flush) = self.flush.take() {
            flush.cancel();
        }
    }
}

/// A dispatched entry waiting for its part of the reply.
struct Waiter {
    handle: RequestHandle,
    reply: Reply,
}

type Demux = Arc<Mutex<IndexMap<ContentId, Waiter>>>;

fn lock_demux(demux: &Demux) -> MutexGuard<'_, IndexMap<ContentId, Waiter>> {
    match demux.lock() {
        Ok(map) => map,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SchedulerInner {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Drop a not-yet-dispatched entry whose token fired.
    fn cancel_queued(&self, handle: RequestHandle) {
        let removed = {
            let mut state = self.lock();
            state.queue.as_mut().and_then(|g| g.entries.shift_remove(&handle))
        };
        if let Some(entry) = removed {
            tracing::warn!(%handle, "request cancelled before dispatch");
            let _ = entry.reply.send(Err(BatchError::Cancelled));
        }
    }

    /// Forget `group` as the current one once it has settled.
    fn finish(&self, group: u64) {
        let mut state = self.lock();
        if state.current.as_ref().is_some_and(|(id, _)| *id == group) {
            state.current = None;
        }
    }

    async fn dispatch(&self, group: u64) {
        let taken = {
            let mut state = self.lock();
            match state.queue.take() {
                Some(g) if g.id == group => Some(g),
                other => {
                    state.queue = other;
                    None
                }
            }
        };
        let Some(BatchGroup { entries, cancel, .. }) = taken else {
            return;
        };

        let mut live = Vec::with_capacity(entries.len());
        for (handle, mut entry) in entries {
            drop(entry.guard.take());
            let cancelled = cancel.is_cancelled() || entry.cancel.as_ref().is_some_and(CancelToken::is_cancelled);
            if cancelled {
                let _ = entry.reply.send(Err(BatchError::Cancelled));
            } else {
                live.push((handle, entry));
            }
        }

        match live.len() {
            0 => tracing::debug!(group, "nothing left to dispatch"),
            1 if !self.config.always_batch => {
                if let Some((handle, entry)) = live.pop() {
                    self.dispatch_single(group, handle, entry, cancel).await;
                }
            }
            _ => self.dispatch_batch(group, live, cancel).await,
        }
        self.finish(group);
    }

    async fn dispatch_single(&self, group: u64, handle: RequestHandle, entry: PendingRequest, cancel: CancelToken) {
        tracing::debug!(group, %handle, "dispatching single request directly");
        let PendingRequest {
            request,
            reply,
            cancel: own,
            ..
        } = entry;
        let _link = own.map(|token| {
            let group_token = cancel.clone();
            token.on_cancel(move || group_token.cancel())
        });
        let result = self.transport.execute(request, cancel).await;
        if let Err(e) = &result {
            tracing::error!(group, %handle, error = %e, "direct request failed");
        }
        let _ = reply.send(result);
    }

    async fn dispatch_batch(&self, group: u64, live: Vec<(RequestHandle, PendingRequest)>, cancel: CancelToken) {
        let entries = live.len();
        let mut encoder = BatchEncoder::new();
        let mut waiters = IndexMap::with_capacity(entries);
        let mut tokens = Vec::new();
        for (handle, entry) in live {
            let content_id = encoder.add_request(entry.request);
            if let Some(token) = entry.cancel {
                tokens.push((content_id.clone(), token));
            }
            waiters.insert(
                content_id,
                Waiter {
                    handle,
                    reply: entry.reply,
                },
            );
        }
        let demux: Demux = Arc::new(Mutex::new(waiters));

        let _guards: Vec<CancelGuard> = tokens
            .into_iter()
            .map(|(content_id, token)| {
                let demux = Arc::clone(&demux);
                let group_token = cancel.clone();
                token.on_cancel(move || reject_cancelled(&demux, &content_id, &group_token))
            })
            .collect();

        tracing::debug!(group, entries, boundary = encoder.boundary(), "dispatching batch");
        let request = match self.batch_request(encoder) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(group, error = %e, "failed to build batch request");
                reject_all(&demux, &e);
                return;
            }
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(BatchError::Cancelled),
            result = self.exchange(group, request, &demux, cancel.clone()) => result,
        };
        match outcome {
            Ok(()) => {
                let leftovers: Vec<(ContentId, Waiter)> = lock_demux(&demux).drain(..).collect();
                for (content_id, waiter) in leftovers {
                    tracing::warn!(group, %content_id, handle = %waiter.handle, "no response part for request");
                    let _ = waiter.reply.send(Err(BatchError::ResponseCountMismatch {
                        content_id: content_id.to_string(),
                    }));
                }
            }
            Err(e) => {
                if e.is_cancelled() {
                    tracing::warn!(group, "batch group cancelled");
                } else {
                    tracing::error!(group, error = %e, "batch exchange failed");
                }
                reject_all(&demux, &e);
            }
        }
    }

    fn batch_request(&self, encoder: BatchEncoder) -> Result<Request, BatchError> {
        let url = Url::parse(&self.config.endpoint)
            .map_err(|e| BatchError::Config(format!("invalid endpoint {}: {e}", self.config.endpoint)))?;
        let headers = encoder.headers(Some(self.config.base_headers()));
        let body = encoder.into_stream()?;
        let mut request = Request::new("POST", url);
        request.headers = headers;
        request.body = Body::Stream(body);
        Ok(request)
    }

    /// Send the batch and route every decoded part to its waiter.
    async fn exchange(&self, group: u64, request: Request, demux: &Demux, cancel: CancelToken) -> Result<(), BatchError> {
        let response = self.transport.execute(request, cancel).await?;
        let content_type = response.content_type().unwrap_or("").to_string();

        if !is_multipart_mixed(&content_type) {
            tracing::warn!(
                group,
                status = response.status,
                content_type = %content_type,
                "batch reply is not multipart, sharing it with every entry"
            );
            let response = response.buffered().await?;
            let waiters: Vec<(ContentId, Waiter)> = lock_demux(demux).drain(..).collect();
            for (_, waiter) in waiters {
                let copy = response
                    .try_clone()
                    .ok_or_else(|| BatchError::Body("reply body was not buffered".into()));
                let _ = waiter.reply.send(copy);
            }
            return Ok(());
        }

        let limits = self.config.limits;
        match self.config.decoder {
            DecoderMode::Streaming => {
                let mut decoder = StreamingDecoder::new(&content_type, response.into_stream(), limits)?;
                while let Some((content_id, part)) = decoder.next_part().await? {
                    // callers settle as each part completes; holding the body
                    // open would stall every later part behind it
                    let part = part.buffered().await?;
                    deliver(group, demux, &content_id, part);
                }
            }
            DecoderMode::Buffered => {
                let body = response.bytes().await?;
                let parts = BufferedDecoder::new(&content_type, body)?.into_responses()?;
                for (content_id, part) in parts {
                    deliver(group, demux, &content_id, part);
                }
            }
        }
        Ok(())
    }
}

/// Resolve the waiter `wire_id` refers to: exact id first, then any
/// encoded id contained in it.
fn deliver(group: u64, demux: &Demux, wire_id: &ContentId, part: Response) {
    let waiter = {
        let mut map = lock_demux(demux);
        match map.shift_remove(wire_id) {
            Some(waiter) => Some(waiter),
            None => {
                let key = map.keys().find(|id| id.matches(wire_id)).cloned();
                key.and_then(|k| map.shift_remove(&k))
            }
        }
    };
    match waiter {
        Some(waiter) => {
            tracing::trace!(group, content_id = %wire_id, status = part.status, "resolved batch entry");
            let _ = waiter.reply.send(Ok(part));
        }
        None => tracing::warn!(group, content_id = %wire_id, "dropping unmatched response part"),
    }
}

fn reject_cancelled(demux: &Demux, content_id: &ContentId, group: &CancelToken) {
    let (waiter, now_empty) = {
        let mut map = lock_demux(demux);
        let waiter = map.shift_remove(content_id);
        (waiter, map.is_empty())
    };
    if let Some(waiter) = waiter {
        tracing::warn!(%content_id, handle = %waiter.handle, "batched request cancelled");
        let _ = waiter.reply.send(Err(BatchError::Cancelled));
        if now_empty {
            group.cancel();
        }
    }
}

fn reject_all(demux: &Demux, err: &BatchError) {
    let waiters: Vec<(ContentId, Waiter)> = lock_demux(demux).drain(..).collect();
    for (_, waiter) in waiters {
        let _ = waiter.reply.send(Err(err.clone()));
    }
}
