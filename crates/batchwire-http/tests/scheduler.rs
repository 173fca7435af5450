//! Scheduler integration tests against an in-process batch endpoint.
//!
//! `MockEndpoint` implements `HttpTransport`: batch requests are unpacked
//! with `decode_batch_request` and answered with `BatchResponseBuilder`,
//! streamed back in small chunks so the decoder sees fragmented input.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use serde_json::{json, Value};
use url::Url;

use batchwire_core::message::collect_stream;
use batchwire_core::{
    decode_batch_request, BatchError, BatchResponseBuilder, CancelToken, DecodeError, Headers, HttpTransport,
    Request, Response, ResponseBody,
};
use batchwire_http::{BatchConfig, BatchScheduler, DecoderMode};

// ─── Helpers ──────────────────────────────────────────────────────────────────

const ENDPOINT: &str = "https://api.test/batch";

#[derive(Debug, Clone, Copy)]
enum Mode {
    /// Answer every part, optionally in reverse order or omitting the last.
    Multipart { reverse: bool, skip_last: bool },
    /// Plain 500 JSON reply instead of multipart.
    PlainError,
    /// Every part is `304 Not Modified` with an empty body.
    NotModified,
    /// Multipart reply preceded by an oversized preamble.
    PreambleFlood(usize),
    /// Transport failure before any response.
    Fail,
    /// Never answer; wait for cancellation.
    Hang,
}

struct MockEndpoint {
    mode: Mode,
    calls: AtomicUsize,
    batched: AtomicUsize,
    /// Token handed to the last hanging exchange.
    hung: Mutex<Option<CancelToken>>,
    outer_headers: Mutex<Option<Headers>>,
}

impl MockEndpoint {
    fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            calls: AtomicUsize::new(0),
            batched: AtomicUsize::new(0),
            hung: Mutex::new(None),
            outer_headers: Mutex::new(None),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn batched(&self) -> usize {
        self.batched.load(Ordering::SeqCst)
    }

    fn aborted(&self) -> bool {
        self.hung.lock().unwrap().as_ref().is_some_and(CancelToken::is_cancelled)
    }
}

fn json_headers() -> Headers {
    [("Content-Type", "application/json")].into_iter().collect()
}

/// Response whose body arrives in `size`-byte chunks.
fn chunked_response(status: u16, content_type: &str, body: Bytes, size: usize) -> Response {
    let chunks: Vec<Result<Bytes, BatchError>> = body
        .chunks(size)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    let headers: Headers = [("Content-Type", content_type)].into_iter().collect();
    Response::new(status, "", headers, ResponseBody::Stream(Box::pin(stream::iter(chunks))))
}

#[async_trait]
impl HttpTransport for MockEndpoint {
    async fn execute(&self, request: Request, cancel: CancelToken) -> Result<Response, BatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            Mode::Hang => {
                *self.hung.lock().unwrap() = Some(cancel.clone());
                cancel.cancelled().await;
                return Err(BatchError::Cancelled);
            }
            Mode::Fail => return Err(BatchError::Http("connection refused".into())),
            _ => {}
        }

        let content_type = request.headers.get("content-type").unwrap_or("").to_string();
        let path = request.url.path().to_string();
        let headers = request.headers.clone();
        let body = collect_stream(request.body.into_stream()?).await?;
        if !content_type.starts_with("multipart/mixed") {
            let reply = json!({ "path": path, "direct": true });
            return Ok(Response::full(200, json_headers(), reply.to_string()));
        }
        self.batched.fetch_add(1, Ordering::SeqCst);
        *self.outer_headers.lock().unwrap() = Some(headers);

        if let Mode::PlainError = self.mode {
            return Ok(Response::full(500, json_headers(), r#"{"error":"boom"}"#));
        }

        let base = Url::parse("https://api.test/").unwrap();
        let mut requests = decode_batch_request(&content_type, body, &base)?;
        let mut builder = BatchResponseBuilder::new("mock_reply_7f3a");
        if let Mode::Multipart { reverse: true, .. } = self.mode {
            requests.reverse();
        }
        if let Mode::Multipart { skip_last: true, .. } = self.mode {
            requests.pop();
        }
        for (id, req) in &requests {
            match self.mode {
                Mode::NotModified => {
                    let headers: Headers = [("ETag", "\"v1\"")].into_iter().collect();
                    builder.push(id, 304, "Not Modified", &headers, b"");
                }
                _ => {
                    let reply = json!({ "path": req.url.path(), "method": req.method });
                    builder.push(id, 200, "OK", &json_headers(), reply.to_string().as_bytes());
                }
            }
        }
        let reply_type = builder.content_type();
        let mut reply = builder.build().to_vec();
        if let Mode::PreambleFlood(n) = self.mode {
            let mut flooded = vec![b'x'; n];
            flooded.extend_from_slice(b"\r\n");
            flooded.extend_from_slice(&reply);
            reply = flooded;
        }
        Ok(chunked_response(200, &reply_type, Bytes::from(reply), 7))
    }

    fn name(&self) -> &str {
        ENDPOINT
    }
}

fn scheduler(mock: &Arc<MockEndpoint>, config: BatchConfig) -> BatchScheduler {
    BatchScheduler::new(mock.clone(), config)
}

fn get(path: &str) -> Request {
    Request::get(&format!("https://api.test{path}")).unwrap()
}

async fn body_json(response: Response) -> Value {
    response.json().await.unwrap()
}

// ─── Batching decisions ───────────────────────────────────────────────────────

#[tokio::test]
async fn two_requests_share_one_exchange() {
    let mock = MockEndpoint::new(Mode::Multipart { reverse: false, skip_last: false });
    let s = scheduler(&mock, BatchConfig::new(ENDPOINT));

    let a = s.fetch(get("/users/1"), None);
    let b = s.fetch(get("/users/2"), None);
    assert_eq!(s.pending(), 2);
    assert_ne!(a.handle(), b.handle());

    let (a, b) = futures::join!(a, b);
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.status, 200);
    assert_eq!(b.status, 200);
    assert_eq!(body_json(a).await["path"], "/users/1");
    assert_eq!(body_json(b).await["path"], "/users/2");
    assert_eq!(mock.calls(), 1);
    assert_eq!(mock.batched(), 1);
    assert_eq!(s.pending(), 0);
}

#[tokio::test]
async fn single_request_goes_direct() {
    let mock = MockEndpoint::new(Mode::Multipart { reverse: false, skip_last: false });
    let s = scheduler(&mock, BatchConfig::new(ENDPOINT));

    let only = s.fetch(get("/solo"), None).await.unwrap();
    let v = body_json(only).await;
    assert_eq!(v["direct"], true);
    assert_eq!(v["path"], "/solo");
    assert_eq!(mock.calls(), 1);
    assert_eq!(mock.batched(), 0);
}

#[tokio::test]
async fn always_batch_wraps_a_single_request() {
    let mock = MockEndpoint::new(Mode::Multipart { reverse: false, skip_last: false });
    let mut config = BatchConfig::new(ENDPOINT);
    config.always_batch = true;
    let s = scheduler(&mock, config);

    let only = s.fetch(get("/solo"), None).await.unwrap();
    assert_eq!(body_json(only).await["path"], "/solo");
    assert_eq!(mock.batched(), 1);
}

#[tokio::test]
async fn separate_windows_make_separate_calls() {
    let mock = MockEndpoint::new(Mode::Multipart { reverse: false, skip_last: false });
    let s = scheduler(&mock, BatchConfig::new(ENDPOINT));

    s.fetch(get("/one"), None).await.unwrap();
    s.fetch(get("/two"), None).await.unwrap();
    assert_eq!(mock.calls(), 2);
    assert_eq!(mock.batched(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_window_on_worker_pool_waits_for_the_caller() {
    let mock = MockEndpoint::new(Mode::Multipart { reverse: false, skip_last: false });
    let s = scheduler(&mock, BatchConfig::new(ENDPOINT));

    let a = s.fetch(get("/a"), None);
    // idle workers are free to run the window task here
    std::thread::sleep(Duration::from_millis(20));
    let b = s.fetch(get("/b"), None);
    assert_eq!(s.pending(), 2);

    let (a, b) = futures::join!(a, b);
    assert_eq!(body_json(a.unwrap()).await["path"], "/a");
    assert_eq!(body_json(b.unwrap()).await["path"], "/b");
    assert_eq!(mock.calls(), 1);
    assert_eq!(mock.batched(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_response_still_flushes_the_group() {
    let mock = MockEndpoint::new(Mode::Multipart { reverse: false, skip_last: false });
    let s = scheduler(&mock, BatchConfig::new(ENDPOINT));

    drop(s.fetch(get("/fire-and-forget"), None));
    tokio::time::timeout(Duration::from_secs(1), async {
        while mock.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(mock.calls(), 1);
}

#[tokio::test]
async fn window_collects_later_requests() {
    let mock = MockEndpoint::new(Mode::Multipart { reverse: false, skip_last: false });
    let mut config = BatchConfig::new(ENDPOINT);
    config.window_ms = 30;
    let s = scheduler(&mock, config);

    let a = s.fetch(get("/a"), None);
    tokio::time::sleep(Duration::from_millis(5)).await;
    let b = s.fetch(get("/b"), None);
    let (a, b) = futures::join!(a, b);
    assert!(a.unwrap().ok());
    assert!(b.unwrap().ok());
    assert_eq!(mock.calls(), 1);
}

#[tokio::test]
async fn outer_headers_are_merged() {
    let mock = MockEndpoint::new(Mode::Multipart { reverse: false, skip_last: false });
    let mut config = BatchConfig::new(ENDPOINT);
    config.headers = vec![("Authorization".into(), "Bearer t0k".into())];
    let s = scheduler(&mock, config);

    let (a, b) = futures::join!(s.fetch(get("/a"), None), s.fetch(get("/b"), None));
    a.unwrap();
    b.unwrap();
    let seen = mock.outer_headers.lock().unwrap().clone().unwrap();
    assert_eq!(seen.get("authorization"), Some("Bearer t0k"));
    assert!(seen.get("content-type").unwrap().starts_with("multipart/mixed; boundary="));
}

// ─── Correlation ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn reply_order_does_not_matter() {
    for decoder in [DecoderMode::Streaming, DecoderMode::Buffered] {
        let mock = MockEndpoint::new(Mode::Multipart { reverse: true, skip_last: false });
        let mut config = BatchConfig::new(ENDPOINT);
        config.decoder = decoder;
        let s = scheduler(&mock, config);

        let pending: Vec<_> = (0..5).map(|i| s.fetch(get(&format!("/items/{i}")), None)).collect();
        let responses = futures::future::join_all(pending).await;
        for (i, response) in responses.into_iter().enumerate() {
            let v = body_json(response.unwrap()).await;
            assert_eq!(v["path"], format!("/items/{i}"), "decoder {decoder:?}");
            assert_eq!(v["method"], "GET");
        }
        assert_eq!(mock.calls(), 1);
    }
}

#[tokio::test]
async fn missing_part_rejects_only_its_caller() {
    let mock = MockEndpoint::new(Mode::Multipart { reverse: false, skip_last: true });
    let s = scheduler(&mock, BatchConfig::new(ENDPOINT));

    let (a, b) = futures::join!(s.fetch(get("/a"), None), s.fetch(get("/b"), None));
    assert_eq!(body_json(a.unwrap()).await["path"], "/a");
    match b.unwrap_err() {
        BatchError::ResponseCountMismatch { content_id } => assert!(content_id.starts_with("request-2-")),
        other => panic!("expected ResponseCountMismatch, got {other:?}"),
    }
}

// ─── Degraded and failed replies ──────────────────────────────────────────────

#[tokio::test]
async fn plain_error_reply_is_shared() {
    let mock = MockEndpoint::new(Mode::PlainError);
    let s = scheduler(&mock, BatchConfig::new(ENDPOINT));

    let (a, b) = futures::join!(s.fetch(get("/a"), None), s.fetch(get("/b"), None));
    for response in [a.unwrap(), b.unwrap()] {
        assert_eq!(response.status, 500);
        assert_eq!(body_json(response).await["error"], "boom");
    }
}

#[tokio::test]
async fn not_modified_parts_have_empty_bodies() {
    let mock = MockEndpoint::new(Mode::NotModified);
    let s = scheduler(&mock, BatchConfig::new(ENDPOINT));

    let (a, b) = futures::join!(s.fetch(get("/a"), None), s.fetch(get("/b"), None));
    for response in [a.unwrap(), b.unwrap()] {
        assert_eq!(response.status, 304);
        assert_eq!(response.headers.get("etag"), Some("\"v1\""));
        assert_eq!(response.text().await.unwrap(), "");
    }
}

#[tokio::test]
async fn oversized_preamble_rejects_the_group() {
    let mock = MockEndpoint::new(Mode::PreambleFlood(1024));
    let mut config = BatchConfig::new(ENDPOINT);
    config.limits.max_discard_size = 64;
    let s = scheduler(&mock, config);

    let (a, b) = futures::join!(s.fetch(get("/a"), None), s.fetch(get("/b"), None));
    for err in [a.unwrap_err(), b.unwrap_err()] {
        assert!(err.is_decode_error());
        assert!(matches!(
            err,
            BatchError::Decode(DecodeError::PreambleTooLarge { limit: 64 })
        ));
    }
}

#[tokio::test]
async fn transport_failure_rejects_every_entry() {
    let mock = MockEndpoint::new(Mode::Fail);
    let s = scheduler(&mock, BatchConfig::new(ENDPOINT));

    let (a, b) = futures::join!(s.fetch(get("/a"), None), s.fetch(get("/b"), None));
    assert!(matches!(a.unwrap_err(), BatchError::Http(_)));
    assert!(matches!(b.unwrap_err(), BatchError::Http(_)));
}

// ─── Cancellation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_before_dispatch_removes_entry() {
    let mock = MockEndpoint::new(Mode::Multipart { reverse: false, skip_last: false });
    let s = scheduler(&mock, BatchConfig::new(ENDPOINT));

    let token = CancelToken::new();
    let a = s.fetch(get("/a"), Some(token.clone()));
    let b = s.fetch(get("/b"), None);
    token.cancel();
    assert_eq!(s.pending(), 1);

    assert!(a.await.unwrap_err().is_cancelled());
    assert_eq!(body_json(b.await.unwrap()).await["path"], "/b");
    // the survivor went out alone
    assert_eq!(mock.calls(), 1);
    assert_eq!(mock.batched(), 0);
}

#[tokio::test]
async fn already_cancelled_token_never_queues() {
    let mock = MockEndpoint::new(Mode::Multipart { reverse: false, skip_last: false });
    let s = scheduler(&mock, BatchConfig::new(ENDPOINT));

    let token = CancelToken::new();
    token.cancel();
    let a = s.fetch(get("/a"), Some(token));
    assert_eq!(s.pending(), 0);
    assert!(a.await.unwrap_err().is_cancelled());
    tokio::task::yield_now().await;
    assert_eq!(mock.calls(), 0);
}

#[tokio::test]
async fn cancel_after_dispatch_rejects_one_then_aborts_group() {
    let mock = MockEndpoint::new(Mode::Hang);
    let s = scheduler(&mock, BatchConfig::new(ENDPOINT));

    let ta = CancelToken::new();
    let tb = CancelToken::new();
    let a = s.fetch(get("/a"), Some(ta.clone()));
    let mut b = s.fetch(get("/b"), Some(tb.clone()));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(mock.calls(), 1);

    ta.cancel();
    assert!(a.await.unwrap_err().is_cancelled());
    assert!(tokio::time::timeout(Duration::from_millis(10), &mut b).await.is_err());
    assert!(!mock.aborted());

    tb.cancel();
    assert!(b.await.unwrap_err().is_cancelled());
    assert!(mock.aborted());
}

#[tokio::test]
async fn scheduler_cancel_aborts_in_flight_group() {
    let mock = MockEndpoint::new(Mode::Hang);
    let s = scheduler(&mock, BatchConfig::new(ENDPOINT));

    let a = s.fetch(get("/a"), None);
    let b = s.fetch(get("/b"), None);
    tokio::time::sleep(Duration::from_millis(10)).await;
    s.cancel();
    let (a, b) = futures::join!(a, b);
    assert!(a.unwrap_err().is_cancelled());
    assert!(b.unwrap_err().is_cancelled());
    // nothing current any more
    s.cancel();
}

#[tokio::test]
async fn scheduler_cancel_during_window_skips_network() {
    let mock = MockEndpoint::new(Mode::Multipart { reverse: false, skip_last: false });
    let mut config = BatchConfig::new(ENDPOINT);
    config.window_ms = 1_000;
    let s = scheduler(&mock, config);

    let a = s.fetch(get("/a"), None);
    let b = s.fetch(get("/b"), None);
    s.cancel();
    let (a, b) = futures::join!(a, b);
    assert!(a.unwrap_err().is_cancelled());
    assert!(b.unwrap_err().is_cancelled());
    assert_eq!(mock.calls(), 0);
}

#[tokio::test]
async fn scheduler_is_itself_a_transport() {
    let mock = MockEndpoint::new(Mode::Multipart { reverse: false, skip_last: false });
    let s = scheduler(&mock, BatchConfig::new(ENDPOINT));
    let transport: Arc<dyn HttpTransport> = Arc::new(s);
    assert_eq!(transport.name(), ENDPOINT);
    let response = transport.execute(get("/via-trait"), CancelToken::new()).await.unwrap();
    assert_eq!(body_json(response).await["path"], "/via-trait");
}
