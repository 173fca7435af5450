//! HTTP message value types shared by the encoder, decoders and transports.

use std::fmt;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use crate::error::BatchError;

/// A pull-based byte source. Dropping it cancels the read.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, BatchError>> + Send + 'static>>;

/// Wrap an in-memory buffer as a single-chunk [`BodyStream`].
pub fn once_stream(bytes: Bytes) -> BodyStream {
    if bytes.is_empty() {
        Box::pin(stream::empty())
    } else {
        Box::pin(stream::once(async move { Ok(bytes) }))
    }
}

/// Drain a [`BodyStream`] into one contiguous buffer.
pub async fn collect_stream(mut body: BodyStream) -> Result<Bytes, BatchError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

// ─── Content-ID ───────────────────────────────────────────────────────────────

/// Correlation key between an encoded request part and its response part.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId(String);

impl ContentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse a `Content-ID` header value, stripping optional `<...>`.
    pub fn from_header(value: &str) -> Option<Self> {
        let v = value.trim();
        let v = v
            .strip_prefix('<')
            .and_then(|inner| inner.strip_suffix('>'))
            .unwrap_or(v)
            .trim();
        (!v.is_empty()).then(|| Self(v.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `true` if a wire id refers to this id.
    ///
    /// Servers may decorate ids (`response-<id>`, `<id>@host`), so any wire
    /// id containing this one matches.
    pub fn matches(&self, wire: &ContentId) -> bool {
        wire.0 == self.0 || wire.0.contains(self.0.as_str())
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─── Headers ──────────────────────────────────────────────────────────────────

/// Insertion-ordered header list with case-insensitive lookup.
///
/// Duplicate names are kept; [`Headers::get`] returns the first one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`, ignoring ASCII case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Add a header, keeping any existing values with the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace every value of `name` with a single `value`.
    ///
    /// The header keeps the position of its first occurrence.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some(pos) => {
                self.entries[pos] = (name.clone(), value);
                let mut idx = 0;
                self.entries.retain(|(n, _)| {
                    let keep = idx <= pos || !n.eq_ignore_ascii_case(&name);
                    idx += 1;
                    keep
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    /// Remove every value of `name`.
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Folding continuation: append `more` to the last header's value.
    pub(crate) fn continue_last(&mut self, more: &str) -> bool {
        match self.entries.last_mut() {
            Some((_, value)) => {
                value.push(' ');
                value.push_str(more);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

// ─── Request ──────────────────────────────────────────────────────────────────

/// Request payload, tagged by how it must be serialized.
pub enum Body {
    Empty,
    Bytes(Bytes),
    /// Serialized as UTF-8 with `text/plain; charset=utf-8`.
    Text(String),
    /// Serialized with `serde_json` as `application/json`.
    Json(Value),
    /// URL-encoded as `application/x-www-form-urlencoded`.
    Form(Vec<(String, String)>),
    /// Forwarded chunk by chunk without buffering.
    Stream(BodyStream),
}

impl Body {
    /// Content type implied by the variant, if any.
    pub fn implied_content_type(&self) -> Option<&'static str> {
        match self {
            Self::Text(_) => Some("text/plain; charset=utf-8"),
            Self::Json(_) => Some("application/json"),
            Self::Form(_) => Some("application/x-www-form-urlencoded"),
            Self::Empty | Self::Bytes(_) | Self::Stream(_) => None,
        }
    }

    /// Turn the body into a byte stream, serializing structured variants.
    pub fn into_stream(self) -> Result<BodyStream, BatchError> {
        let bytes = match self {
            Self::Empty => Bytes::new(),
            Self::Bytes(b) => b,
            Self::Text(s) => Bytes::from(s),
            Self::Json(v) => Bytes::from(serde_json::to_vec(&v)?),
            Self::Form(pairs) => {
                let encoded = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(pairs)
                    .finish();
                Bytes::from(encoded)
            }
            Self::Stream(s) => return Ok(s),
        };
        Ok(once_stream(bytes))
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty"),
            Self::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Self::Text(s) => write!(f, "Text({s:?})"),
            Self::Json(v) => write!(f, "Json({v})"),
            Self::Form(p) => write!(f, "Form({p:?})"),
            Self::Stream(_) => write!(f, "Stream(..)"),
        }
    }
}

/// An outgoing HTTP request.
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub url: Url,
    pub headers: Headers,
    pub body: Body,
}

impl Request {
    /// Create a request with no headers and an empty body.
    pub fn new(method: impl Into<String>, url: Url) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            url,
            headers: Headers::new(),
            body: Body::Empty,
        }
    }

    /// Convenience `GET` from a string URL.
    pub fn get(url: &str) -> Result<Self, BatchError> {
        let url = Url::parse(url).map_err(|e| BatchError::InvalidRequest(e.to_string()))?;
        Ok(Self::new("GET", url))
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub fn json(self, value: Value) -> Self {
        self.body(Body::Json(value))
    }

    /// `path?query#fragment` as written on the embedded request line.
    pub fn target(&self) -> String {
        let mut target = self.url.path().to_string();
        if let Some(q) = self.url.query() {
            target.push('?');
            target.push_str(q);
        }
        if let Some(frag) = self.url.fragment() {
            target.push('#');
            target.push_str(frag);
        }
        target
    }

    /// Headers as sent: the implied content type is added unless present.
    pub fn effective_headers(&self) -> Headers {
        let mut headers = self.headers.clone();
        if let Some(ct) = self.body.implied_content_type() {
            if !headers.contains("content-type") {
                headers.insert("Content-Type", ct);
            }
        }
        headers
    }
}

// ─── Response ─────────────────────────────────────────────────────────────────

/// Response payload: fully buffered, or still streaming from the wire.
pub enum ResponseBody {
    Full(Bytes),
    Stream(BodyStream),
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(b) => write!(f, "Full({} bytes)", b.len()),
            Self::Stream(_) => write!(f, "Stream(..)"),
        }
    }
}

/// An HTTP response, either from the transport or decoded from a batch part.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub status_text: String,
    pub headers: Headers,
    pub body: ResponseBody,
}

impl Response {
    pub fn new(status: u16, status_text: impl Into<String>, headers: Headers, body: ResponseBody) -> Self {
        Self {
            status,
            status_text: status_text.into(),
            headers,
            body,
        }
    }

    /// Buffered response, handy for tests and degraded replies.
    pub fn full(status: u16, headers: Headers, body: impl Into<Bytes>) -> Self {
        Self::new(
            status,
            canonical_reason(status).unwrap_or(""),
            headers,
            ResponseBody::Full(body.into()),
        )
    }

    /// `true` for 2xx statuses.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    /// Read the whole body.
    pub async fn bytes(self) -> Result<Bytes, BatchError> {
        match self.body {
            ResponseBody::Full(b) => Ok(b),
            ResponseBody::Stream(s) => collect_stream(s).await,
        }
    }

    /// Read the whole body as UTF-8 (lossy).
    pub async fn text(self) -> Result<String, BatchError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Read and deserialize a JSON body.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T, BatchError> {
        let bytes = self.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// The body as a stream regardless of how it is held.
    pub fn into_stream(self) -> BodyStream {
        match self.body {
            ResponseBody::Full(b) => once_stream(b),
            ResponseBody::Stream(s) => s,
        }
    }

    /// Buffer a streaming body in place so the response can be cloned.
    pub async fn buffered(self) -> Result<Self, BatchError> {
        let Self {
            status,
            status_text,
            headers,
            body,
        } = self;
        let bytes = match body {
            ResponseBody::Full(b) => b,
            ResponseBody::Stream(s) => collect_stream(s).await?,
        };
        Ok(Self {
            status,
            status_text,
            headers,
            body: ResponseBody::Full(bytes),
        })
    }

    /// Clone a buffered response. Streaming bodies cannot be cloned.
    pub fn try_clone(&self) -> Option<Self> {
        match &self.body {
            ResponseBody::Full(b) => Some(Self {
                status: self.status,
                status_text: self.status_text.clone(),
                headers: self.headers.clone(),
                body: ResponseBody::Full(b.clone()),
            }),
            ResponseBody::Stream(_) => None,
        }
    }
}

/// Statuses that never carry a message body.
pub fn is_bodyless_status(status: u16) -> bool {
    (100..200).contains(&status) || matches!(status, 204 | 205 | 304)
}

/// Reason phrase for the statuses the batch layer commonly produces.
pub fn canonical_reason(status: u16) -> Option<&'static str> {
    Some(match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        409 => "Conflict",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut h = Headers::new();
        h.append("Content-Type", "application/json");
        h.append("X-Trace", "a");
        h.append("x-trace", "b");
        assert_eq!(h.get("content-type"), Some("application/json"));
        assert_eq!(h.get_all("X-TRACE").collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn insert_replaces_all_duplicates_in_place() {
        let mut h: Headers = [("A", "1"), ("B", "2"), ("a", "3")].into_iter().collect();
        h.insert("a", "9");
        assert_eq!(h.iter().collect::<Vec<_>>(), vec![("a", "9"), ("B", "2")]);
    }

    #[test]
    fn request_target_keeps_query_and_fragment() {
        let req = Request::get("https://api.example.com/v1/items?page=2#top").unwrap();
        assert_eq!(req.target(), "/v1/items?page=2#top");
        assert_eq!(req.method, "GET");
    }

    #[test]
    fn json_body_implies_content_type() {
        let req = Request::new("post", Url::parse("https://x.test/a").unwrap())
            .json(serde_json::json!({"a": 1}));
        assert_eq!(req.method, "POST");
        assert_eq!(req.effective_headers().get("content-type"), Some("application/json"));

        let explicit = Request::new("POST", Url::parse("https://x.test/a").unwrap())
            .header("content-type", "application/vnd.api+json")
            .json(serde_json::json!({}));
        assert_eq!(
            explicit.effective_headers().get("Content-Type"),
            Some("application/vnd.api+json")
        );
    }

    #[tokio::test]
    async fn form_body_is_url_encoded() {
        let body = Body::Form(vec![("q".into(), "a b".into()), ("n".into(), "1".into())]);
        let bytes = collect_stream(body.into_stream().unwrap()).await.unwrap();
        assert_eq!(&bytes[..], b"q=a+b&n=1");
    }

    #[tokio::test]
    async fn buffered_response_clones() {
        let resp = Response::new(
            500,
            "Internal Server Error",
            Headers::new(),
            ResponseBody::Stream(once_stream(Bytes::from_static(b"{\"error\":true}"))),
        );
        assert!(resp.try_clone().is_none());
        let resp = resp.buffered().await.unwrap();
        let copy = resp.try_clone().unwrap();
        assert_eq!(copy.status, 500);
        let v: Value = copy.json().await.unwrap();
        assert_eq!(v["error"], true);
        assert_eq!(resp.text().await.unwrap(), "{\"error\":true}");
    }

    #[test]
    fn content_id_strips_angle_brackets() {
        let id = ContentId::from_header(" <response-request-1-abc> ").unwrap();
        assert_eq!(id.as_str(), "response-request-1-abc");
        assert!(ContentId::new("request-1-abc").matches(&id));
        assert!(!ContentId::new("request-2-abc").matches(&id));
        assert!(ContentId::from_header("<>").is_none());
    }

    #[test]
    fn bodyless_statuses() {
        assert!(is_bodyless_status(204));
        assert!(is_bodyless_status(304));
        assert!(is_bodyless_status(101));
        assert!(!is_bodyless_status(200));
    }
}
