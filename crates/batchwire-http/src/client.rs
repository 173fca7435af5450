//! HTTP transport backed by `reqwest`.
//!
//! Features:
//! - Streaming request bodies (`Body::Stream` is never buffered)
//! - Streaming response bodies handed to the decoder chunk by chunk
//! - Cancellation through [`CancelToken`] while waiting for response headers
//! - Optional request timeout (none by default)

use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;

use batchwire_core::cancel::CancelToken;
use batchwire_core::error::BatchError;
use batchwire_core::message::{collect_stream, Body, Headers, Request, Response, ResponseBody};
use batchwire_core::transport::HttpTransport;

/// Configuration for [`ReqwestTransport`].
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Whole-exchange timeout; `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    pub user_agent: String,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: None,
            user_agent: concat!("batchwire/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// [`HttpTransport`] over a shared `reqwest::Client`.
pub struct ReqwestTransport {
    name: String,
    http: reqwest::Client,
}

impl ReqwestTransport {
    /// Create a transport; `name` identifies it in logs.
    pub fn new(name: impl Into<String>, config: HttpTransportConfig) -> Result<Self, BatchError> {
        let mut builder = reqwest::Client::builder().user_agent(config.user_agent);
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| BatchError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(name, http))
    }

    /// Create with default configuration.
    pub fn default_for(name: impl Into<String>) -> Result<Self, BatchError> {
        Self::new(name, HttpTransportConfig::default())
    }

    /// Wrap an existing client.
    pub fn with_client(name: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            name: name.into(),
            http,
        }
    }

    async fn build(&self, request: Request) -> Result<reqwest::RequestBuilder, BatchError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| BatchError::InvalidRequest(format!("invalid method {}: {e}", request.method)))?;
        let mut builder = self.http.request(method, request.url.clone());
        for (name, value) in request.effective_headers().iter() {
            builder = builder.header(name, value);
        }
        let builder = match request.body {
            Body::Empty => builder,
            Body::Stream(stream) => builder.body(reqwest::Body::wrap_stream(stream)),
            // in-memory bodies go out with a Content-Length
            other => builder.body(collect_stream(other.into_stream()?).await?),
        };
        Ok(builder)
    }

    async fn send_once(&self, request: Request) -> Result<Response, BatchError> {
        let builder = self.build(request).await?;
        let resp = builder.send().await.map_err(|e| BatchError::Http(e.to_string()))?;

        let status = resp.status();
        let headers: Headers = resp
            .headers()
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), String::from_utf8_lossy(value.as_bytes()).into_owned()))
            .collect();
        tracing::debug!(status = status.as_u16(), transport = %self.name, "response headers received");

        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| BatchError::Body(e.to_string())));
        Ok(Response::new(
            status.as_u16(),
            status.canonical_reason().unwrap_or(""),
            headers,
            ResponseBody::Stream(Box::pin(body)),
        ))
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: Request, cancel: CancelToken) -> Result<Response, BatchError> {
        if cancel.is_cancelled() {
            return Err(BatchError::Cancelled);
        }
        let method = request.method.clone();
        let url = request.url.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(%method, %url, "request cancelled before response");
                Err(BatchError::Cancelled)
            }
            result = self.send_once(request) => {
                if let Err(e) = &result {
                    tracing::error!(%method, %url, error = %e, transport = %self.name, "request failed");
                }
                result
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_request_with_implied_content_type() {
        let transport = ReqwestTransport::default_for("test").unwrap();
        let request = Request::new("post", url::Url::parse("https://h.test/a?b=1").unwrap())
            .header("X-Trace", "7")
            .json(serde_json::json!({"a": 1}));
        let built = transport.build(request).await.unwrap().build().unwrap();
        assert_eq!(built.method(), reqwest::Method::POST);
        assert_eq!(built.url().as_str(), "https://h.test/a?b=1");
        assert_eq!(built.headers()["content-type"], "application/json");
        assert_eq!(built.headers()["x-trace"], "7");
        let body = built.body().and_then(|b| b.as_bytes()).unwrap();
        assert_eq!(body, b"{\"a\":1}");
    }

    #[test]
    fn name_is_the_log_label() {
        let transport = ReqwestTransport::default_for("billing-api").unwrap();
        assert_eq!(transport.name(), "billing-api");
    }

    #[tokio::test]
    async fn rejects_invalid_method() {
        let transport = ReqwestTransport::default_for("test").unwrap();
        let request = Request::new("GE T", url::Url::parse("https://h.test/").unwrap());
        assert!(matches!(transport.build(request).await, Err(BatchError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let transport = ReqwestTransport::default_for("test").unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = transport
            .execute(Request::get("http://127.0.0.1:9/").unwrap(), cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
