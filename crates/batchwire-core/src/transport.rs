//! The `HttpTransport` trait — the outbound HTTP exchange the scheduler drives.

use async_trait::async_trait;

use crate::cancel::CancelToken;
use crate::error::BatchError;
use crate::message::{Request, Response};

/// One HTTP round trip: request in, response head plus body stream out.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` for use across Tokio tasks.
///
/// # Object Safety
/// The trait is object-safe and can be stored as `Arc<dyn HttpTransport>`.
#[async_trait]
pub trait HttpTransport: Send + Sync + 'static {
    /// Execute `request`.
    ///
    /// Implementations should abandon the exchange and return
    /// [`BatchError::Cancelled`] once `cancel` fires. Errors are reserved for
    /// failures before response headers arrive; any HTTP status is `Ok`.
    async fn execute(&self, request: Request, cancel: CancelToken) -> Result<Response, BatchError>;

    /// Label for logs: the endpoint a batching transport posts to, or the
    /// name a plain client was created with. Requests carry their own URLs.
    fn name(&self) -> &str;
}
