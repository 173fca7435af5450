//! batchwire-http — `reqwest` transport and the auto-batching scheduler.
//!
//! - [`ReqwestTransport`] — [`HttpTransport`](batchwire_core::HttpTransport) over `reqwest`
//! - [`BatchScheduler`] — groups requests per window into `multipart/mixed` batches
//! - [`BatchConfig`] — endpoint, window and decoder settings

pub mod client;
pub mod config;
pub mod scheduler;

pub use client::{HttpTransportConfig, ReqwestTransport};
pub use config::{BatchConfig, DecoderMode};
pub use scheduler::{BatchScheduler, PendingResponse, RequestHandle};
