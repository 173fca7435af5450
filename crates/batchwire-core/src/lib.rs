//! batchwire-core — wire types and codecs for Batchwire.
//!
//! # Overview
//!
//! Batchwire combines many independent HTTP requests into one
//! `multipart/mixed` request and splits the multipart reply back into
//! individual responses. The core crate defines:
//!
//! - [`HttpTransport`] — the async trait every transport implements
//! - [`Request`] / [`Response`] / [`Headers`] — message types
//! - [`BatchEncoder`] — serializes queued requests into one batch body
//! - [`decoder`] module — streaming, buffered and text reply decoders
//! - [`PatternSearch`] — KMP byte search used for boundary detection
//! - [`CancelToken`] — cooperative cancellation shared by callers and transports
//! - [`server`] module — endpoint-side request decoding and reply building
//! - [`BatchError`] / [`DecodeError`] — structured error types

pub mod cancel;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod message;
pub mod pattern;
pub mod server;
pub mod transport;

pub use cancel::{CancelGuard, CancelToken};
pub use config::DecoderLimits;
pub use decoder::{BufferedDecoder, StreamingDecoder};
pub use encoder::BatchEncoder;
pub use error::{BatchError, DecodeError};
pub use message::{Body, BodyStream, ContentId, Headers, Request, Response, ResponseBody};
pub use pattern::PatternSearch;
pub use server::{decode_batch_request, BatchResponseBuilder};
pub use transport::HttpTransport;
