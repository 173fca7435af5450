//! Scheduler configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use batchwire_core::config::DecoderLimits;
use batchwire_core::error::BatchError;
use batchwire_core::message::Headers;

/// Which decoder parses multipart replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderMode {
    /// Hand out responses while the reply is still arriving.
    #[default]
    Streaming,
    /// Read the whole reply, then split it.
    Buffered,
}

/// Configuration for [`BatchScheduler`](crate::scheduler::BatchScheduler).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Batch endpoint every multipart request is POSTed to
    pub endpoint: String,
    /// Send a multipart request even for a single queued entry
    #[serde(default)]
    pub always_batch: bool,
    /// Debounce window in milliseconds (0 = next scheduler turn)
    #[serde(default)]
    pub window_ms: u64,
    /// Extra headers on the outer batch request
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub decoder: DecoderMode,
    #[serde(default)]
    pub limits: DecoderLimits,
}

impl BatchConfig {
    /// Defaults for everything but the endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            always_batch: false,
            window_ms: 0,
            headers: vec![],
            decoder: DecoderMode::Streaming,
            limits: DecoderLimits::default(),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, BatchError> {
        let config: Self = serde_json::from_str(json).map_err(|e| BatchError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, BatchError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| BatchError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&content)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Outer request headers as a [`Headers`] list.
    pub fn base_headers(&self) -> Headers {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
    }

    /// Reject configs the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), BatchError> {
        let url = url::Url::parse(&self.endpoint)
            .map_err(|e| BatchError::Config(format!("invalid endpoint {:?}: {e}", self.endpoint)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(BatchError::Config(format!(
                "endpoint must be http or https, got {}",
                url.scheme()
            )));
        }
        let limits = &self.limits;
        for (name, value) in [
            ("max_discard_size", limits.max_discard_size),
            ("max_header_size", limits.max_header_size),
            ("max_status_line_size", limits.max_status_line_size),
            ("max_chunk_body_size", limits.max_chunk_body_size),
        ] {
            if value == 0 {
                return Err(BatchError::Config(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }
}
