//! Decoder size limits.

use serde::{Deserialize, Serialize};

/// Memory bounds applied by the multipart decoders.
///
/// Each limit caps the bytes the decoder may hold (or discard) in one state
/// before giving up with a fatal [`DecodeError`](crate::error::DecodeError).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderLimits {
    /// Preamble before the first boundary, and epilogue after the last.
    #[serde(default = "default_max_discard_size")]
    pub max_discard_size: usize,
    /// Part header block and embedded response header block.
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    /// Embedded `HTTP/1.1 200 OK` line.
    #[serde(default = "default_max_status_line_size")]
    pub max_status_line_size: usize,
    /// Largest body chunk held back or emitted at once.
    #[serde(default = "default_max_chunk_body_size")]
    pub max_chunk_body_size: usize,
}

fn default_max_discard_size() -> usize { 64 * 1024 }
fn default_max_header_size() -> usize { 64 * 1024 }
fn default_max_status_line_size() -> usize { 8 * 1024 }
fn default_max_chunk_body_size() -> usize { 1024 * 1024 }

impl Default for DecoderLimits {
    fn default() -> Self {
        Self {
            max_discard_size: default_max_discard_size(),
            max_header_size: default_max_header_size(),
            max_status_line_size: default_max_status_line_size(),
            max_chunk_body_size: default_max_chunk_body_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let limits: DecoderLimits = serde_json::from_str(r#"{"max_discard_size": 10}"#).unwrap();
        assert_eq!(limits.max_discard_size, 10);
        assert_eq!(limits.max_header_size, 64 * 1024);
        assert_eq!(limits.max_chunk_body_size, 1024 * 1024);
    }
}
