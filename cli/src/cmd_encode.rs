//! `batchwire encode` — write a batch body of GETs to stdout.

use std::io::Write;

use anyhow::{Context, Result};
use batchwire_core::encoder::BatchEncoder;
use batchwire_core::message::Request;

pub async fn run(boundary: Option<&str>, urls: &[String]) -> Result<()> {
    let mut encoder = match boundary {
        Some(b) => BatchEncoder::with_boundary(b, "cli"),
        None => BatchEncoder::new(),
    };
    for url in urls {
        encoder.add_request(Request::get(url).with_context(|| format!("invalid URL {url}"))?);
    }

    eprintln!("Content-Type: {}", encoder.content_type());
    let body = encoder.encode().await?;
    let mut out = std::io::stdout().lock();
    out.write_all(&body)?;
    out.flush()?;
    Ok(())
}
