//! `batchwire decode` — print every part of a captured batch reply.

use anyhow::{Context, Result};
use bytes::Bytes;
use batchwire_core::config::DecoderLimits;
use batchwire_core::message::{once_stream, ContentId, Response};
use batchwire_core::{BufferedDecoder, StreamingDecoder};

pub async fn run(content_type: &str, file: &str, buffered: bool) -> Result<()> {
    let body = Bytes::from(std::fs::read(file).with_context(|| format!("reading {file}"))?);

    let mut count = 0;
    if buffered {
        for (id, response) in BufferedDecoder::new(content_type, body)?.into_responses()? {
            print_part(&id, response).await?;
            count += 1;
        }
    } else {
        let mut decoder = StreamingDecoder::new(content_type, once_stream(body), DecoderLimits::default())?;
        while let Some((id, response)) = decoder.next_part().await? {
            print_part(&id, response).await?;
            count += 1;
        }
    }
    println!("✓ {count} part(s) decoded");
    Ok(())
}

async fn print_part(id: &ContentId, response: Response) -> Result<()> {
    println!("── {id}");
    println!("  Status: {} {}", response.status, response.status_text);
    for (name, value) in response.headers.iter() {
        println!("  {name}: {value}");
    }
    let body = response.text().await?;
    if !body.is_empty() {
        println!("{body}");
    }
    Ok(())
}
