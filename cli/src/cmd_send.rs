//! `batchwire send` — GET several URLs through one batch exchange.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use batchwire_core::message::Request;
use batchwire_http::{BatchConfig, BatchScheduler, HttpTransportConfig, ReqwestTransport};

pub async fn run(
    endpoint: Option<&str>,
    always_batch: bool,
    config_path: Option<&str>,
    timeout: Option<u64>,
    urls: &[String],
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => BatchConfig::from_file(path).with_context(|| format!("loading {path}"))?,
        None => {
            let endpoint = endpoint.ok_or_else(|| anyhow!("--endpoint or --config is required"))?;
            BatchConfig::new(endpoint)
        }
    };
    if let Some(endpoint) = endpoint {
        config.endpoint = endpoint.to_string();
    }
    config.always_batch |= always_batch;
    config.validate()?;

    let transport = ReqwestTransport::new(
        config.endpoint.clone(),
        HttpTransportConfig {
            request_timeout: timeout.map(Duration::from_secs),
            ..HttpTransportConfig::default()
        },
    )?;
    tracing::debug!(urls = urls.len(), endpoint = %config.endpoint, "sending batch");
    let scheduler = BatchScheduler::new(Arc::new(transport), config);

    let mut pending = Vec::with_capacity(urls.len());
    for url in urls {
        let request = Request::get(url).with_context(|| format!("invalid URL {url}"))?;
        pending.push(scheduler.fetch(request, None));
    }
    let results = futures::future::join_all(pending).await;

    let mut failures = 0;
    for (url, result) in urls.iter().zip(results) {
        println!("── {url}");
        match result {
            Ok(response) => {
                println!("  Status: {} {}", response.status, response.status_text);
                if let Some(ct) = response.content_type() {
                    println!("  Type:   {ct}");
                }
                let body = response.text().await?;
                println!("{body}");
            }
            Err(e) => {
                failures += 1;
                println!("  ✗ {e}");
            }
        }
    }
    if failures > 0 {
        return Err(anyhow!("{failures} of {} requests failed", urls.len()));
    }
    Ok(())
}
