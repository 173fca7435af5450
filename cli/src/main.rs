//! batchwire CLI — send, encode and decode `multipart/mixed` HTTP batches.
//!
//! Usage:
//! ```bash
//! # Fetch several URLs through one batch endpoint
//! batchwire send --endpoint https://api.example.com/batch \
//!     https://api.example.com/users/1 https://api.example.com/users/2
//!
//! # Decode a captured batch reply
//! batchwire decode --content-type 'multipart/mixed; boundary=b' --file reply.bin
//!
//! # Print the batch body for a list of GETs
//! batchwire encode --boundary b https://api.example.com/a https://api.example.com/b
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cmd_decode;
mod cmd_encode;
mod cmd_send;

#[derive(Parser)]
#[command(
    name = "batchwire",
    about = "Batch HTTP requests into multipart/mixed exchanges",
    long_about = "
Batchwire CLI: combine independent HTTP requests into one multipart/mixed
request, and split multipart replies back into individual responses.

ENVIRONMENT VARIABLES:
  RUST_LOG    Log filter (e.g. batchwire_http=debug)
",
    version
)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON structured logs
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch every URL as one batch through the endpoint
    Send {
        /// Batch endpoint URL
        #[arg(long)]
        endpoint: Option<String>,
        /// Batch even a single URL
        #[arg(long)]
        always_batch: bool,
        /// JSON scheduler config; flags override its values
        #[arg(long)]
        config: Option<String>,
        /// Request timeout in seconds (none by default)
        #[arg(long)]
        timeout: Option<u64>,
        /// URLs to GET
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Decode a captured multipart/mixed reply
    Decode {
        /// Content-Type header of the captured reply
        #[arg(long)]
        content_type: String,
        /// File holding the raw reply body
        #[arg(short, long)]
        file: String,
        /// Use the buffered decoder instead of the streaming one
        #[arg(long)]
        buffered: bool,
    },

    /// Print the encoded batch body for GET requests
    Encode {
        /// Multipart boundary (random when omitted)
        #[arg(long)]
        boundary: Option<String>,
        /// URLs to GET
        #[arg(required = true)]
        urls: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    match cli.command {
        Commands::Send {
            endpoint,
            always_batch,
            config,
            timeout,
            urls,
        } => cmd_send::run(endpoint.as_deref(), always_batch, config.as_deref(), timeout, &urls).await,

        Commands::Decode {
            content_type,
            file,
            buffered,
        } => cmd_decode::run(&content_type, &file, buffered).await,

        Commands::Encode { boundary, urls } => cmd_encode::run(boundary.as_deref(), &urls).await,
    }
}

/// `RUST_LOG` wins; otherwise `warn`, or `debug` for our crates with `--verbose`.
fn init_tracing(verbose: bool, json: bool) {
    let fallback = if verbose {
        "warn,batchwire_core=debug,batchwire_http=debug,batchwire=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
