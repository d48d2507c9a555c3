//! # Duchy - Liquid Legions Worker
//!
//! The binary entry point: sets up logging, parses the command line and
//! hands off to [`duchy::cli::execute`].
//!
//! ## Usage
//!
//! ```bash
//! # Run the herald and the mills
//! duchy run --config duchy.toml
//!
//! # Inspect local state
//! duchy status --json
//! duchy stages
//! ```

use clap::Parser;
use duchy::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    // Initialize tracing. DUCHY_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("DUCHY_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "duchy=info".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    // Parse CLI arguments
    let cli = cli::Cli::parse();

    // Execute command
    if let Err(e) = cli::execute(cli).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}
