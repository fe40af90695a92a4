//! # Mnema - Semantic Graph Memory Server
//!
//! The main binary for the Mnema memory.
//!
//! This application provides:
//! - Binary wire-protocol server over TCP (tokio-based)
//! - CLI interface for status and content search
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  apps/mnema (THE BINARY)                 │
//! │                                                          │
//! │     ┌─────────────┐          ┌────────────────────┐      │
//! │     │    CLI      │          │  Wire protocol     │      │
//! │     │   (clap)    │          │  server (tokio)    │      │
//! │     └──────┬──────┘          └─────────┬──────────┘      │
//! │            │                           │                 │
//! │            └────────────┬──────────────┘                 │
//! │                         ▼                                │
//! │                 ┌───────────────┐                        │
//! │                 │  mnema-core   │                        │
//! │                 │  (THE LOGIC)  │                        │
//! │                 └───────────────┘                        │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Start the wire-protocol server
//! mnema serve --host 0.0.0.0 --port 55770
//!
//! # CLI operations
//! mnema status
//! mnema find --text "stored content"
//! ```

use clap::Parser;
use mnema::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    // Resolve configuration before tracing so the configured log level can
    // seed the default filter.
    let config = match cli::load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing — MNEMA_LOG_FORMAT=json enables machine-parseable
    // output.
    let log_format = std::env::var("MNEMA_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("mnema={}", config.memory.log_level.as_str()).into()
    });

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

    // Display startup banner
    if !cli.quiet {
        print_banner();
    }

    // Execute command
    if let Err(e) = cli::execute(cli, config).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Print the Mnema startup banner.
fn print_banner() {
    println!(
        r#"
  ███╗   ███╗███╗   ██╗███████╗███╗   ███╗ █████╗
  ████╗ ████║████╗  ██║██╔════╝████╗ ████║██╔══██╗
  ██╔████╔██║██╔██╗ ██║█████╗  ██╔████╔██║███████║
  ██║╚██╔╝██║██║╚██╗██║██╔══╝  ██║╚██╔╝██║██╔══██║
  ██║ ╚═╝ ██║██║ ╚████║███████╗██║ ╚═╝ ██║██║  ██║
  ╚═╝     ╚═╝╚═╝  ╚═══╝╚══════╝╚═╝     ╚═╝╚═╝  ╚═╝

  Semantic Graph Memory v{}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
