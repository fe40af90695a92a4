//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.

use super::AppConfig;
use crate::net;
use mnema_core::{Memory, MnemaError};
use tokio::net::TcpListener;

// =============================================================================
// SERVE COMMAND
// =============================================================================

/// Start the wire-protocol server.
pub async fn cmd_serve(config: AppConfig) -> Result<(), MnemaError> {
    let address = format!("{}:{}", config.server.host, config.server.port);
    let memory = Memory::initialize(config.memory)?;

    println!("Mnema memory server starting...");
    println!();
    println!("Configuration:");
    println!("  Address:    {}", address);
    println!("  Repository: {:?}", memory.params().repo_path);
    println!();
    println!("Send the SHUTDOWN command or press Ctrl+C to stop");
    println!();

    let listener = TcpListener::bind(&address)
        .await
        .map_err(|e| MnemaError::IoError(format!("bind {address}: {e}")))?;

    let serve = net::run_server(listener, std::sync::Arc::clone(&memory));
    tokio::select! {
        outcome = serve => outcome?,
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|e| MnemaError::IoError(format!("signal handler: {e}")))?;
            tracing::info!("interrupt received");
        }
    }
    memory.shutdown()
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

/// Show element and index counts.
pub fn cmd_status(config: &AppConfig, json_mode: bool) -> Result<(), MnemaError> {
    let memory = Memory::initialize(config.memory.clone())?;
    let stats = memory.stats();

    if json_mode {
        let output = serde_json::json!({
            "repository": config.memory.repo_path.to_string_lossy(),
            "nodes": stats.elements.nodes,
            "links": stats.elements.links,
            "connectors": stats.elements.connectors,
            "erased": stats.elements.erased,
            "contents": stats.index.contents,
            "identifiers": stats.index.identifiers,
            "terms": stats.index.terms,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output).unwrap_or_default()
        );
        return memory.shutdown();
    }

    println!("Mnema Memory Status");
    println!("===================");
    println!("Repository: {:?}", config.memory.repo_path);
    println!();
    println!("Nodes:       {}", stats.elements.nodes);
    println!("Links:       {}", stats.elements.links);
    println!("Connectors:  {}", stats.elements.connectors);
    println!("Erased:      {}", stats.elements.erased);
    println!();
    println!("Contents:    {}", stats.index.contents);
    println!("Identifiers: {}", stats.index.identifiers);
    println!("Terms:       {}", stats.index.terms);

    memory.shutdown()
}

// =============================================================================
// FIND COMMAND
// =============================================================================

/// Search links by exact content or contained terms.
pub fn cmd_find(
    config: &AppConfig,
    text: &str,
    substring: bool,
    json_mode: bool,
) -> Result<(), MnemaError> {
    let memory = Memory::initialize(config.memory.clone())?;
    let ctx = memory.context();

    let links = if substring {
        ctx.find_links_by_substring(text.as_bytes())?
    } else {
        ctx.find_links_by_content(text.as_bytes())?
    };

    if json_mode {
        let output = serde_json::json!({
            "query": text,
            "substring": substring,
            "links": links.iter().map(|l| l.to_string()).collect::<Vec<_>>(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output).unwrap_or_default()
        );
        return memory.shutdown();
    }

    if links.is_empty() {
        println!("No links match {text:?}");
    } else {
        println!("Links matching {text:?}:");
        for link in &links {
            println!("  {link}");
        }
    }

    memory.shutdown()
}
