//! # Mnema CLI Module
//!
//! Command-line interface and configuration loading.
//!
//! ## Available Commands
//!
//! - `serve` - Start the wire-protocol server
//! - `status` - Show element and index counts
//! - `find` - Search links by content
//!
//! Configuration comes from an optional TOML file (`--config`) whose
//! `[memory]` table maps onto the engine parameters and whose `[server]`
//! table holds the listen address; CLI flags override both.

mod commands;

use clap::{Parser, Subcommand};
use mnema_core::{MnemaError, Params};
use serde::Deserialize;
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Mnema - semantic-graph memory server.
///
/// A shared store of typed graph elements with reactive agents, indexed
/// link content, and a binary wire protocol.
#[derive(Parser, Debug)]
#[command(name = "mnema")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the string-index files (overrides config)
    #[arg(short = 'r', long, global = true)]
    pub repo_path: Option<PathBuf>,

    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the wire-protocol server
    Serve {
        /// Host to bind to (overrides config)
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to bind to (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Reinitialize the repository before serving
        #[arg(long)]
        clear: bool,
    },

    /// Show element and index counts
    Status,

    /// Search links by content
    Find {
        /// Content to search for
        #[arg(short, long)]
        text: String,

        /// Match by contained terms instead of exact content
        #[arg(short, long)]
        substring: bool,
    },
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Listen address of the wire-protocol server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 55770,
        }
    }
}

/// Full application configuration: engine parameters plus server address.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub memory: Params,
    pub server: ServerConfig,
}

/// Load the configuration file (when given) and fold in CLI overrides.
pub fn load_config(cli: &Cli) -> Result<AppConfig, MnemaError> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| MnemaError::IoError(format!("read config {path:?}: {e}")))?;
            toml::from_str::<AppConfig>(&text)
                .map_err(|e| MnemaError::SerializationError(format!("parse config: {e}")))?
        }
        None => AppConfig::default(),
    };
    if let Some(repo) = &cli.repo_path {
        config.memory.repo_path.clone_from(repo);
    }
    if let Some(Commands::Serve { host, port, clear }) = &cli.command {
        if let Some(host) = host {
            config.server.host.clone_from(host);
        }
        if let Some(port) = port {
            config.server.port = *port;
        }
        config.memory.clear = *clear;
    }
    Ok(config)
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments and resolved configuration.
pub async fn execute(cli: Cli, config: AppConfig) -> Result<(), MnemaError> {
    let json_mode = cli.json_mode;
    match cli.command {
        Some(Commands::Serve { .. }) => cmd_serve(config).await,
        Some(Commands::Find { text, substring }) => cmd_find(&config, &text, substring, json_mode),
        Some(Commands::Status) | None => cmd_status(&config, json_mode),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_a_config_file() {
        let cli = Cli::parse_from(["mnema", "status"]);
        let config = load_config(&cli).expect("load");
        assert_eq!(config.server.port, 55770);
        assert_eq!(config.memory.repo_path, Params::default().repo_path);
    }

    #[test]
    fn cli_flags_override_the_config_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mnema.toml");
        std::fs::write(
            &path,
            r#"
[memory]
repo_path = "/tmp/from-config"
max_searchable_string_size = 128

[server]
port = 4242
"#,
        )
        .expect("write config");

        let cli = Cli::parse_from([
            "mnema",
            "--config",
            path.to_str().expect("utf8 path"),
            "--repo-path",
            "/tmp/from-flag",
            "serve",
            "--port",
            "5353",
            "--clear",
        ]);
        let config = load_config(&cli).expect("load");
        assert_eq!(config.memory.repo_path, PathBuf::from("/tmp/from-flag"));
        assert_eq!(config.memory.max_searchable_string_size, 128);
        assert_eq!(config.server.port, 5353);
        assert_eq!(config.server.host, "127.0.0.1");
        assert!(config.memory.clear);
    }

    #[test]
    fn malformed_config_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[memory\n").expect("write config");
        let cli = Cli::parse_from(["mnema", "--config", path.to_str().expect("utf8"), "status"]);
        assert!(load_config(&cli).is_err());
    }
}
