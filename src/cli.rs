//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Retrieval Gateway - access control plane for retrieval tools
#[derive(Parser, Debug)]
#[command(name = "retrieval-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Which tier (or utility) to run
    #[command(subcommand)]
    pub command: Command,

    /// Path to configuration file (YAML)
    #[arg(short, long, env = "RGW_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "RGW_PORT", global = true)]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "RGW_HOST", global = true)]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RGW_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "RGW_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the client-facing Gateway tier
    Gateway,
    /// Run the Tool Server tier
    ToolServer,
    /// Load and validate configuration, then print the effective profile
    CheckConfig,
}
