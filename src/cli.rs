//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Cadence - keeps data sources fresh and runs staged worker fan-outs
///
/// Sources are refreshed in the background on their own intervals; requests
/// are routed to stages of worker units whose results are aggregated into
/// one outcome.
///
/// Examples:
///   cadence serve
///   cadence status --format json
///   cadence refresh odds
///   cadence run --query "who should I start" --param league_id=42
///   cadence init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Path to configuration file
    ///
    /// If not specified, looks for .cadence.toml in the current directory
    #[arg(short, long, value_name = "FILE", env = "CADENCE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run in quiet mode (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT", global = true)]
    pub format: OutputFormat,

    /// Per-worker timeout in seconds
    ///
    /// Overrides orchestrator.worker_timeout_secs from the config file.
    #[arg(long, value_name = "SECS", global = true)]
    pub worker_timeout: Option<u64>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Keep every source fresh until interrupted with Ctrl-C
    Serve,

    /// Fetch every source once and print freshness status
    Status,

    /// Force an immediate refresh of one source
    Refresh {
        /// Source name from the config file
        #[arg(value_name = "SOURCE")]
        source: String,
    },

    /// Run one request through the stage orchestrator
    Run {
        /// Free-text query
        #[arg(long, value_name = "TEXT")]
        query: String,

        /// Explicit category; classified from the query when omitted
        #[arg(long, value_name = "CATEGORY")]
        category: Option<String>,

        /// Request parameter as key=value (repeatable)
        #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// Write the outcome to a file instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Generate a default .cadence.toml configuration file
    InitConfig,
}

/// Output format for reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in '{}'", raw));
    }
    Ok((key.to_string(), value.to_string()))
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if self.worker_timeout == Some(0) {
            return Err("Worker timeout must be at least 1 second".to_string());
        }

        match &self.command {
            Command::Run { query, .. } if query.trim().is_empty() => {
                Err("Query must not be empty".to_string())
            }
            Command::Refresh { source } if source.trim().is_empty() => {
                Err("Source name must not be empty".to_string())
            }
            _ => Ok(()),
        }
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
