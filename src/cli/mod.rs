//! CLI module for virtbench
//!
//! Argument parsing, console output and the workload subcommands.

pub mod commands;
pub mod output;
pub mod progress;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// virtbench - resource-lifecycle benchmarks for KubeVirt
///
/// Creates, migrates and stresses VMs in parallel and reports how long each
/// lifecycle step took.
#[derive(Parser, Debug, Clone)]
#[command(name = "virtbench")]
#[command(author = "virtbench Contributors")]
#[command(version)]
#[command(about = "Resource-lifecycle benchmarks for KubeVirt", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[arg(long, global = true, default_value = "human")]
    pub output: OutputFormat,

    /// Path to configuration file
    #[arg(short = 'c', long, global = true, env = "VIRTBENCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Directory for result files
    #[arg(long, global = true)]
    pub results_dir: Option<PathBuf>,

    /// Kubeconfig to use instead of the default lookup
    #[arg(long, global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context
    #[arg(long, global = true)]
    pub context: Option<String>,

    /// Append logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

/// Output format for CLI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output with colors
    #[default]
    Human,
    /// JSON summary on stdout
    Json,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Create VMs across namespaces and time them to Running
    Creation(commands::creation::CreationArgs),

    /// Live-migrate VMs and compare observed with control-plane durations
    Migration(commands::migration::MigrationArgs),

    /// Add VMs until the cluster stops scheduling them
    Capacity(commands::capacity::CapacityArgs),

    /// Time VM instances back to Ready after a node failure
    Recovery(commands::recovery::RecoveryArgs),

    /// Delete benchmark namespaces
    Cleanup(commands::cleanup::CleanupArgs),
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Get the effective verbosity level (0-3)
    pub fn verbosity(&self) -> u8 {
        self.verbose.min(3)
    }

    /// Check if JSON output is requested
    pub fn is_json(&self) -> bool {
        matches!(self.output, OutputFormat::Json)
    }
}

/// Duration argument: bare seconds (`30`) or humantime (`30s`, `2m`).
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }
    humantime::parse_duration(value.trim())
        .map_err(|e| format!("invalid duration '{}': {}", value, e))
}
