//! Command line argument parsing for the partindex CLI using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

/// partindex - build and maintain vector indices of table parts
#[derive(Parser, Debug, Clone)]
#[command(name = "partindex")]
#[command(about = "Build and maintain vector indices of immutable table parts")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = None)]
pub struct PartIndexArgs {
    /// Verbosity level (0=quiet, 1=normal, 2=verbose, 3=debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (overrides verbose)
    #[arg(short, long)]
    pub quiet: bool,

    /// Builder settings file (JSON)
    #[arg(short, long, value_name = "CONFIG_FILE", env = "PARTINDEX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(short = 'f', long = "format", default_value = "human")]
    pub output_format: OutputFormat,

    /// Pretty-print JSON output
    #[arg(long)]
    pub pretty: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

impl PartIndexArgs {
    /// Get the effective verbosity level
    pub fn verbosity(&self) -> u8 {
        if self.quiet {
            0
        } else {
            match self.verbose {
                0 => 1,
                n => n,
            }
        }
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Show parts and the state of their vector indices
    Status(StatusArgs),

    /// Build missing vector indices
    Build(BuildArgs),

    /// Remove files of dropped vector indices
    Reap(ReapArgs),

    /// Verify part files against their checksum manifests
    Verify(VerifyArgs),
}

/// Arguments for showing table status
#[derive(Parser, Debug, Clone)]
pub struct StatusArgs {
    /// Path to the table directory
    #[arg(value_name = "TABLE_PATH")]
    pub table_path: PathBuf,
}

/// Arguments for building indices
#[derive(Parser, Debug, Clone)]
pub struct BuildArgs {
    /// Path to the table directory
    #[arg(value_name = "TABLE_PATH")]
    pub table_path: PathBuf,

    /// Only build this index
    #[arg(short, long, value_name = "NAME")]
    pub index: Option<String>,

    /// Only build on this part
    #[arg(short, long, value_name = "PART")]
    pub part: Option<String>,

    /// Prefer slow-mode parts
    #[arg(long)]
    pub slow: bool,

    /// Stop after this many builds
    #[arg(long, default_value = "1000")]
    pub max_builds: usize,
}

/// Arguments for removing dropped indices
#[derive(Parser, Debug, Clone)]
pub struct ReapArgs {
    /// Path to the table directory
    #[arg(value_name = "TABLE_PATH")]
    pub table_path: PathBuf,
}

/// Arguments for verifying parts
#[derive(Parser, Debug, Clone)]
pub struct VerifyArgs {
    /// Path to the table directory
    #[arg(value_name = "TABLE_PATH")]
    pub table_path: PathBuf,

    /// Only verify this part
    #[arg(value_name = "PART")]
    pub part: Option<String>,
}

/// Output formats for CLI
#[derive(ValueEnum, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output
    Json,
}
