//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Layerkeep - build-cache storage maintenance
///
/// Inspects and garbage-collects the blob store, snapshot tree and leases
/// of a build worker.
#[derive(Parser, Debug)]
#[command(name = "layerkeep")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "LAYERKEEP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Storage root (overrides the config file)
    #[arg(long, global = true, env = "LAYERKEEP_ROOT")]
    pub root: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show worker identity, labels and storage paths
    Info,

    /// Show disk usage of content and snapshots
    Du(DuArgs),

    /// Run a garbage collection cycle now
    Gc(GcArgs),

    /// Manage leases
    Lease(LeaseArgs),
}

/// Arguments for the du command
#[derive(Parser, Debug)]
pub struct DuArgs {
    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the gc command
#[derive(Parser, Debug)]
pub struct GcArgs {
    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the lease command
#[derive(Parser, Debug)]
pub struct LeaseArgs {
    /// Subcommand for lease
    #[command(subcommand)]
    pub action: LeaseAction,
}

/// Lease subcommands
#[derive(Subcommand, Debug)]
pub enum LeaseAction {
    /// List leases
    List {
        /// Only show leases in this namespace
        #[arg(short, long)]
        namespace: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Release a lease and everything it holds
    Release {
        /// Lease ID
        id: String,
    },
}

/// Output format for listing commands
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
}

/// Log line format
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}
