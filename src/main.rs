//! Layerkeep - build-cache storage maintenance
//!
//! CLI entry point that opens the worker store and dispatches to subcommands.

use clap::Parser;
use console::style;
use layerkeep::cli::args::LogFormat;
use layerkeep::cli::{Cli, Commands};
use layerkeep::config::ConfigManager;
use layerkeep::error::LayerkeepResult;
use layerkeep::executor::StorageOnlyExecutor;
use layerkeep::snapshot::SnapshotterFactory;
use layerkeep::Worker;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> LayerkeepResult<()> {
    let cli = Cli::parse();

    // 0 = warn, 1 = info, 2+ = debug
    let filter = match cli.verbose {
        0 => EnvFilter::new("layerkeep=warn"),
        1 => EnvFilter::new("layerkeep=info"),
        _ => EnvFilter::new("layerkeep=debug"),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match cli.log_format {
        LogFormat::Text => subscriber.without_time().init(),
        LogFormat::Json => subscriber.json().init(),
    }

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };

    let mut config = config_manager.load().await?;
    if let Some(root) = cli.root {
        debug!("Storage root overridden: {}", root.display());
        config.root = root;
    }

    let snapshotter = SnapshotterFactory::by_name(&config.snapshotter)?;
    let worker = Worker::open(&config, &snapshotter, &StorageOnlyExecutor::factory()).await?;

    match cli.command {
        Commands::Info => layerkeep::cli::commands::info(&worker, &config).await,
        Commands::Du(args) => layerkeep::cli::commands::du(args, &worker).await,
        Commands::Gc(args) => layerkeep::cli::commands::gc(args, &worker).await,
        Commands::Lease(args) => layerkeep::cli::commands::lease(args, &worker).await,
    }
}
