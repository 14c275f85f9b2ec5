//! Gc command - run a collection cycle now

use crate::cli::args::{GcArgs, OutputFormat};
use crate::cli::commands::du::format_bytes;
use crate::error::LayerkeepResult;
use crate::worker::Worker;
use console::style;

/// Execute the gc command
pub async fn execute(args: GcArgs, worker: &Worker) -> LayerkeepResult<()> {
    let stats = worker.collect_now().await?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
        OutputFormat::Table => {
            let removed = stats.snapshots_removed + stats.blobs_removed + stats.orphans_removed;
            if removed == 0 && stats.leases_expired == 0 {
                println!("Nothing to collect.");
            } else {
                println!(
                    "{} Removed {} snapshot(s), {} blob(s), {} orphaned file(s)",
                    style("✓").green(),
                    stats.snapshots_removed,
                    stats.blobs_removed,
                    stats.orphans_removed
                );
                if stats.leases_expired > 0 {
                    println!("  Expired {} lease(s)", stats.leases_expired);
                }
                println!("  Reclaimed {}", format_bytes(stats.bytes_reclaimed));
            }
            if stats.skipped > 0 {
                println!(
                    "  {}",
                    style(format!(
                        "{} resource(s) changed during the cycle and were kept",
                        stats.skipped
                    ))
                    .dim()
                );
            }
        }
    }
    Ok(())
}
