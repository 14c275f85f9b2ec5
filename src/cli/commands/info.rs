//! Info command - show worker identity and layout

use crate::config::WorkerConfig;
use crate::error::LayerkeepResult;
use crate::worker::Worker;
use console::style;

/// Execute the info command
pub async fn execute(worker: &Worker, config: &WorkerConfig) -> LayerkeepResult<()> {
    println!("{}", style("Worker").bold().cyan());
    println!("  {:<14} {}", "ID:", worker.id());
    println!("  {:<14} {}", "Root:", worker.root().display());
    println!("  {:<14} {}", "Snapshotter:", worker.snapshots().driver_name());
    println!("  {:<14} {}", "Executor:", worker.executor().name());
    println!();

    println!("{}", style("Labels").bold());
    for (key, value) in worker.labels() {
        println!("  {} = {}", style(key).dim(), value);
    }
    println!();

    println!("{}", style("Garbage collection").bold());
    println!("  {:<14} {} ms", "Interval:", config.gc.interval_ms);
    match config.gc.max_cycle_secs {
        0 => println!("  {:<14} none", "Deadline:"),
        secs => println!("  {:<14} {} s", "Deadline:", secs),
    }
    println!(
        "  {:<14} {}",
        "Journal:",
        if config.gc.journal {
            worker.root().join("gc.log").display().to_string()
        } else {
            style("disabled").dim().to_string()
        }
    );

    Ok(())
}
