//! Du command - disk usage of the worker store

use crate::cli::args::{DuArgs, OutputFormat};
use crate::error::{LayerkeepError, LayerkeepResult};
use crate::index::SnapshotKind;
use crate::worker::Worker;
use console::style;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Default, Serialize)]
struct Usage {
    blobs: usize,
    blob_bytes: u64,
    snapshots_committed: usize,
    snapshots_active: usize,
    snapshot_bytes: u64,
    leases: usize,
}

/// Execute the du command
pub async fn execute(args: DuArgs, worker: &Worker) -> LayerkeepResult<()> {
    let content = worker.content().usage().await;
    let snapshots = worker.snapshots().list().await;

    let mut usage = Usage {
        blobs: content.blobs,
        blob_bytes: content.bytes,
        leases: worker.leases().list().await.len(),
        ..Default::default()
    };

    let mut layers = Vec::with_capacity(snapshots.len());
    for snapshot in &snapshots {
        match snapshot.kind {
            SnapshotKind::Committed => usage.snapshots_committed += 1,
            SnapshotKind::Active => usage.snapshots_active += 1,
        }
        layers.push(worker.snapshots().mount_path(&snapshot.key).await?);
    }

    usage.snapshot_bytes = tokio::task::spawn_blocking(move || {
        layers.iter().map(|path| dir_size(path)).sum::<LayerkeepResult<u64>>()
    })
    .await
    .map_err(|e| LayerkeepError::Internal(format!("measuring snapshot layers: {}", e)))??;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&usage)?),
        OutputFormat::Table => print_table(&usage),
    }
    Ok(())
}

fn print_table(usage: &Usage) {
    println!(
        "{:<12} {:>8} {:>12}",
        style("KIND").bold(),
        style("COUNT").bold(),
        style("SIZE").bold()
    );
    println!("{}", "-".repeat(34));
    println!(
        "{:<12} {:>8} {:>12}",
        "blobs",
        usage.blobs,
        format_bytes(usage.blob_bytes)
    );
    println!(
        "{:<12} {:>8} {:>12}",
        "snapshots",
        usage.snapshots_committed + usage.snapshots_active,
        format_bytes(usage.snapshot_bytes)
    );
    if usage.snapshots_active > 0 {
        println!(
            "  {}",
            style(format!("{} active", usage.snapshots_active)).dim()
        );
    }
    println!();
    println!("{} lease(s)", usage.leases);
}

/// Total size of regular files under `path`; a missing path counts as empty
fn dir_size(path: &Path) -> LayerkeepResult<u64> {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(LayerkeepError::io(format!("reading {}", path.display()), e)),
    };

    let mut total = 0;
    for entry in entries {
        let entry = entry.map_err(|e| LayerkeepError::io(format!("reading {}", path.display()), e))?;
        let meta = entry
            .metadata()
            .map_err(|e| LayerkeepError::io(format!("stat {}", entry.path().display()), e))?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else if meta.is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
