//! Lease command - list and release leases

use crate::cli::args::{LeaseAction, LeaseArgs, OutputFormat};
use crate::error::LayerkeepResult;
use crate::index::{Lease, RefKind};
use crate::worker::Worker;
use chrono::Utc;
use console::style;

/// Execute the lease command
pub async fn execute(args: LeaseArgs, worker: &Worker) -> LayerkeepResult<()> {
    match args.action {
        LeaseAction::List { namespace, format } => {
            let leases = match namespace {
                Some(ns) => worker.leases().list_in(&ns).await,
                None => worker.leases().list().await,
            };
            list_leases(&leases, format)
        }
        LeaseAction::Release { id } => {
            worker.leases().release(&id).await?;
            println!("{} Released lease {}", style("✓").green(), id);
            Ok(())
        }
    }
}

fn list_leases(leases: &[Lease], format: OutputFormat) -> LayerkeepResult<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(leases)?);
        }
        OutputFormat::Table => {
            if leases.is_empty() {
                println!("No leases found.");
                return Ok(());
            }
            print_table(leases);
        }
    }
    Ok(())
}

fn print_table(leases: &[Lease]) {
    let now = Utc::now();

    println!(
        "{:<38} {:<12} {:<18} {:>6} {:>6} {:>6}",
        style("ID").bold(),
        style("NAMESPACE").bold(),
        style("CREATED").bold(),
        style("BLOBS").bold(),
        style("SNAPS").bold(),
        style("RECS").bold()
    );
    println!("{}", "-".repeat(91));

    for lease in leases {
        let id = if lease.is_expired(now) {
            style(format!("{} (expired)", lease.id)).dim().to_string()
        } else {
            lease.id.clone()
        };

        println!(
            "{:<38} {:<12} {:<18} {:>6} {:>6} {:>6}",
            id,
            lease.namespace,
            lease.created_at.format("%Y-%m-%d %H:%M"),
            lease.refs(RefKind::Blob).count(),
            lease.refs(RefKind::Snapshot).count(),
            lease.refs(RefKind::Record).count()
        );
    }

    println!();
    println!("Total: {} lease(s)", leases.len());
}
