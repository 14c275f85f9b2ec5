//! Garbage collection
//!
//! A cycle runs in four steps:
//!
//! 1. Drop expired leases.
//! 2. Scan: take a point-in-time view of the index and metadata store and
//!    compute the reachable set. A snapshot anywhere in the index whose
//!    parent is missing aborts the cycle here, before anything is deleted.
//! 3. Sweep: delete unreachable snapshots (children before parents), then
//!    unreachable blobs. Each deletion is its own transaction and
//!    re-validates against the live index, recomputing reachability if
//!    anything changed since the scan. Resources written after the scan
//!    started are left for the next cycle.
//! 4. Remove on-disk files that have no index record.
//!
//! Stopping between any two deletions leaves the store consistent; a
//! failed or cancelled cycle is simply retried by the next trigger.

pub mod journal;
pub mod reachability;
pub mod throttle;

pub use journal::GcJournal;
pub use reachability::Reachable;
pub use throttle::{GcTrigger, Throttle};

use crate::content::ContentStore;
use crate::digest::Digest;
use crate::error::{LayerkeepError, LayerkeepResult};
use crate::index::{Index, IndexState};
use crate::lease::LeaseRegistry;
use crate::metadata::{MetadataState, MetadataStore};
use crate::snapshot::SnapshotTree;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Outcome of one collection cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    pub snapshots_removed: usize,
    pub blobs_removed: usize,
    pub leases_expired: usize,
    pub orphans_removed: usize,
    pub bytes_reclaimed: u64,
    /// Unreachable resources left alone because they changed after the scan
    pub skipped: usize,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Reachability as of a known index/metadata generation
struct Validator {
    scan_generation: u64,
    /// Committed index generation `reachable` reflects
    index_generation: u64,
    metadata_generation: u64,
    now: DateTime<Utc>,
    reachable: Reachable,
}

impl Validator {
    fn new(index: &IndexState, metadata: &MetadataState, now: DateTime<Utc>) -> LayerkeepResult<Self> {
        Ok(Self {
            scan_generation: index.generation,
            index_generation: index.generation,
            metadata_generation: metadata.generation,
            now,
            reachable: reachability::compute(index, metadata, now)?,
        })
    }

    /// Bring the reachable set up to date with the live state
    ///
    /// Called from inside a transaction, which has already advanced the
    /// index generation by one past the committed state it started from.
    fn refresh(&mut self, index: &IndexState, metadata: &MetadataState) -> LayerkeepResult<()> {
        let base = index.generation.saturating_sub(1);
        if base != self.index_generation || metadata.generation != self.metadata_generation {
            debug!(
                "Index changed during GC, recomputing reachability at generation {}",
                base
            );
            self.reachable = reachability::compute(index, metadata, self.now)?;
            self.metadata_generation = metadata.generation;
        }
        self.index_generation = base;
        Ok(())
    }

    /// Account for a deletion this cycle committed
    ///
    /// Removing an unreachable resource leaves the reachable set unchanged.
    fn committed(&mut self) {
        self.index_generation += 1;
    }

    fn written_after_scan(&self, touched: u64) -> bool {
        touched > self.scan_generation
    }
}

/// Deletes everything no active lease keeps alive
pub struct GarbageCollector {
    index: Arc<Index>,
    metadata: Arc<MetadataStore>,
    content: ContentStore,
    snapshots: SnapshotTree,
    leases: LeaseRegistry,
    journal: GcJournal,
    max_cycle: Option<Duration>,
    cycle: Mutex<()>,
}

impl GarbageCollector {
    pub fn new(
        index: Arc<Index>,
        metadata: Arc<MetadataStore>,
        content: ContentStore,
        snapshots: SnapshotTree,
        leases: LeaseRegistry,
        journal: GcJournal,
    ) -> Self {
        Self {
            index,
            metadata,
            content,
            snapshots,
            leases,
            journal,
            max_cycle: None,
            cycle: Mutex::new(()),
        }
    }

    /// Bound each cycle by `limit`
    pub fn with_deadline(mut self, limit: Option<Duration>) -> Self {
        self.max_cycle = limit;
        self
    }

    /// Run one cycle now
    ///
    /// Cycles never overlap; a call made while one runs waits for it.
    pub async fn collect(&self) -> LayerkeepResult<GcStats> {
        let _cycle = self.cycle.lock().await;
        let started = Instant::now();

        let result = match self.max_cycle {
            Some(limit) => tokio::time::timeout(limit, self.run_cycle())
                .await
                .unwrap_or_else(|_| {
                    Err(LayerkeepError::GcCycle(format!(
                        "deadline of {:?} exceeded",
                        limit
                    )))
                }),
            None => self.run_cycle().await,
        };

        match result {
            Ok(mut stats) => {
                stats.duration = started.elapsed();
                info!(
                    "GC removed {} snapshot(s), {} blob(s), {} orphan(s), {} bytes in {:?}",
                    stats.snapshots_removed,
                    stats.blobs_removed,
                    stats.orphans_removed,
                    stats.bytes_reclaimed,
                    stats.duration
                );
                self.journal
                    .record("gc.completed", &serde_json::to_value(&stats)?)
                    .await;
                Ok(stats)
            }
            Err(e) => {
                error!("GC cycle aborted: {}", e);
                self.journal
                    .record(
                        "gc.failed",
                        &serde_json::json!({ "error": e.to_string() }),
                    )
                    .await;
                Err(e)
            }
        }
    }

    /// Run a cycle and log failures; used by the throttle task
    pub async fn collect_logged(&self) {
        if let Err(e) = self.collect().await {
            debug!("Throttled GC cycle failed, will retry on next trigger: {}", e);
        }
    }

    async fn run_cycle(&self) -> LayerkeepResult<GcStats> {
        let mut stats = GcStats::default();
        let now = Utc::now();

        stats.leases_expired = self.leases.expire(now).await?;

        let (mut validator, snapshot_candidates, blob_candidates) = {
            let md = self.metadata.read().await;
            let index = self.index.read().await;
            let validator = Validator::new(&index, &md, now)?;

            let mut snapshots: Vec<(usize, String)> = Vec::new();
            for key in index
                .snapshots
                .keys()
                .filter(|k| !validator.reachable.contains_snapshot(k))
            {
                let depth = index
                    .ancestors(key)
                    .inspect_err(|e| error!("Refusing to collect: {}", e))?
                    .len();
                snapshots.push((depth, key.clone()));
            }
            // Deepest first so children go before their parents.
            snapshots.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

            let blobs: Vec<Digest> = index
                .blobs
                .keys()
                .filter(|d| !validator.reachable.contains_blob(d))
                .cloned()
                .collect();

            (validator, snapshots, blobs)
        };

        debug!(
            "GC scan at generation {}: {} snapshot(s) and {} blob(s) unreachable",
            validator.scan_generation,
            snapshot_candidates.len(),
            blob_candidates.len()
        );

        for (_, key) in &snapshot_candidates {
            let removed = self
                .snapshots
                .remove_if(key, |state, md, record| {
                    validator.refresh(state, md)?;
                    if validator.reachable.contains_snapshot(key)
                        || validator.written_after_scan(record.touched)
                    {
                        return Ok(false);
                    }
                    if let Some(child) = state.children(key).first() {
                        warn!("Keeping unreachable snapshot {}: child {} still exists", key, child);
                        return Ok(false);
                    }
                    Ok(true)
                })
                .await;

            match removed {
                Ok(true) => {
                    validator.committed();
                    stats.snapshots_removed += 1;
                }
                Ok(false) => stats.skipped += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    return Err(LayerkeepError::GcCycle(format!(
                        "removing snapshot {}: {}",
                        key, e
                    )))
                }
            }
        }

        for digest in &blob_candidates {
            let freed = self
                .content
                .remove_if(digest, |state, md, record| {
                    validator.refresh(state, md)?;
                    if validator.reachable.contains_blob(digest)
                        || validator.written_after_scan(record.touched)
                    {
                        return Ok(false);
                    }
                    if let Some(user) = state.snapshots_using(digest).first() {
                        debug!("Keeping blob {}: used by snapshot {}", digest, user);
                        return Ok(false);
                    }
                    Ok(true)
                })
                .await;

            match freed {
                Ok(Some(size)) => {
                    validator.committed();
                    stats.blobs_removed += 1;
                    stats.bytes_reclaimed += size;
                }
                Ok(None) => stats.skipped += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    return Err(LayerkeepError::GcCycle(format!(
                        "removing blob {}: {}",
                        digest, e
                    )))
                }
            }
        }

        stats.orphans_removed += self
            .snapshots
            .sweep_orphans()
            .await
            .map_err(|e| LayerkeepError::GcCycle(format!("sweeping snapshot layers: {}", e)))?;
        stats.orphans_removed += self
            .content
            .sweep_orphans()
            .await
            .map_err(|e| LayerkeepError::GcCycle(format!("sweeping content files: {}", e)))?;

        Ok(stats)
    }
}
