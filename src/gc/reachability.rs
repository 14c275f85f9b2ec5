//! Reachability closure
//!
//! Roots are the direct references of every unexpired lease. The closure
//! follows three edge sets: lease → resource, snapshot → parent and
//! snapshot → diff blobs. Leased metadata records contribute the snapshot
//! and blobs they resolve to.

use crate::digest::Digest;
use crate::error::{LayerkeepError, LayerkeepResult};
use crate::index::{IndexState, RefKind};
use crate::metadata::MetadataState;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use tracing::debug;

/// Resources kept alive by active leases
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reachable {
    pub snapshots: BTreeSet<String>,
    pub blobs: BTreeSet<Digest>,
}

impl Reachable {
    pub fn contains_snapshot(&self, key: &str) -> bool {
        self.snapshots.contains(key)
    }

    pub fn contains_blob(&self, digest: &Digest) -> bool {
        self.blobs.contains(digest)
    }
}

/// Compute the reachable set
///
/// Fails with `BrokenChain` if a reachable snapshot names a parent that is
/// not in the index.
pub fn compute(
    index: &IndexState,
    metadata: &MetadataState,
    now: DateTime<Utc>,
) -> LayerkeepResult<Reachable> {
    let mut reachable = Reachable::default();
    let mut pending: Vec<String> = Vec::new();

    for lease in index.leases.values().filter(|l| !l.is_expired(now)) {
        pending.extend(lease.refs(RefKind::Snapshot).cloned());

        for id in lease.refs(RefKind::Blob) {
            match id.parse::<Digest>() {
                Ok(digest) => {
                    reachable.blobs.insert(digest);
                }
                Err(_) => debug!("Lease {} holds malformed blob ref {}", lease.id, id),
            }
        }

        for key in lease.refs(RefKind::Record) {
            if let Some(record) = metadata.records.get(key) {
                pending.extend(record.snapshot.iter().cloned());
                reachable.blobs.extend(record.blobs.iter().cloned());
            }
        }
    }

    while let Some(key) = pending.pop() {
        if !reachable.snapshots.insert(key.clone()) {
            continue;
        }

        let Some(snapshot) = index.snapshots.get(&key) else {
            // A lease may name a snapshot that was never created.
            reachable.snapshots.remove(&key);
            continue;
        };

        reachable.blobs.extend(snapshot.diff.iter().cloned());

        if let Some(parent) = &snapshot.parent {
            if !index.snapshots.contains_key(parent) {
                return Err(LayerkeepError::BrokenChain {
                    snapshot: key,
                    parent: parent.clone(),
                });
            }
            pending.push(parent.clone());
        }
    }

    Ok(reachable)
}
