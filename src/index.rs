//! Lease, content and snapshot index
//!
//! The index is the single durable record of which blobs and snapshots
//! exist and which leases reference them. Every mutation runs as a
//! transaction: it is applied to a copy of the state, persisted, and only
//! then made visible. Each transaction bumps `generation`, which the
//! garbage collector uses to detect changes made after its scan started.

use crate::digest::Digest;
use crate::error::{LayerkeepError, LayerkeepResult};
use crate::persist;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::debug;

/// Kind of resource a lease can reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    /// Content store blob, keyed by digest
    Blob,
    /// Snapshot, keyed by snapshot key
    Snapshot,
    /// Metadata record, keyed by cache key
    Record,
}

impl std::fmt::Display for RefKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blob => write!(f, "blob"),
            Self::Snapshot => write!(f, "snapshot"),
            Self::Record => write!(f, "record"),
        }
    }
}

/// Stored blob
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobRecord {
    pub size: u64,
    pub created_at: DateTime<Utc>,
    /// Generation of the last write of this content
    pub touched: u64,
}

/// Snapshot lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    /// Mutable working layer
    Active,
    /// Immutable, may be used as a parent
    Committed,
}

/// Stored snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub parent: Option<String>,
    pub diff: Vec<Digest>,
    pub kind: SnapshotKind,
    pub created_at: DateTime<Utc>,
    pub touched: u64,
}

/// A named holder of references
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub id: String,
    pub namespace: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: BTreeMap<RefKind, BTreeSet<String>>,
}

impl Lease {
    /// Whether the lease has passed its expiry time
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Whether the lease directly references `id`
    pub fn references(&self, kind: RefKind, id: &str) -> bool {
        self.resources.get(&kind).is_some_and(|ids| ids.contains(id))
    }

    /// Referenced ids of one kind
    pub fn refs(&self, kind: RefKind) -> impl Iterator<Item = &String> {
        self.resources.get(&kind).into_iter().flatten()
    }

    /// Total number of references held
    pub fn reference_count(&self) -> usize {
        self.resources.values().map(BTreeSet::len).sum()
    }
}

/// Full index contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexState {
    pub generation: u64,
    pub blobs: BTreeMap<Digest, BlobRecord>,
    pub snapshots: BTreeMap<String, SnapshotRecord>,
    pub leases: BTreeMap<String, Lease>,
}

impl IndexState {
    /// Keys of snapshots whose parent is `key`
    pub fn children(&self, key: &str) -> BTreeSet<String> {
        self.snapshots
            .iter()
            .filter(|(_, s)| s.parent.as_deref() == Some(key))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Parent chain of `key`, nearest first
    pub fn ancestors(&self, key: &str) -> LayerkeepResult<Vec<String>> {
        let mut chain = Vec::new();
        let mut current = self
            .snapshots
            .get(key)
            .ok_or_else(|| LayerkeepError::SnapshotNotFound(key.to_string()))?;
        let mut child = key;

        while let Some(parent) = current.parent.as_deref() {
            current = self
                .snapshots
                .get(parent)
                .ok_or_else(|| LayerkeepError::BrokenChain {
                    snapshot: child.to_string(),
                    parent: parent.to_string(),
                })?;
            chain.push(parent.to_string());
            child = parent;
        }

        Ok(chain)
    }

    /// Snapshots whose diff references `digest`
    pub fn snapshots_using(&self, digest: &Digest) -> Vec<&str> {
        self.snapshots
            .iter()
            .filter(|(_, s)| s.diff.contains(digest))
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Unexpired leases referencing a resource
    pub fn leases_referencing(&self, kind: RefKind, id: &str, now: DateTime<Utc>) -> Vec<&str> {
        self.leases
            .values()
            .filter(|l| !l.is_expired(now) && l.references(kind, id))
            .map(|l| l.id.as_str())
            .collect()
    }

    /// Mark a resource as written at the current generation
    pub fn touch(&mut self, kind: RefKind, id: &str) {
        let generation = self.generation;
        match kind {
            RefKind::Blob => {
                if let Some(blob) = id
                    .parse::<Digest>()
                    .ok()
                    .and_then(|d| self.blobs.get_mut(&d))
                {
                    blob.touched = generation;
                }
            }
            RefKind::Snapshot => {
                if let Some(snapshot) = self.snapshots.get_mut(id) {
                    snapshot.touched = generation;
                }
            }
            RefKind::Record => {}
        }
    }
}

/// Durable, transactional index
pub struct Index {
    path: PathBuf,
    state: RwLock<IndexState>,
}

impl Index {
    /// Open the index at `path`, starting empty if the file does not exist
    pub async fn open(path: &Path) -> LayerkeepResult<Self> {
        let state: IndexState = persist::load_json(path).await?.unwrap_or_default();
        debug!(
            "Opened index {} at generation {} ({} blobs, {} snapshots, {} leases)",
            path.display(),
            state.generation,
            state.blobs.len(),
            state.snapshots.len(),
            state.leases.len()
        );

        Ok(Self {
            path: path.to_path_buf(),
            state: RwLock::new(state),
        })
    }

    /// Shared read access to the current state
    pub async fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().await
    }

    /// Run a transaction
    ///
    /// `f` sees a copy of the state with `generation` already advanced. If
    /// it fails or the result cannot be persisted, no change is visible.
    pub async fn update<T, F>(&self, f: F) -> LayerkeepResult<T>
    where
        F: FnOnce(&mut IndexState) -> LayerkeepResult<T>,
    {
        let mut guard = self.state.write().await;
        let mut next = guard.clone();
        next.generation += 1;

        let out = f(&mut next)?;
        persist::save_json(&self.path, &next).await?;
        *guard = next;

        Ok(out)
    }

    /// Run a transaction that may turn out to change nothing
    ///
    /// `f` returns its output and whether it modified the state. When it
    /// did not, the copy is dropped without being written and the
    /// generation stays where it was.
    pub async fn update_if_changed<T, F>(&self, f: F) -> LayerkeepResult<T>
    where
        F: FnOnce(&mut IndexState) -> LayerkeepResult<(T, bool)>,
    {
        let mut guard = self.state.write().await;
        let mut next = guard.clone();
        next.generation += 1;

        let (out, changed) = f(&mut next)?;
        if changed {
            persist::save_json(&self.path, &next).await?;
            *guard = next;
        }

        Ok(out)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn snapshot(parent: Option<&str>) -> SnapshotRecord {
        SnapshotRecord {
            parent: parent.map(str::to_string),
            diff: vec![],
            kind: SnapshotKind::Committed,
            created_at: Utc::now(),
            touched: 0,
        }
    }

    #[test]
    fn ancestors_walks_to_root() {
        let mut state = IndexState::default();
        state.snapshots.insert("a".to_string(), snapshot(None));
        state.snapshots.insert("b".to_string(), snapshot(Some("a")));
        state.snapshots.insert("c".to_string(), snapshot(Some("b")));

        assert_eq!(state.ancestors("c").unwrap(), vec!["b", "a"]);
        assert!(state.ancestors("a").unwrap().is_empty());
        assert_eq!(state.children("a"), BTreeSet::from(["b".to_string()]));
    }

    #[test]
    fn ancestors_reports_broken_chain() {
        let mut state = IndexState::default();
        state.snapshots.insert("b".to_string(), snapshot(Some("gone")));

        let err = state.ancestors("b").unwrap_err();
        assert!(matches!(
            err,
            LayerkeepError::BrokenChain { ref snapshot, ref parent } if snapshot == "b" && parent == "gone"
        ));
    }

    #[test]
    fn expired_leases_do_not_reference() {
        let now = Utc::now();
        let mut lease = Lease {
            id: "l1".to_string(),
            namespace: "ns".to_string(),
            created_at: now,
            expires_at: Some(now - chrono::Duration::seconds(1)),
            labels: BTreeMap::new(),
            resources: BTreeMap::new(),
        };
        lease
            .resources
            .entry(RefKind::Snapshot)
            .or_default()
            .insert("s".to_string());

        let mut state = IndexState::default();
        state.leases.insert("l1".to_string(), lease);

        assert!(state
            .leases_referencing(RefKind::Snapshot, "s", now)
            .is_empty());
    }

    #[tokio::test]
    async fn failed_transaction_leaves_state_untouched() {
        let dir = TempDir::new().unwrap();
        let index = Index::open(&dir.path().join("index.json")).await.unwrap();

        let result: LayerkeepResult<()> = index
            .update(|state| {
                state.snapshots.insert("a".to_string(), snapshot(None));
                Err(LayerkeepError::Internal("abort".to_string()))
            })
            .await;

        assert!(result.is_err());
        let state = index.read().await;
        assert_eq!(state.generation, 0);
        assert!(state.snapshots.is_empty());
    }

    #[tokio::test]
    async fn unchanged_transaction_is_not_written() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.json");
        let index = Index::open(&path).await.unwrap();

        let seen = index
            .update_if_changed(|state| Ok((state.generation, false)))
            .await
            .unwrap();
        assert_eq!(seen, 1);
        assert_eq!(index.read().await.generation, 0);
        assert!(!path.exists());

        index
            .update_if_changed(|state| {
                state.snapshots.insert("a".to_string(), snapshot(None));
                Ok(((), true))
            })
            .await
            .unwrap();
        assert_eq!(index.read().await.generation, 1);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn committed_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.json");

        let index = Index::open(&path).await.unwrap();
        index
            .update(|state| {
                state.snapshots.insert("a".to_string(), snapshot(None));
                Ok(())
            })
            .await
            .unwrap();
        drop(index);

        let reopened = Index::open(&path).await.unwrap();
        let state = reopened.read().await;
        assert_eq!(state.generation, 1);
        assert!(state.snapshots.contains_key("a"));
    }
}
