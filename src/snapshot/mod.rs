//! Snapshot tree
//!
//! Layered filesystem states forming a forest. Every snapshot names an
//! optional parent that already exists, so cycles cannot be built. A
//! snapshot starts either committed (`create`) or as a mutable working
//! layer (`prepare`) that `commit` turns into an immutable one.
//!
//! # Lifecycle
//!
//! | Kind | Parent of others | Created by |
//! |------|------------------|------------|
//! | Active | no | `prepare` |
//! | Committed | yes | `create`, `commit` |

pub mod driver;
pub mod native;

pub use driver::{Snapshotter, SnapshotterFactory};
pub use native::NativeSnapshotter;

use crate::digest::Digest;
use crate::error::{LayerkeepError, LayerkeepResult, ResourceKind};
use crate::gc::reachability;
use crate::gc::GcTrigger;
use crate::index::{Index, IndexState, RefKind, SnapshotKind, SnapshotRecord};
use crate::locks::KeyedLocks;
use crate::metadata::{MetadataState, MetadataStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Public view of a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub key: String,
    pub parent: Option<String>,
    pub kind: SnapshotKind,
    pub diff: Vec<Digest>,
    pub created_at: DateTime<Utc>,
}

impl SnapshotInfo {
    fn from_record(key: &str, record: &SnapshotRecord) -> Self {
        Self {
            key: key.to_string(),
            parent: record.parent.clone(),
            kind: record.kind,
            diff: record.diff.clone(),
            created_at: record.created_at,
        }
    }
}

struct Inner {
    driver: Arc<dyn Snapshotter>,
    index: Arc<Index>,
    metadata: Arc<MetadataStore>,
    locks: KeyedLocks<String>,
    gc: GcTrigger,
}

/// Snapshot bookkeeping over a pluggable driver
#[derive(Clone)]
pub struct SnapshotTree {
    inner: Arc<Inner>,
}

impl SnapshotTree {
    pub fn new(
        driver: Arc<dyn Snapshotter>,
        index: Arc<Index>,
        metadata: Arc<MetadataStore>,
        gc: GcTrigger,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                driver,
                index,
                metadata,
                locks: KeyedLocks::new(),
                gc,
            }),
        }
    }

    /// Name of the underlying driver
    pub fn driver_name(&self) -> &str {
        self.inner.driver.name()
    }

    /// Create a committed snapshot of `diff` on top of `parent`
    pub async fn create(
        &self,
        key: &str,
        parent: Option<&str>,
        diff: &[Digest],
    ) -> LayerkeepResult<String> {
        self.insert(key, parent, diff, SnapshotKind::Committed, None)
            .await?;
        Ok(key.to_string())
    }

    /// Create a committed snapshot already referenced by `lease`
    pub async fn create_with_lease(
        &self,
        lease: &str,
        key: &str,
        parent: Option<&str>,
        diff: &[Digest],
    ) -> LayerkeepResult<String> {
        self.insert(key, parent, diff, SnapshotKind::Committed, Some(lease))
            .await?;
        Ok(key.to_string())
    }

    /// Create a mutable working layer, returning its mount path
    pub async fn prepare(&self, key: &str, parent: Option<&str>) -> LayerkeepResult<PathBuf> {
        self.insert(key, parent, &[], SnapshotKind::Active, None)
            .await
    }

    /// Create a mutable working layer already referenced by `lease`
    pub async fn prepare_with_lease(
        &self,
        lease: &str,
        key: &str,
        parent: Option<&str>,
    ) -> LayerkeepResult<PathBuf> {
        self.insert(key, parent, &[], SnapshotKind::Active, Some(lease))
            .await
    }

    async fn insert(
        &self,
        key: &str,
        parent: Option<&str>,
        diff: &[Digest],
        kind: SnapshotKind,
        lease: Option<&str>,
    ) -> LayerkeepResult<PathBuf> {
        let _guard = self.inner.locks.lock(&key.to_string()).await;

        if self.inner.index.read().await.snapshots.contains_key(key) {
            return Err(LayerkeepError::SnapshotExists(key.to_string()));
        }

        let mount = self.inner.driver.prepare(key, parent).await?;

        let result = self
            .inner
            .index
            .update(|state| {
                let now = Utc::now();
                if state.snapshots.contains_key(key) {
                    return Err(LayerkeepError::SnapshotExists(key.to_string()));
                }
                check_lease(state, lease, now)?;
                if let Some(parent) = parent {
                    match state.snapshots.get(parent) {
                        None => return Err(LayerkeepError::SnapshotNotFound(parent.to_string())),
                        Some(p) if p.kind != SnapshotKind::Committed => {
                            return Err(LayerkeepError::SnapshotNotCommitted(parent.to_string()))
                        }
                        Some(_) => {}
                    }
                }
                if let Some(missing) = diff.iter().find(|d| !state.blobs.contains_key(*d)) {
                    return Err(LayerkeepError::BlobNotFound(missing.to_string()));
                }

                state.snapshots.insert(
                    key.to_string(),
                    SnapshotRecord {
                        parent: parent.map(str::to_string),
                        diff: diff.to_vec(),
                        kind,
                        created_at: now,
                        touched: state.generation,
                    },
                );
                touch_dependencies(state, parent, diff);
                add_lease_ref(state, lease, key);
                Ok(())
            })
            .await;

        if let Err(e) = result {
            if let Err(cleanup) = self.inner.driver.remove(key).await {
                warn!("Failed to clean up layer {}: {}", key, cleanup);
            }
            return Err(e);
        }

        debug!("Created {:?} snapshot {} (parent {:?})", kind, key, parent);
        Ok(mount)
    }

    /// Turn active snapshot `active` into committed snapshot `key`
    ///
    /// Leases holding `active` hold `key` afterwards.
    pub async fn commit(&self, active: &str, key: &str, diff: &[Digest]) -> LayerkeepResult<()> {
        if active == key {
            return Err(LayerkeepError::SnapshotExists(key.to_string()));
        }
        let (first, second) = if active < key { (active, key) } else { (key, active) };
        let _g1 = self.inner.locks.lock(&first.to_string()).await;
        let _g2 = self.inner.locks.lock(&second.to_string()).await;

        {
            let state = self.inner.index.read().await;
            validate_commit(&state, active, key)?;
        }

        self.inner.driver.commit(active, key).await?;

        let result = self
            .inner
            .index
            .update(|state| {
                validate_commit(state, active, key)?;
                if let Some(missing) = diff.iter().find(|d| !state.blobs.contains_key(*d)) {
                    return Err(LayerkeepError::BlobNotFound(missing.to_string()));
                }

                let working = state
                    .snapshots
                    .remove(active)
                    .ok_or_else(|| LayerkeepError::SnapshotNotFound(active.to_string()))?;
                state.snapshots.insert(
                    key.to_string(),
                    SnapshotRecord {
                        parent: working.parent.clone(),
                        diff: diff.to_vec(),
                        kind: SnapshotKind::Committed,
                        created_at: Utc::now(),
                        touched: state.generation,
                    },
                );
                touch_dependencies(state, working.parent.as_deref(), diff);

                for lease in state.leases.values_mut() {
                    if let Some(ids) = lease.resources.get_mut(&RefKind::Snapshot) {
                        if ids.remove(active) {
                            ids.insert(key.to_string());
                        }
                    }
                }
                Ok(())
            })
            .await;

        if let Err(e) = result {
            if let Err(undo) = self.inner.driver.commit(key, active).await {
                warn!("Failed to restore layer {} after failed commit: {}", active, undo);
            }
            return Err(e);
        }

        debug!("Committed snapshot {} as {}", active, key);
        Ok(())
    }

    /// Look up a snapshot
    pub async fn get(&self, key: &str) -> LayerkeepResult<SnapshotInfo> {
        self.inner
            .index
            .read()
            .await
            .snapshots
            .get(key)
            .map(|r| SnapshotInfo::from_record(key, r))
            .ok_or_else(|| LayerkeepError::SnapshotNotFound(key.to_string()))
    }

    pub async fn list(&self) -> Vec<SnapshotInfo> {
        self.inner
            .index
            .read()
            .await
            .snapshots
            .iter()
            .map(|(k, r)| SnapshotInfo::from_record(k, r))
            .collect()
    }

    /// Parent of `key`
    ///
    /// Fails with `BrokenChain` if the recorded parent no longer exists.
    pub async fn parent_of(&self, key: &str) -> LayerkeepResult<Option<String>> {
        let state = self.inner.index.read().await;
        let record = state
            .snapshots
            .get(key)
            .ok_or_else(|| LayerkeepError::SnapshotNotFound(key.to_string()))?;

        match &record.parent {
            Some(parent) if !state.snapshots.contains_key(parent) => {
                Err(LayerkeepError::BrokenChain {
                    snapshot: key.to_string(),
                    parent: parent.clone(),
                })
            }
            parent => Ok(parent.clone()),
        }
    }

    /// Direct children of `key`
    pub async fn children(&self, key: &str) -> LayerkeepResult<BTreeSet<String>> {
        let state = self.inner.index.read().await;
        if !state.snapshots.contains_key(key) {
            return Err(LayerkeepError::SnapshotNotFound(key.to_string()));
        }
        Ok(state.children(key))
    }

    /// Parent chain of `key`, nearest first
    pub async fn ancestors(&self, key: &str) -> LayerkeepResult<Vec<String>> {
        self.inner.index.read().await.ancestors(key)
    }

    /// Mount path of the layer backing `key`
    pub async fn mount_path(&self, key: &str) -> LayerkeepResult<PathBuf> {
        if !self.inner.index.read().await.snapshots.contains_key(key) {
            return Err(LayerkeepError::SnapshotNotFound(key.to_string()));
        }
        Ok(self.inner.driver.mount_path(key))
    }

    /// Remove a leaf snapshot no lease keeps alive
    ///
    /// Fails with `InUse` if it has children or is reachable from a lease.
    pub async fn remove(&self, key: &str) -> LayerkeepResult<()> {
        let now = Utc::now();
        self.remove_if(key, |state, md, _| {
            if let Some(child) = state.children(key).first() {
                return Err(LayerkeepError::in_use(
                    ResourceKind::Snapshot,
                    key,
                    format!("has child snapshot {}", child),
                ));
            }
            if let Some(lease) = state
                .leases_referencing(RefKind::Snapshot, key, now)
                .first()
            {
                return Err(LayerkeepError::in_use(
                    ResourceKind::Snapshot,
                    key,
                    format!("referenced by lease {}", lease),
                ));
            }
            if reachability::compute(state, md, now)?.contains_snapshot(key) {
                return Err(LayerkeepError::in_use(
                    ResourceKind::Snapshot,
                    key,
                    "referenced by a leased metadata record",
                ));
            }
            Ok(true)
        })
        .await?;

        info!("Removed snapshot {}", key);
        self.inner.gc.trigger();
        Ok(())
    }

    /// Remove a snapshot if `check` approves it
    ///
    /// `check` runs inside the index transaction while the snapshot key is
    /// locked. Returns whether the snapshot was removed.
    pub(crate) async fn remove_if<F>(&self, key: &str, check: F) -> LayerkeepResult<bool>
    where
        F: FnOnce(&IndexState, &MetadataState, &SnapshotRecord) -> LayerkeepResult<bool>,
    {
        let _guard = self.inner.locks.lock(&key.to_string()).await;
        let md = self.inner.metadata.read().await;

        let removed = self
            .inner
            .index
            .update_if_changed(|state| {
                let record = state
                    .snapshots
                    .get(key)
                    .cloned()
                    .ok_or_else(|| LayerkeepError::SnapshotNotFound(key.to_string()))?;
                if !check(state, &md, &record)? {
                    return Ok((false, false));
                }
                state.snapshots.remove(key);
                Ok((true, true))
            })
            .await?;
        drop(md);

        if removed {
            self.inner.driver.remove(key).await?;
            debug!("Removed layer {}", key);
        }
        Ok(removed)
    }

    /// Remove driver layers that have no index record
    pub(crate) async fn sweep_orphans(&self) -> LayerkeepResult<usize> {
        let mut removed = 0;
        for key in self.inner.driver.list().await? {
            let _guard = self.inner.locks.lock(&key).await;
            if self.inner.index.read().await.snapshots.contains_key(&key) {
                continue;
            }
            self.inner.driver.remove(&key).await?;
            debug!("Removed orphaned layer {}", key);
            removed += 1;
        }
        Ok(removed)
    }
}

fn check_lease(state: &IndexState, lease: Option<&str>, now: DateTime<Utc>) -> LayerkeepResult<()> {
    match lease {
        Some(id) if !state.leases.get(id).is_some_and(|l| !l.is_expired(now)) => {
            Err(LayerkeepError::LeaseNotFound(id.to_string()))
        }
        _ => Ok(()),
    }
}

fn add_lease_ref(state: &mut IndexState, lease: Option<&str>, key: &str) {
    if let Some(l) = lease.and_then(|id| state.leases.get_mut(id)) {
        l.resources
            .entry(RefKind::Snapshot)
            .or_default()
            .insert(key.to_string());
    }
}

/// Refresh the parent and diff blobs so an in-flight GC scan keeps them
fn touch_dependencies(state: &mut IndexState, parent: Option<&str>, diff: &[Digest]) {
    if let Some(parent) = parent {
        state.touch(RefKind::Snapshot, parent);
    }
    for digest in diff {
        state.touch(RefKind::Blob, &digest.to_string());
    }
}

fn validate_commit(state: &IndexState, active: &str, key: &str) -> LayerkeepResult<()> {
    match state.snapshots.get(active) {
        None => return Err(LayerkeepError::SnapshotNotFound(active.to_string())),
        Some(s) if s.kind != SnapshotKind::Active => {
            return Err(LayerkeepError::SnapshotNotActive(active.to_string()))
        }
        Some(_) => {}
    }
    if state.snapshots.contains_key(key) {
        return Err(LayerkeepError::SnapshotExists(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentStore;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        tree: SnapshotTree,
        content: ContentStore,
        index: Arc<Index>,
        gc: GcTrigger,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let index = Arc::new(Index::open(&dir.path().join("index.json")).await.unwrap());
        let md = Arc::new(
            MetadataStore::open(&dir.path().join("metadata.json"))
                .await
                .unwrap(),
        );
        let content = ContentStore::open(&dir.path().join("content"), index.clone(), md.clone())
            .await
            .unwrap();
        let driver = SnapshotterFactory::native()
            .create(&dir.path().join("snapshots"))
            .unwrap();
        let gc = GcTrigger::new();
        let tree = SnapshotTree::new(driver, index.clone(), md, gc.clone());
        Fixture {
            _dir: dir,
            tree,
            content,
            index,
            gc,
        }
    }

    #[tokio::test]
    async fn create_and_walk_tree() {
        let f = fixture().await;
        let d1 = f.content.put(b"base").await.unwrap();
        let d2 = f.content.put(b"top").await.unwrap();

        f.tree.create("base", None, &[d1]).await.unwrap();
        f.tree.create("top", Some("base"), &[d2]).await.unwrap();

        assert_eq!(f.tree.parent_of("top").await.unwrap().as_deref(), Some("base"));
        assert_eq!(f.tree.parent_of("base").await.unwrap(), None);
        assert_eq!(
            f.tree.children("base").await.unwrap(),
            BTreeSet::from(["top".to_string()])
        );
        assert_eq!(f.tree.ancestors("top").await.unwrap(), vec!["base".to_string()]);
    }

    #[tokio::test]
    async fn create_requires_existing_parent_and_blobs() {
        let f = fixture().await;

        let err = f.tree.create("child", Some("missing"), &[]).await.unwrap_err();
        assert!(matches!(err, LayerkeepError::SnapshotNotFound(_)));

        let err = f
            .tree
            .create("s", None, &[Digest::from_bytes(b"never stored")])
            .await
            .unwrap_err();
        assert!(matches!(err, LayerkeepError::BlobNotFound(_)));

        assert!(f.tree.list().await.is_empty());
        assert!(f.tree.mount_path("s").await.is_err());
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected() {
        let f = fixture().await;
        f.tree.create("s", None, &[]).await.unwrap();
        let err = f.tree.create("s", None, &[]).await.unwrap_err();
        assert!(matches!(err, LayerkeepError::SnapshotExists(_)));
    }

    #[tokio::test]
    async fn remove_with_children_is_in_use() {
        let f = fixture().await;
        f.tree.create("parent", None, &[]).await.unwrap();
        f.tree.create("child", Some("parent"), &[]).await.unwrap();

        let err = f.tree.remove("parent").await.unwrap_err();
        assert!(err.is_in_use());

        f.tree.remove("child").await.unwrap();
        f.tree.remove("parent").await.unwrap();
        assert!(f.tree.list().await.is_empty());
        assert!(f.gc.is_pending());
    }

    #[tokio::test]
    async fn active_snapshot_commit() {
        let f = fixture().await;
        f.tree.create("base", None, &[]).await.unwrap();
        let mount = f.tree.prepare("work", Some("base")).await.unwrap();
        std::fs::write(mount.join("out"), b"built").unwrap();

        let err = f.tree.prepare("work2", Some("work")).await.unwrap_err();
        assert!(matches!(err, LayerkeepError::SnapshotNotCommitted(_)));

        let d = f.content.put(b"diff").await.unwrap();
        f.tree.commit("work", "layer", &[d.clone()]).await.unwrap();

        let info = f.tree.get("layer").await.unwrap();
        assert_eq!(info.kind, SnapshotKind::Committed);
        assert_eq!(info.parent.as_deref(), Some("base"));
        assert_eq!(info.diff, vec![d]);
        assert!(f.tree.get("work").await.unwrap_err().is_not_found());
        assert!(f.tree.mount_path("layer").await.unwrap().join("out").exists());

        let err = f.tree.commit("layer", "again", &[]).await.unwrap_err();
        assert!(matches!(err, LayerkeepError::SnapshotNotActive(_)));
    }

    #[tokio::test]
    async fn broken_chain_is_surfaced() {
        let f = fixture().await;
        f.tree.create("parent", None, &[]).await.unwrap();
        f.tree.create("child", Some("parent"), &[]).await.unwrap();

        // Corrupt the index the way a lost write would.
        f.index
            .update(|state| {
                state.snapshots.remove("parent");
                Ok(())
            })
            .await
            .unwrap();

        let err = f.tree.parent_of("child").await.unwrap_err();
        assert!(matches!(err, LayerkeepError::BrokenChain { .. }));
        assert!(f.tree.ancestors("child").await.is_err());
    }

    #[tokio::test]
    async fn orphan_layers_are_swept() {
        let f = fixture().await;
        f.tree.create("kept", None, &[]).await.unwrap();
        f.tree.inner.driver.prepare("stray", None).await.unwrap();

        assert_eq!(f.tree.sweep_orphans().await.unwrap(), 1);
        assert_eq!(
            f.tree.inner.driver.list().await.unwrap(),
            vec!["kept".to_string()]
        );
    }
}
