//! Content store
//!
//! Blobs are stored once per digest under `blobs/sha256/<hex>`. Writes are
//! durable before `put` returns and are serialized per digest; reads never
//! take a lock.

use crate::digest::Digest;
use crate::error::{LayerkeepError, LayerkeepResult, ResourceKind};
use crate::gc::reachability;
use crate::index::{BlobRecord, Index, IndexState, RefKind};
use crate::locks::KeyedLocks;
use crate::metadata::{MetadataState, MetadataStore};
use crate::persist;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, warn};

/// Public view of a stored blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobInfo {
    pub digest: Digest,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Aggregate size of the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContentUsage {
    pub blobs: usize,
    pub bytes: u64,
}

struct Inner {
    blobs_dir: PathBuf,
    index: Arc<Index>,
    metadata: Arc<MetadataStore>,
    locks: KeyedLocks<Digest>,
}

/// Content-addressable blob storage
#[derive(Clone)]
pub struct ContentStore {
    inner: Arc<Inner>,
}

impl ContentStore {
    /// Open the store rooted at `root`, creating its directories
    pub async fn open(
        root: &Path,
        index: Arc<Index>,
        metadata: Arc<MetadataStore>,
    ) -> LayerkeepResult<Self> {
        let blobs_dir = root.join("blobs").join("sha256");
        fs::create_dir_all(&blobs_dir)
            .await
            .map_err(|e| LayerkeepError::io(format!("creating {}", blobs_dir.display()), e))?;

        Ok(Self {
            inner: Arc::new(Inner {
                blobs_dir,
                index,
                metadata,
                locks: KeyedLocks::new(),
            }),
        })
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.inner.blobs_dir.join(digest.hex())
    }

    /// Store `data`, returning its digest
    ///
    /// Identical content is stored once; re-putting it only refreshes the
    /// record so an in-flight GC cycle will not remove it.
    pub async fn put(&self, data: &[u8]) -> LayerkeepResult<Digest> {
        self.write(data, None).await
    }

    /// Store `data` and add it to `lease` in the same index transaction
    pub async fn put_with_lease(&self, lease: &str, data: &[u8]) -> LayerkeepResult<Digest> {
        self.write(data, Some(lease)).await
    }

    async fn write(&self, data: &[u8], lease: Option<&str>) -> LayerkeepResult<Digest> {
        let digest = Digest::from_bytes(data);
        let _guard = self.inner.locks.lock(&digest).await;

        let path = self.blob_path(&digest);
        let on_disk = fs::try_exists(&path)
            .await
            .map_err(|e| LayerkeepError::io(format!("checking {}", path.display()), e))?;
        if !on_disk {
            persist::write_atomic(&path, data).await?;
        }

        let size = data.len() as u64;
        self.inner
            .index
            .update(|state| {
                let now = Utc::now();
                if let Some(id) = lease {
                    if !state.leases.get(id).is_some_and(|l| !l.is_expired(now)) {
                        return Err(LayerkeepError::LeaseNotFound(id.to_string()));
                    }
                }

                let generation = state.generation;
                state
                    .blobs
                    .entry(digest.clone())
                    .and_modify(|b| b.touched = generation)
                    .or_insert(BlobRecord {
                        size,
                        created_at: now,
                        touched: generation,
                    });

                if let Some(l) = lease.and_then(|id| state.leases.get_mut(id)) {
                    l.resources
                        .entry(RefKind::Blob)
                        .or_default()
                        .insert(digest.to_string());
                }
                Ok(())
            })
            .await?;

        debug!("Stored blob {} ({} bytes)", digest, size);
        Ok(digest)
    }

    /// Read a blob
    pub async fn get(&self, digest: &Digest) -> LayerkeepResult<Vec<u8>> {
        if !self.contains(digest).await {
            return Err(LayerkeepError::BlobNotFound(digest.to_string()));
        }

        let path = self.blob_path(digest);
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(LayerkeepError::BlobNotFound(digest.to_string()))
            }
            Err(e) => Err(LayerkeepError::io(format!("reading {}", path.display()), e)),
        }
    }

    pub async fn contains(&self, digest: &Digest) -> bool {
        self.inner.index.read().await.blobs.contains_key(digest)
    }

    pub async fn info(&self, digest: &Digest) -> LayerkeepResult<BlobInfo> {
        self.inner
            .index
            .read()
            .await
            .blobs
            .get(digest)
            .map(|b| BlobInfo {
                digest: digest.clone(),
                size: b.size,
                created_at: b.created_at,
            })
            .ok_or_else(|| LayerkeepError::BlobNotFound(digest.to_string()))
    }

    pub async fn list(&self) -> Vec<BlobInfo> {
        self.inner
            .index
            .read()
            .await
            .blobs
            .iter()
            .map(|(digest, b)| BlobInfo {
                digest: digest.clone(),
                size: b.size,
                created_at: b.created_at,
            })
            .collect()
    }

    pub async fn usage(&self) -> ContentUsage {
        let state = self.inner.index.read().await;
        ContentUsage {
            blobs: state.blobs.len(),
            bytes: state.blobs.values().map(|b| b.size).sum(),
        }
    }

    /// Delete an unreferenced blob, returning the bytes freed
    ///
    /// Fails with `InUse` while a lease or any snapshot diff references it.
    pub async fn delete(&self, digest: &Digest) -> LayerkeepResult<u64> {
        let id = digest.to_string();
        let now = Utc::now();

        let freed = self
            .remove_if(digest, |state, md, _| {
                if let Some(lease) = state.leases_referencing(RefKind::Blob, &id, now).first() {
                    return Err(LayerkeepError::in_use(
                        ResourceKind::Blob,
                        &id,
                        format!("referenced by lease {}", lease),
                    ));
                }
                if let Some(snapshot) = state.snapshots_using(digest).first() {
                    return Err(LayerkeepError::in_use(
                        ResourceKind::Blob,
                        &id,
                        format!("referenced by the diff of snapshot {}", snapshot),
                    ));
                }
                if reachability::compute(state, md, now)?.contains_blob(digest) {
                    return Err(LayerkeepError::in_use(
                        ResourceKind::Blob,
                        &id,
                        "referenced by a leased metadata record",
                    ));
                }
                Ok(true)
            })
            .await?;

        freed.ok_or_else(|| LayerkeepError::Internal(format!("blob {} was not removed", id)))
    }

    /// Remove a blob if `check` approves it
    ///
    /// `check` runs inside the index transaction, under the digest lock and
    /// a consistent view of the metadata store. Returns the freed size, or
    /// `None` when `check` declined.
    pub(crate) async fn remove_if<F>(
        &self,
        digest: &Digest,
        check: F,
    ) -> LayerkeepResult<Option<u64>>
    where
        F: FnOnce(&IndexState, &MetadataState, &BlobRecord) -> LayerkeepResult<bool>,
    {
        let _guard = self.inner.locks.lock(digest).await;
        let md = self.inner.metadata.read().await;

        let freed = self
            .inner
            .index
            .update_if_changed(|state| {
                let record = state
                    .blobs
                    .get(digest)
                    .cloned()
                    .ok_or_else(|| LayerkeepError::BlobNotFound(digest.to_string()))?;
                if !check(state, &md, &record)? {
                    return Ok((None, false));
                }
                state.blobs.remove(digest);
                Ok((Some(record.size), true))
            })
            .await?;
        drop(md);

        if freed.is_some() {
            self.remove_file(digest).await?;
            debug!("Removed blob {}", digest);
        }
        Ok(freed)
    }

    async fn remove_file(&self, digest: &Digest) -> LayerkeepResult<()> {
        let path = self.blob_path(digest);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LayerkeepError::io(format!("removing {}", path.display()), e)),
        }
    }

    /// Remove blob files that have no index record
    ///
    /// These are left behind by interrupted writes or deletions.
    pub(crate) async fn sweep_orphans(&self) -> LayerkeepResult<usize> {
        let dir = &self.inner.blobs_dir;
        let mut entries = fs::read_dir(dir)
            .await
            .map_err(|e| LayerkeepError::io(format!("reading {}", dir.display()), e))?;

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| LayerkeepError::io(format!("reading {}", dir.display()), e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let (hex, is_temp) = match name.split_once('.') {
                Some((hex, _)) => (hex.to_string(), true),
                None => (name.clone(), false),
            };
            let Ok(digest) = format!("sha256:{}", hex).parse::<Digest>() else {
                warn!("Ignoring unexpected file in content store: {}", name);
                continue;
            };

            let _guard = self.inner.locks.lock(&digest).await;
            if !is_temp && self.contains(&digest).await {
                continue;
            }

            match fs::remove_file(entry.path()).await {
                Ok(()) => {
                    debug!("Removed orphaned content file {}", name);
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(LayerkeepError::io(
                        format!("removing {}", entry.path().display()),
                        e,
                    ))
                }
            }
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> (ContentStore, Arc<Index>) {
        let index = Arc::new(Index::open(&dir.path().join("index.json")).await.unwrap());
        let md = Arc::new(
            MetadataStore::open(&dir.path().join("metadata.json"))
                .await
                .unwrap(),
        );
        let cs = ContentStore::open(&dir.path().join("content"), index.clone(), md)
            .await
            .unwrap();
        (cs, index)
    }

    #[tokio::test]
    async fn put_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (cs, _) = store(&dir).await;

        let d1 = cs.put(b"layer data").await.unwrap();
        let d2 = cs.put(b"layer data").await.unwrap();

        assert_eq!(d1, d2);
        assert_eq!(cs.usage().await.blobs, 1);
        assert_eq!(cs.get(&d1).await.unwrap(), b"layer data");
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let (cs, _) = store(&dir).await;

        let err = cs.get(&Digest::from_bytes(b"absent")).await.unwrap_err();
        assert!(matches!(err, LayerkeepError::BlobNotFound(_)));
    }

    #[tokio::test]
    async fn put_with_unknown_lease_fails() {
        let dir = TempDir::new().unwrap();
        let (cs, _) = store(&dir).await;

        let err = cs.put_with_lease("nope", b"x").await.unwrap_err();
        assert!(matches!(err, LayerkeepError::LeaseNotFound(_)));
        assert_eq!(cs.usage().await.blobs, 0);
    }

    #[tokio::test]
    async fn delete_unreferenced_blob() {
        let dir = TempDir::new().unwrap();
        let (cs, _) = store(&dir).await;

        let d = cs.put(b"12345").await.unwrap();
        assert_eq!(cs.delete(&d).await.unwrap(), 5);
        assert!(!cs.contains(&d).await);
        assert!(cs.delete(&d).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn orphan_files_are_swept() {
        let dir = TempDir::new().unwrap();
        let (cs, _) = store(&dir).await;

        let kept = cs.put(b"kept").await.unwrap();
        let orphan = Digest::from_bytes(b"orphan");
        std::fs::write(cs.blob_path(&orphan), b"orphan").unwrap();
        std::fs::write(
            cs.inner.blobs_dir.join(format!("{}.tmp-abc", orphan.hex())),
            b"partial",
        )
        .unwrap();

        assert_eq!(cs.sweep_orphans().await.unwrap(), 2);
        assert!(cs.blob_path(&kept).exists());
        assert!(!cs.blob_path(&orphan).exists());
    }

    #[tokio::test]
    async fn concurrent_puts_of_same_content_store_once() {
        let dir = TempDir::new().unwrap();
        let (cs, _) = store(&dir).await;

        let puts = (0..8).map(|_| {
            let cs = cs.clone();
            async move { cs.put(b"shared").await }
        });
        let digests = futures_util::future::try_join_all(puts).await.unwrap();

        assert!(digests.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(cs.usage().await, ContentUsage { blobs: 1, bytes: 6 });
    }
}
