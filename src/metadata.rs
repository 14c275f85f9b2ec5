//! Metadata store
//!
//! Durable mapping from a build cache key to the snapshot and blobs it
//! resolves to, plus free-form attributes owned by the surrounding build
//! system. The garbage collector only looks at records that a lease
//! references; everything else here is opaque to it.

use crate::digest::Digest;
use crate::error::{LayerkeepError, LayerkeepResult};
use crate::persist;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::debug;

/// A cache entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub key: String,
    /// Snapshot the entry resolves to
    pub snapshot: Option<String>,
    /// Blobs the entry resolves to
    #[serde(default)]
    pub blobs: Vec<Digest>,
    #[serde(default)]
    pub attrs: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MetadataRecord {
    pub fn new(key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            snapshot: None,
            blobs: vec![],
            attrs: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_snapshot(mut self, snapshot: impl Into<String>) -> Self {
        self.snapshot = Some(snapshot.into());
        self
    }

    pub fn with_blobs(mut self, blobs: Vec<Digest>) -> Self {
        self.blobs = blobs;
        self
    }
}

/// Persisted store contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataState {
    pub generation: u64,
    pub records: BTreeMap<String, MetadataRecord>,
}

/// Key/value store of cache records
pub struct MetadataStore {
    path: PathBuf,
    state: RwLock<MetadataState>,
}

impl MetadataStore {
    /// Open the store at `path`, starting empty if the file does not exist
    pub async fn open(path: &Path) -> LayerkeepResult<Self> {
        let state: MetadataState = persist::load_json(path).await?.unwrap_or_default();
        debug!(
            "Opened metadata store {} ({} records)",
            path.display(),
            state.records.len()
        );

        Ok(Self {
            path: path.to_path_buf(),
            state: RwLock::new(state),
        })
    }

    /// Get a record by key
    pub async fn get(&self, key: &str) -> LayerkeepResult<MetadataRecord> {
        self.state
            .read()
            .await
            .records
            .get(key)
            .cloned()
            .ok_or_else(|| LayerkeepError::RecordNotFound(key.to_string()))
    }

    /// List all records
    pub async fn list(&self) -> Vec<MetadataRecord> {
        self.state.read().await.records.values().cloned().collect()
    }

    /// Insert or replace a record
    pub async fn put(&self, mut record: MetadataRecord) -> LayerkeepResult<()> {
        record.updated_at = Utc::now();
        let key = record.key.clone();
        self.mutate(|state| {
            if let Some(existing) = state.records.get(&record.key) {
                record.created_at = existing.created_at;
            }
            state.records.insert(record.key.clone(), record);
            Ok(())
        })
        .await?;

        debug!("Stored metadata record {}", key);
        Ok(())
    }

    /// Read-modify-write a single record
    pub async fn update<F>(&self, key: &str, f: F) -> LayerkeepResult<MetadataRecord>
    where
        F: FnOnce(&mut MetadataRecord),
    {
        self.mutate(|state| {
            let record = state
                .records
                .get_mut(key)
                .ok_or_else(|| LayerkeepError::RecordNotFound(key.to_string()))?;
            f(record);
            record.key = key.to_string();
            record.updated_at = Utc::now();
            Ok(record.clone())
        })
        .await
    }

    /// Delete a record
    pub async fn delete(&self, key: &str) -> LayerkeepResult<()> {
        self.mutate(|state| {
            state
                .records
                .remove(key)
                .map(|_| ())
                .ok_or_else(|| LayerkeepError::RecordNotFound(key.to_string()))
        })
        .await
    }

    /// Shared read access, used by reachability scans
    pub async fn read(&self) -> RwLockReadGuard<'_, MetadataState> {
        self.state.read().await
    }

    async fn mutate<T, F>(&self, f: F) -> LayerkeepResult<T>
    where
        F: FnOnce(&mut MetadataState) -> LayerkeepResult<T>,
    {
        let mut guard = self.state.write().await;
        let mut next = guard.clone();
        next.generation += 1;

        let out = f(&mut next)?;
        persist::save_json(&self.path, &next).await?;
        *guard = next;

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

    #[tokio::test]
    async fn put_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::open(&dir.path().join("metadata.json"))
            .await
            .unwrap();

        store
            .put(MetadataRecord::new("cache-key").with_snapshot("s1"))
            .await
            .unwrap();
        assert_eq!(
            store.get("cache-key").await.unwrap().snapshot.as_deref(),
            Some("s1")
        );

        store.delete("cache-key").await.unwrap();
        assert!(store.get("cache-key").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn update_missing_record_fails() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::open(&dir.path().join("metadata.json"))
            .await
            .unwrap();

        let err = store.update("nope", |_| {}).await.unwrap_err();
        assert!(matches!(err, LayerkeepError::RecordNotFound(_)));
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metadata.json");

        let store = MetadataStore::open(&path).await.unwrap();
        store.put(MetadataRecord::new("k")).await.unwrap();
        store
            .update("k", |r| {
                r.attrs
                    .insert("description".to_string(), serde_json::json!("RUN make"));
            })
            .await
            .unwrap();
        drop(store);

        let reopened = MetadataStore::open(&path).await.unwrap();
        let record = reopened.get("k").await.unwrap();
        assert_eq!(record.attrs["description"], "RUN make");
        assert_eq!(reopened.read().await.generation, 2);
    }
}
