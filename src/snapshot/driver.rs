//! Snapshot driver abstraction
//!
//! The snapshot tree keeps the parent/diff bookkeeping; a driver only owns
//! the on-disk layer directories. Drivers are selected by name through a
//! `SnapshotterFactory`.

use crate::error::{LayerkeepError, LayerkeepResult};
use crate::snapshot::native::NativeSnapshotter;
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// On-disk snapshot backend
#[async_trait]
pub trait Snapshotter: Send + Sync {
    /// Backend name used in worker labels and directory names
    fn name(&self) -> &str;

    /// Create the writable layer for `key` on top of `parent`
    async fn prepare(&self, key: &str, parent: Option<&str>) -> LayerkeepResult<PathBuf>;

    /// Move the layer of active snapshot `active` to `key`
    async fn commit(&self, active: &str, key: &str) -> LayerkeepResult<()>;

    /// Path where the layer of `key` is mounted
    fn mount_path(&self, key: &str) -> PathBuf;

    /// Remove the layer of `key`; removing an absent layer succeeds
    async fn remove(&self, key: &str) -> LayerkeepResult<()>;

    /// Keys of all layers present on disk
    async fn list(&self) -> LayerkeepResult<Vec<String>>;
}

type Constructor = dyn Fn(&Path) -> LayerkeepResult<Arc<dyn Snapshotter>> + Send + Sync;

/// Named constructor for a snapshot driver
#[derive(Clone)]
pub struct SnapshotterFactory {
    name: String,
    new: Arc<Constructor>,
}

impl SnapshotterFactory {
    /// Build a factory from a constructor taking the driver root
    pub fn new<F>(name: impl Into<String>, new: F) -> Self
    where
        F: Fn(&Path) -> LayerkeepResult<Arc<dyn Snapshotter>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            new: Arc::new(new),
        }
    }

    /// Directory-per-layer driver
    pub fn native() -> Self {
        Self::new("native", |root| {
            Ok(Arc::new(NativeSnapshotter::new(root)?) as Arc<dyn Snapshotter>)
        })
    }

    /// Select a built-in driver by name
    pub fn by_name(name: &str) -> LayerkeepResult<Self> {
        match name {
            "native" => Ok(Self::native()),
            other => Err(LayerkeepError::UnknownSnapshotter(other.to_string())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instantiate the driver rooted at `root`
    pub fn create(&self, root: &Path) -> LayerkeepResult<Arc<dyn Snapshotter>> {
        (self.new)(root)
    }
}

impl fmt::Debug for SnapshotterFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotterFactory")
            .field("name", &self.name)
            .finish()
    }
}
