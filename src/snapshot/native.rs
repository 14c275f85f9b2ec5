//! Native snapshot driver
//!
//! Each layer is a plain directory `<root>/<hex key>/fs`. Keys are
//! hex-encoded so arbitrary snapshot keys map to safe directory names.

use crate::error::{LayerkeepError, LayerkeepResult};
use crate::snapshot::driver::Snapshotter;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

const PARENT_FILE: &str = "parent";

pub struct NativeSnapshotter {
    root: PathBuf,
}

impl NativeSnapshotter {
    pub fn new(root: &Path) -> LayerkeepResult<Self> {
        std::fs::create_dir_all(root)
            .map_err(|e| LayerkeepError::io(format!("creating {}", root.display()), e))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn layer_dir(&self, key: &str) -> PathBuf {
        self.root.join(hex::encode(key))
    }
}

#[async_trait]
impl Snapshotter for NativeSnapshotter {
    fn name(&self) -> &str {
        "native"
    }

    async fn prepare(&self, key: &str, parent: Option<&str>) -> LayerkeepResult<PathBuf> {
        let dir = self.layer_dir(key);
        let fs_dir = dir.join("fs");
        fs::create_dir_all(&fs_dir)
            .await
            .map_err(|e| LayerkeepError::io(format!("creating {}", fs_dir.display()), e))?;

        if let Some(parent) = parent {
            let path = dir.join(PARENT_FILE);
            fs::write(&path, parent)
                .await
                .map_err(|e| LayerkeepError::io(format!("writing {}", path.display()), e))?;
        }

        debug!("Prepared layer {} at {}", key, fs_dir.display());
        Ok(fs_dir)
    }

    async fn commit(&self, active: &str, key: &str) -> LayerkeepResult<()> {
        let from = self.layer_dir(active);
        let to = self.layer_dir(key);
        fs::rename(&from, &to).await.map_err(|e| {
            LayerkeepError::io(
                format!("renaming {} to {}", from.display(), to.display()),
                e,
            )
        })
    }

    fn mount_path(&self, key: &str) -> PathBuf {
        self.layer_dir(key).join("fs")
    }

    async fn remove(&self, key: &str) -> LayerkeepResult<()> {
        let dir = self.layer_dir(key);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LayerkeepError::io(format!("removing {}", dir.display()), e)),
        }
    }

    async fn list(&self) -> LayerkeepResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| LayerkeepError::io(format!("reading {}", self.root.display()), e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| LayerkeepError::io("reading snapshot entry", e))?
        {
            let name = entry.file_name();
            let decoded = hex::decode(name.to_string_lossy().as_bytes())
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok());
            match decoded {
                Some(key) => keys.push(key),
                None => debug!("Ignoring unexpected entry {:?} in snapshot root", name),
            }
        }

        keys.sort();
        Ok(keys)
    }
}
