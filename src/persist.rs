//! Durable JSON documents
//!
//! Documents are replaced by writing a sibling temp file, syncing it and
//! renaming it over the target, so readers see either the old or the new
//! version after a crash.

use crate::error::{LayerkeepError, LayerkeepResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Load a JSON document, returning `None` if the file does not exist
pub async fn load_json<T: DeserializeOwned>(path: &Path) -> LayerkeepResult<Option<T>> {
    let content = match fs::read(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(LayerkeepError::io(format!("reading {}", path.display()), e)),
    };

    Ok(Some(serde_json::from_slice(&content)?))
}

/// Atomically replace `path` with the JSON encoding of `value`
pub async fn save_json<T: Serialize>(path: &Path, value: &T) -> LayerkeepResult<()> {
    let content = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &content).await
}

/// Write `data` to `path` through a synced temp file and rename
pub async fn write_atomic(path: &Path, data: &[u8]) -> LayerkeepResult<()> {
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));

    let mut file = fs::File::create(&tmp)
        .await
        .map_err(|e| LayerkeepError::io(format!("creating {}", tmp.display()), e))?;
    file.write_all(data)
        .await
        .map_err(|e| LayerkeepError::io(format!("writing {}", tmp.display()), e))?;
    file.sync_all()
        .await
        .map_err(|e| LayerkeepError::io(format!("syncing {}", tmp.display()), e))?;
    drop(file);

    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(LayerkeepError::io(
            format!("renaming {} to {}", tmp.display(), path.display()),
            e,
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let loaded: Option<BTreeMap<String, u32>> =
            load_json(&dir.path().join("absent.json")).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn save_replaces_previous_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");

        let mut doc = BTreeMap::new();
        doc.insert("a".to_string(), 1u32);
        save_json(&path, &doc).await.unwrap();
        doc.insert("b".to_string(), 2u32);
        save_json(&path, &doc).await.unwrap();

        let loaded: BTreeMap<String, u32> = load_json(&path).await.unwrap().unwrap();
        assert_eq!(loaded.len(), 2);

        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
