use std::path::PathBuf;
use std::sync::Mutex;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::instrument;

/// A single-file JSON document store. All reads and writes are serialized
/// through one mutex; writes go through a temp file + rename so a crash
/// never leaves a half-written document. Used by the dev-only file-backed
/// connection store, which is why simplicity beats throughput here.
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    #[instrument(skip(path), fields(subsys = "JsonFileStore"))]
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, FileStoreError> {
        let path: PathBuf = path.into();
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    FileStoreError::Io(format!(
                        "creating parent dir {}: {}",
                        parent.to_string_lossy(),
                        e
                    ))
                })?;
            }
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Reads the whole document, or the type's default when the file does
    /// not exist yet.
    #[instrument(skip(self), fields(subsys = "JsonFileStore"))]
    pub fn read<T>(&self) -> Result<T, FileStoreError>
    where
        T: DeserializeOwned + Default,
    {
        let _guard = self.lock.lock().unwrap();

        if !self.path.exists() {
            return Ok(T::default());
        }

        let bytes = std::fs::read(&self.path)
            .map_err(|e| FileStoreError::Io(format!("reading {}: {}", self.path.display(), e)))?;
        serde_json::from_slice(&bytes).map_err(FileStoreError::Decode)
    }

    /// Replaces the whole document atomically.
    #[instrument(skip(self, value), fields(subsys = "JsonFileStore"))]
    pub fn write<T>(&self, value: &T) -> Result<(), FileStoreError>
    where
        T: Serialize,
    {
        let _guard = self.lock.lock().unwrap();

        let bytes = serde_json::to_vec_pretty(value).map_err(FileStoreError::Decode)?;

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)
            .map_err(|e| FileStoreError::Io(format!("writing {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| FileStoreError::Io(format!("renaming into {}: {}", self.path.display(), e)))?;

        Ok(())
    }

    /// Read-modify-write under the same mutex hold.
    pub fn modify<T, R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, FileStoreError>
    where
        T: DeserializeOwned + Serialize + Default,
    {
        let _guard = self.lock.lock().unwrap();

        let mut value: T = if self.path.exists() {
            let bytes = std::fs::read(&self.path).map_err(|e| {
                FileStoreError::Io(format!("reading {}: {}", self.path.display(), e))
            })?;
            serde_json::from_slice(&bytes).map_err(FileStoreError::Decode)?
        } else {
            T::default()
        };

        let result = f(&mut value);

        let bytes = serde_json::to_vec_pretty(&value).map_err(FileStoreError::Decode)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)
            .map_err(|e| FileStoreError::Io(format!("writing {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| FileStoreError::Io(format!("renaming into {}: {}", self.path.display(), e)))?;

        Ok(result)
    }
}

#[derive(Error, Debug)]
pub enum FileStoreError {
    #[error("file store io: {0}")]
    Io(String),

    #[error("file store decode: {0}")]
    Decode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn read_missing_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("conns.json")).unwrap();

        let doc: BTreeMap<String, String> = store.read().unwrap();
        assert!(doc.is_empty());
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("conns.json")).unwrap();

        let mut doc = BTreeMap::new();
        doc.insert("a".to_string(), "1".to_string());
        store.write(&doc).unwrap();

        let back: BTreeMap<String, String> = store.read().unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn modify_is_read_modify_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("conns.json")).unwrap();

        store
            .modify(|doc: &mut BTreeMap<String, u32>| {
                doc.insert("hits".to_string(), 1);
            })
            .unwrap();
        store
            .modify(|doc: &mut BTreeMap<String, u32>| {
                *doc.get_mut("hits").unwrap() += 1;
            })
            .unwrap();

        let doc: BTreeMap<String, u32> = store.read().unwrap();
        assert_eq!(doc["hits"], 2);
    }
}
