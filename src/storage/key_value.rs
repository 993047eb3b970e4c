//! Local key-value store.
//!
//! A small string-to-string store with the semantics of a browser's local
//! storage: synchronous, whole-value reads and writes. It backs the
//! `localStorage` adapter and holds the persisted backend preference.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, error, info};

use crate::error_handling::types::StorageError;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Key-value store persisted as one JSON object on disk.
///
/// The whole map is cached in memory and rewritten through a temporary file
/// on every mutation, so a crash never leaves a half-written file behind.
pub struct FileKeyValueStore {
    path: PathBuf,
    cache: Mutex<BTreeMap<String, String>>,
}

impl FileKeyValueStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                error!("Failed to create key-value dir {}: {}", parent.display(), e);
                StorageError::from(e)
            })?;
        }

        let cache = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|e| {
                error!("Failed to read key-value file {}: {}", path.display(), e);
                StorageError::from(e)
            })?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw).map_err(|e| {
                    error!("Malformed key-value file {}: {}", path.display(), e);
                    StorageError::from(e)
                })?
            }
        } else {
            BTreeMap::new()
        };
        info!(
            "FileKeyValueStore opened at {} ({} key(s))",
            path.display(),
            cache.len()
        );

        Ok(Self {
            path,
            cache: Mutex::new(cache),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush(&self, map: &BTreeMap<String, String>) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(map)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json).map_err(|e| {
            error!("Failed to write key-value file {}: {}", tmp.display(), e);
            StorageError::from(e)
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            error!("Failed to replace key-value file {}: {}", self.path.display(), e);
            StorageError::from(e)
        })?;
        Ok(())
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut map = self.lock();
        let previous = map.insert(key.to_string(), value.to_string());
        if let Err(e) = self.flush(&map) {
            // Keep the cache consistent with what is on disk.
            match previous {
                Some(old) => map.insert(key.to_string(), old),
                None => map.remove(key),
            };
            return Err(e);
        }
        debug!("Stored {} byte(s) under '{}'", value.len(), key);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut map = self.lock();
        if let Some(old) = map.remove(key) {
            if let Err(e) = self.flush(&map) {
                map.insert(key.to_string(), old);
                return Err(e);
            }
            debug!("Removed '{}'", key);
        }
        Ok(())
    }
}

/// Volatile key-value store, used for tests and for sessions that must not
/// touch the disk.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    map: Mutex<BTreeMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_store_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv").join("local-storage.json");
        {
            let store = FileKeyValueStore::new(&path).unwrap();
            store.set("preferredStorageType", "indexedDB").unwrap();
            store.set("other", "1").unwrap();
            store.remove("other").unwrap();
        }
        let reopened = FileKeyValueStore::new(&path).unwrap();
        assert_eq!(
            reopened.get("preferredStorageType").unwrap().as_deref(),
            Some("indexedDB")
        );
        assert_eq!(reopened.get("other").unwrap(), None);
    }

    #[test]
    fn test_malformed_file_is_a_serialization_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            FileKeyValueStore::new(&path),
            Err(StorageError::Serialization(_))
        ));
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryKeyValueStore::new();
        assert_eq!(store.get("k").unwrap(), None);
        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }
}
