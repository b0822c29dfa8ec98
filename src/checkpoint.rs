//! Restoration checkpoints.
//!
//! A checkpoint is the last change-log offset known to be fully applied to a
//! store. It starts as "none" when the store is created, advances
//! monotonically during restoration and live processing, and is persisted at
//! commit so that a restart resumes the replay instead of starting over.

use crate::error::CheckpointError;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Result type for checkpoint operations.
pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Storage backend for per-store checkpoints.
pub trait CheckpointStore: Send + Sync + std::fmt::Debug {
  /// Returns the checkpoint for a store, or `None` if it never committed one.
  fn get(&self, store: &str) -> CheckpointResult<Option<u64>>;

  /// Commits a checkpoint for one store.
  fn commit(&self, store: &str, offset: u64) -> CheckpointResult<()>;

  /// Commits several checkpoints at once.
  fn commit_all(&self, checkpoints: &HashMap<String, u64>) -> CheckpointResult<()>;

  /// Returns all committed checkpoints.
  fn get_all(&self) -> CheckpointResult<HashMap<String, u64>>;

  /// Forgets the checkpoint of one store.
  fn clear(&self, store: &str) -> CheckpointResult<()>;
}

/// In-memory checkpoint store, for tests and stores that need no persistence.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
  checkpoints: Arc<RwLock<HashMap<String, u64>>>,
}

impl InMemoryCheckpointStore {
  /// Creates an empty store.
  pub fn new() -> Self {
    Self::default()
  }
}

impl CheckpointStore for InMemoryCheckpointStore {
  fn get(&self, store: &str) -> CheckpointResult<Option<u64>> {
    let checkpoints = self
      .checkpoints
      .read()
      .map_err(|e| CheckpointError::Lock(e.to_string()))?;
    Ok(checkpoints.get(store).copied())
  }

  fn commit(&self, store: &str, offset: u64) -> CheckpointResult<()> {
    let mut checkpoints = self
      .checkpoints
      .write()
      .map_err(|e| CheckpointError::Lock(e.to_string()))?;
    checkpoints.insert(store.to_string(), offset);
    Ok(())
  }

  fn commit_all(&self, updates: &HashMap<String, u64>) -> CheckpointResult<()> {
    let mut checkpoints = self
      .checkpoints
      .write()
      .map_err(|e| CheckpointError::Lock(e.to_string()))?;
    checkpoints.extend(updates.iter().map(|(k, v)| (k.clone(), *v)));
    Ok(())
  }

  fn get_all(&self) -> CheckpointResult<HashMap<String, u64>> {
    let checkpoints = self
      .checkpoints
      .read()
      .map_err(|e| CheckpointError::Lock(e.to_string()))?;
    Ok(checkpoints.clone())
  }

  fn clear(&self, store: &str) -> CheckpointResult<()> {
    let mut checkpoints = self
      .checkpoints
      .write()
      .map_err(|e| CheckpointError::Lock(e.to_string()))?;
    checkpoints.remove(store);
    Ok(())
  }
}

/// File-based checkpoint store.
///
/// Keeps all checkpoints of a task in one JSON file. Every write goes to a
/// temporary file that is renamed over the previous one, so a crash leaves
/// either the old or the new checkpoints, never a torn file.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
  path: PathBuf,
  cache: Arc<RwLock<HashMap<String, u64>>>,
}

impl FileCheckpointStore {
  /// Opens the checkpoint file at `path`, loading it if it exists.
  pub fn open<P: AsRef<Path>>(path: P) -> CheckpointResult<Self> {
    let path = path.as_ref().to_path_buf();

    let cache = if path.exists() {
      let data = fs::read_to_string(&path)?;
      if data.trim().is_empty() {
        HashMap::new()
      } else {
        serde_json::from_str(&data).map_err(|e| CheckpointError::Serialization(e.to_string()))?
      }
    } else {
      HashMap::new()
    };

    Ok(Self {
      path,
      cache: Arc::new(RwLock::new(cache)),
    })
  }

  fn persist(&self, checkpoints: &HashMap<String, u64>) -> CheckpointResult<()> {
    if let Some(parent) = self.path.parent() {
      fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_string_pretty(checkpoints)
      .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
    let tmp = self.path.with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, &self.path)?;
    Ok(())
  }

  /// Path of the checkpoint file.
  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl CheckpointStore for FileCheckpointStore {
  fn get(&self, store: &str) -> CheckpointResult<Option<u64>> {
    let cache = self
      .cache
      .read()
      .map_err(|e| CheckpointError::Lock(e.to_string()))?;
    Ok(cache.get(store).copied())
  }

  fn commit(&self, store: &str, offset: u64) -> CheckpointResult<()> {
    let mut cache = self
      .cache
      .write()
      .map_err(|e| CheckpointError::Lock(e.to_string()))?;
    cache.insert(store.to_string(), offset);
    self.persist(&cache)
  }

  fn commit_all(&self, updates: &HashMap<String, u64>) -> CheckpointResult<()> {
    let mut cache = self
      .cache
      .write()
      .map_err(|e| CheckpointError::Lock(e.to_string()))?;
    cache.extend(updates.iter().map(|(k, v)| (k.clone(), *v)));
    self.persist(&cache)
  }

  fn get_all(&self) -> CheckpointResult<HashMap<String, u64>> {
    let cache = self
      .cache
      .read()
      .map_err(|e| CheckpointError::Lock(e.to_string()))?;
    Ok(cache.clone())
  }

  fn clear(&self, store: &str) -> CheckpointResult<()> {
    let mut cache = self
      .cache
      .write()
      .map_err(|e| CheckpointError::Lock(e.to_string()))?;
    cache.remove(store);
    self.persist(&cache)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[test]
  fn in_memory_commit_and_clear() {
    let store = InMemoryCheckpointStore::new();
    assert_eq!(store.get("tuples").unwrap(), None);
    store.commit("tuples", 41).unwrap();
    assert_eq!(store.get("tuples").unwrap(), Some(41));
    store.clear("tuples").unwrap();
    assert_eq!(store.get("tuples").unwrap(), None);
  }

  #[test]
  fn file_store_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("task").join(".checkpoint");

    let store = FileCheckpointStore::open(&path).unwrap();
    let mut updates = HashMap::new();
    updates.insert("a".to_string(), 3);
    updates.insert("b".to_string(), 9);
    store.commit_all(&updates).unwrap();
    store.commit("a", 5).unwrap();

    let reopened = FileCheckpointStore::open(&path).unwrap();
    assert_eq!(reopened.get("a").unwrap(), Some(5));
    assert_eq!(reopened.get("b").unwrap(), Some(9));
    assert!(!path.with_extension("tmp").exists());
  }

  #[test]
  fn file_store_rejects_garbage() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(".checkpoint");
    fs::write(&path, "{ not json").unwrap();
    assert!(matches!(
      FileCheckpointStore::open(&path),
      Err(CheckpointError::Serialization(_))
    ));
  }
}
