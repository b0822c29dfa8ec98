//! Byte-level state store and the registry that owns a task's stores.

use crate::checkpoint::CheckpointStore;
use crate::error::StoreError;
use crate::state::changelog::{ChangeLog, ChangeRecord, CompactionStats};
use crate::state::{StateDirectory, StoreSpec};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// A key/value map whose mutations are appended to a change log.
///
/// The log is written before the map changes, so the map never holds state
/// the log does not support. The checkpoint tracks the last log offset
/// reflected in the map.
#[derive(Debug)]
pub struct StateStore {
  spec: Arc<StoreSpec>,
  map: BTreeMap<Bytes, Bytes>,
  changelog: Option<ChangeLog>,
  checkpoint: Option<u64>,
  persisted_checkpoint: Option<u64>,
  data_file: Option<PathBuf>,
  restored: bool,
  dirty: bool,
}

impl StateStore {
  /// Opens a store: loads the persistent file and checkpoint if present and
  /// opens the change log. The store still needs restoration when logging is
  /// enabled; see [`RestorationCoordinator`](crate::restore::RestorationCoordinator).
  pub fn open(
    spec: Arc<StoreSpec>,
    dir: &StateDirectory,
    checkpoints: &dyn CheckpointStore,
  ) -> Result<Self, StoreError> {
    let name = spec.name().to_string();
    let changelog = match spec.log_config() {
      Some(config) => Some(
        ChangeLog::open(
          dir.changelog_name(&name),
          dir.changelog_file(&name),
          config.clone(),
        )
        .map_err(|source| StoreError::ChangeLog {
          store: name.clone(),
          source,
        })?,
      ),
      None => None,
    };

    let mut map = BTreeMap::new();
    let mut checkpoint = None;
    let data_file = spec.persistent().then(|| dir.store_file(&name));
    if let Some(path) = data_file.as_deref() {
      if path.exists() {
        map = read_data_file(path).map_err(|source| StoreError::Io {
          store: name.clone(),
          source,
        })?;
        checkpoint = checkpoints
          .get(&name)
          .map_err(|source| StoreError::Checkpoint {
            store: name.clone(),
            source,
          })?;
      }
    }

    if let Some(log) = changelog.as_ref() {
      match checkpoint {
        None if !map.is_empty() => {
          warn!(store = %name, "store file has no checkpoint, rebuilding from change log");
          map.clear();
        }
        Some(c) if c >= log.end_offset() => {
          warn!(
            store = %name,
            checkpoint = c,
            log_end = log.end_offset(),
            "checkpoint is beyond the change log end, rebuilding from change log"
          );
          map.clear();
          checkpoint = None;
        }
        _ => {}
      }
    }

    debug!(store = %name, ?checkpoint, entries = map.len(), "opened state store");
    Ok(Self {
      restored: changelog.is_none(),
      spec,
      map,
      changelog,
      persisted_checkpoint: checkpoint,
      checkpoint,
      data_file,
      dirty: false,
    })
  }

  /// Store name.
  pub fn name(&self) -> &str {
    self.spec.name()
  }

  /// Store declaration.
  pub fn spec(&self) -> &Arc<StoreSpec> {
    &self.spec
  }

  /// Last change log offset reflected in the map.
  pub fn checkpoint(&self) -> Option<u64> {
    self.checkpoint
  }

  /// Whether restoration finished and the store can serve reads.
  pub fn is_restored(&self) -> bool {
    self.restored
  }

  /// The change log, if logging is enabled.
  pub fn changelog(&self) -> Option<&ChangeLog> {
    self.changelog.as_ref()
  }

  pub(crate) fn changelog_mut(&mut self) -> Option<&mut ChangeLog> {
    self.changelog.as_mut()
  }

  fn log_err(&self, source: crate::error::ChangeLogError) -> StoreError {
    StoreError::ChangeLog {
      store: self.name().to_string(),
      source,
    }
  }

  /// Returns the value stored under `key`.
  pub fn get(&self, key: &[u8]) -> Option<&Bytes> {
    self.map.get(key)
  }

  /// Stores `value` under `key`, logging the change first.
  pub fn put(&mut self, key: Bytes, value: Bytes, timestamp_ms: i64) -> Result<(), StoreError> {
    if let Some(log) = self.changelog.as_mut() {
      let offset = log
        .append(&key, Some(&value), timestamp_ms)
        .map_err(|source| StoreError::ChangeLog {
          store: self.spec.name().to_string(),
          source,
        })?;
      self.checkpoint = Some(offset);
    }
    self.map.insert(key, value);
    self.dirty = true;
    Ok(())
  }

  /// Removes `key`, logging a tombstone first. Returns the previous value.
  pub fn delete(&mut self, key: &[u8], timestamp_ms: i64) -> Result<Option<Bytes>, StoreError> {
    if let Some(log) = self.changelog.as_mut() {
      let offset = log
        .append(key, None, timestamp_ms)
        .map_err(|source| StoreError::ChangeLog {
          store: self.spec.name().to_string(),
          source,
        })?;
      self.checkpoint = Some(offset);
    }
    self.dirty = true;
    Ok(self.map.remove(key))
  }

  /// Iterates over all entries in key order.
  pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &Bytes)> {
    self.map.iter()
  }

  /// Number of entries.
  pub fn len(&self) -> usize {
    self.map.len()
  }

  /// Returns true if the store holds no entry.
  pub fn is_empty(&self) -> bool {
    self.map.is_empty()
  }

  /// Applies a replayed change log entry without logging it again.
  pub(crate) fn apply_restored(&mut self, record: ChangeRecord) {
    match record.value {
      Some(value) => {
        self.map.insert(record.key, value);
      }
      None => {
        self.map.remove(&record.key);
      }
    }
    self.checkpoint = Some(record.offset);
    self.dirty = true;
  }

  pub(crate) fn mark_restored(&mut self) {
    self.restored = true;
  }

  /// Flushes the change log and, for persistent stores, writes the store file.
  ///
  /// Returns the checkpoint that is now safe to persist, if any.
  pub fn flush(&mut self) -> Result<Option<u64>, StoreError> {
    if let Some(log) = self.changelog.as_mut() {
      if let Err(source) = log.flush() {
        return Err(self.log_err(source));
      }
    }
    let Some(path) = self.data_file.as_deref() else {
      return Ok(None);
    };
    if self.dirty {
      write_data_file(path, &self.map).map_err(|source| StoreError::Io {
        store: self.spec.name().to_string(),
        source,
      })?;
      self.dirty = false;
    }
    Ok(self.checkpoint)
  }

  /// Compacts the change log if its policy asks for it.
  ///
  /// Tombstones are only dropped at or below the checkpoint a restart would
  /// resume from: the persisted one for persistent stores, the current one
  /// otherwise (in-memory stores always replay everything).
  pub fn maybe_compact(&mut self, now_ms: i64) -> Result<Option<CompactionStats>, StoreError> {
    let safe_offset = if self.data_file.is_some() {
      self.persisted_checkpoint
    } else {
      self.checkpoint
    };
    let Some(log) = self.changelog.as_mut() else {
      return Ok(None);
    };
    if !log.needs_compaction() {
      return Ok(None);
    }
    match log.compact(now_ms, safe_offset) {
      Ok(stats) => Ok(Some(stats)),
      Err(source) => Err(self.log_err(source)),
    }
  }

  pub(crate) fn set_persisted_checkpoint(&mut self, checkpoint: Option<u64>) {
    self.persisted_checkpoint = checkpoint;
  }
}

fn read_data_file(path: &Path) -> std::io::Result<BTreeMap<Bytes, Bytes>> {
  let data = fs::read_to_string(path)?;
  if data.trim().is_empty() {
    return Ok(BTreeMap::new());
  }
  let encoded: BTreeMap<String, String> =
    serde_json::from_str(&data).map_err(std::io::Error::other)?;
  let mut map = BTreeMap::new();
  for (k, v) in encoded {
    let key = STANDARD.decode(k).map_err(std::io::Error::other)?;
    let value = STANDARD.decode(v).map_err(std::io::Error::other)?;
    map.insert(Bytes::from(key), Bytes::from(value));
  }
  Ok(map)
}

fn write_data_file(path: &Path, map: &BTreeMap<Bytes, Bytes>) -> std::io::Result<()> {
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent)?;
  }
  let encoded: BTreeMap<String, String> = map
    .iter()
    .map(|(k, v)| (STANDARD.encode(k), STANDARD.encode(v)))
    .collect();
  let json = serde_json::to_string(&encoded).map_err(std::io::Error::other)?;
  let tmp = path.with_extension("db.tmp");
  fs::write(&tmp, json)?;
  fs::rename(&tmp, path)
}

/// Owns every store of a stream task.
#[derive(Debug)]
pub struct StoreRegistry {
  stores: HashMap<String, StateStore>,
  order: Vec<String>,
  checkpoints: Box<dyn CheckpointStore>,
}

impl StoreRegistry {
  /// Opens all `specs` under `dir`, reading checkpoints from `checkpoints`.
  pub fn open(
    specs: &[Arc<StoreSpec>],
    dir: &StateDirectory,
    checkpoints: Box<dyn CheckpointStore>,
  ) -> Result<Self, StoreError> {
    let mut stores = HashMap::with_capacity(specs.len());
    let mut order = Vec::with_capacity(specs.len());
    for spec in specs {
      let store = StateStore::open(Arc::clone(spec), dir, checkpoints.as_ref())?;
      order.push(spec.name().to_string());
      stores.insert(spec.name().to_string(), store);
    }
    Ok(Self {
      stores,
      order,
      checkpoints,
    })
  }

  /// Returns a store by name.
  pub fn get(&self, name: &str) -> Option<&StateStore> {
    self.stores.get(name)
  }

  /// Returns a store by name for mutation.
  pub fn get_mut(&mut self, name: &str) -> Option<&mut StateStore> {
    self.stores.get_mut(name)
  }

  /// Store names in declaration order.
  pub fn names(&self) -> &[String] {
    &self.order
  }

  /// Visits every store mutably in declaration order.
  pub fn for_each_mut<E>(
    &mut self,
    mut f: impl FnMut(&mut StateStore) -> Result<(), E>,
  ) -> Result<(), E> {
    for name in &self.order {
      if let Some(store) = self.stores.get_mut(name) {
        f(store)?;
      }
    }
    Ok(())
  }

  /// Flushes every store, persists their checkpoints, then compacts logs
  /// that are due.
  pub fn commit(&mut self, now_ms: i64) -> Result<(), StoreError> {
    let mut committed = HashMap::new();
    for name in &self.order {
      let Some(store) = self.stores.get_mut(name) else {
        continue;
      };
      if let Some(checkpoint) = store.flush()? {
        committed.insert(name.clone(), checkpoint);
      }
    }
    if !committed.is_empty() {
      self
        .checkpoints
        .commit_all(&committed)
        .map_err(|source| StoreError::Checkpoint {
          store: committed.keys().cloned().collect::<Vec<_>>().join(","),
          source,
        })?;
    }
    for name in &self.order {
      let Some(store) = self.stores.get_mut(name) else {
        continue;
      };
      if let Some(checkpoint) = committed.get(name) {
        store.set_persisted_checkpoint(Some(*checkpoint));
      }
      if let Some(stats) = store.maybe_compact(now_ms)? {
        debug!(store = %name, before = stats.before, after = stats.after, "compacted store change log");
      }
    }
    Ok(())
  }
}
