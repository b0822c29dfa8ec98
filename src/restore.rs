//! # Restoration
//!
//! Before a stream task processes its first record, every change-logged store
//! is rebuilt by replaying its change log. The [`RestorationCoordinator`]
//! replays each store from the entry after its checkpoint up to the log end
//! observed when restoration started, applying entries in log order and
//! advancing the checkpoint after each one.
//!
//! Progress is reported to a [`StateRestoreListener`], invoked synchronously on
//! the restoring thread. A restoration either ends with
//! [`on_restore_end`](StateRestoreListener::on_restore_end) and the store is
//! marked restored, or with
//! [`on_restore_aborted`](StateRestoreListener::on_restore_aborted) and the store
//! stays unreadable.
//!
//! Checkpoints reached during restoration are persisted by the next commit; a
//! crash before that replays the same entries again, which is harmless since
//! applying a change log entry is idempotent.

use crate::error::RestoreError;
use crate::state::{StateStore, StoreRegistry};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Receives restoration progress.
pub trait StateRestoreListener: Send + Sync {
  /// Restoration of `store` begins. Entries `[start_offset, end_offset)` of
  /// `changelog` will be replayed.
  fn on_restore_start(&self, store: &str, changelog: &str, start_offset: u64, end_offset: u64);

  /// A batch was applied. `batch_end_offset` is the last offset applied and
  /// `restored` the number of entries applied so far.
  fn on_batch_restored(&self, store: &str, batch_end_offset: u64, restored: u64);

  /// Restoration of `store` completed.
  fn on_restore_end(&self, store: &str, total_restored: u64, elapsed: Duration);

  /// Restoration of `store` failed after `restored` entries. The store is not
  /// usable.
  fn on_restore_aborted(&self, store: &str, restored: u64, error: &RestoreError) {
    let _ = (store, restored, error);
  }
}

/// Listener that ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRestoreListener;

impl StateRestoreListener for NoopRestoreListener {
  fn on_restore_start(&self, _: &str, _: &str, _: u64, _: u64) {}
  fn on_batch_restored(&self, _: &str, _: u64, _: u64) {}
  fn on_restore_end(&self, _: &str, _: u64, _: Duration) {}
}

/// Listener that logs progress through `tracing`.
#[derive(Debug, Default)]
pub struct LoggingRestoreListener {
  // store -> offset range being restored
  ranges: Mutex<HashMap<String, (u64, u64)>>,
}

impl LoggingRestoreListener {
  /// Creates the listener.
  pub fn new() -> Self {
    Self::default()
  }

  fn range(&self, store: &str) -> Option<(u64, u64)> {
    let ranges = self.ranges.lock().unwrap_or_else(|e| e.into_inner());
    ranges.get(store).copied()
  }
}

/// Share of the offset range `[start_offset, end_offset)` covered once
/// `batch_end_offset` is applied. Offsets rather than entry counts are used
/// because a compacted log holds fewer entries than its offset range.
fn progress_percent(start_offset: u64, end_offset: u64, batch_end_offset: u64) -> f64 {
  let span = end_offset.saturating_sub(start_offset);
  if span == 0 {
    return 100.0;
  }
  let covered = (batch_end_offset + 1).saturating_sub(start_offset).min(span);
  covered as f64 / span as f64 * 100.0
}

impl StateRestoreListener for LoggingRestoreListener {
  fn on_restore_start(&self, store: &str, changelog: &str, start_offset: u64, end_offset: u64) {
    let total = end_offset.saturating_sub(start_offset);
    self
      .ranges
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .insert(store.to_string(), (start_offset, end_offset));
    info!(
      store,
      changelog,
      start_offset,
      end_offset,
      to_restore = total,
      "started restoring state store"
    );
  }

  fn on_batch_restored(&self, store: &str, batch_end_offset: u64, restored: u64) {
    let percent = match self.range(store) {
      Some((start, end)) => progress_percent(start, end, batch_end_offset),
      None => 100.0,
    };
    info!(
      store,
      batch_end_offset,
      restored,
      progress = %format!("{percent:.1}%"),
      "restoring state store"
    );
  }

  fn on_restore_end(&self, store: &str, total_restored: u64, elapsed: Duration) {
    self
      .ranges
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .remove(store);
    info!(
      store,
      total_restored,
      elapsed_ms = elapsed.as_millis() as u64,
      "restoration complete"
    );
  }

  fn on_restore_aborted(&self, store: &str, restored: u64, error: &RestoreError) {
    self
      .ranges
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .remove(store);
    warn!(store, restored, error = %error, "restoration aborted");
  }
}

/// Outcome of restoring one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreSummary {
  /// Store name.
  pub store: String,
  /// First offset replayed.
  pub start_offset: u64,
  /// Log end observed at start (exclusive).
  pub end_offset: u64,
  /// Entries applied.
  pub restored: u64,
}

/// Replays change logs into their stores.
pub struct RestorationCoordinator<'a> {
  batch_size: usize,
  listener: &'a dyn StateRestoreListener,
}

impl<'a> RestorationCoordinator<'a> {
  /// Creates a coordinator reporting to `listener` every `batch_size` entries.
  pub fn new(batch_size: usize, listener: &'a dyn StateRestoreListener) -> Self {
    Self {
      batch_size: batch_size.max(1),
      listener,
    }
  }

  /// Restores every store of `registry` that still needs it, in declaration
  /// order. Stops at the first failure.
  pub fn restore_all(&self, registry: &mut StoreRegistry) -> Result<Vec<RestoreSummary>, RestoreError> {
    let mut summaries = Vec::new();
    registry.for_each_mut(|store| {
      if let Some(summary) = self.restore(store)? {
        summaries.push(summary);
      }
      Ok(())
    })?;
    Ok(summaries)
  }

  /// Restores one store. Returns `None` if the store had nothing to do.
  pub fn restore(&self, store: &mut StateStore) -> Result<Option<RestoreSummary>, RestoreError> {
    if store.is_restored() {
      return Ok(None);
    }
    if store.changelog().is_none() {
      store.mark_restored();
      return Ok(None);
    }
    let name = store.name().to_string();
    let checkpoint = store.checkpoint();
    let Some(log) = store.changelog_mut() else {
      return Ok(None);
    };

    let start_offset = checkpoint.map_or(0, |c| c + 1).max(log.start_offset());
    let end_offset = log.end_offset();
    if start_offset >= end_offset {
      debug!(store = %name, ?checkpoint, "state store is up to date");
      store.mark_restored();
      return Ok(None);
    }

    let changelog = log.name().to_string();
    let started = Instant::now();
    self
      .listener
      .on_restore_start(&name, &changelog, start_offset, end_offset);

    let mut restored = 0u64;
    let result = log
      .read_from(start_offset)
      .map_err(|source| RestoreError::ChangeLog {
        store: name.clone(),
        restored,
        source,
      })
      .and_then(|reader| {
        let mut in_batch = 0usize;
        let mut last_applied = None;
        for entry in reader {
          let record = entry.map_err(|source| RestoreError::ChangeLog {
            store: name.clone(),
            restored,
            source,
          })?;
          let offset = record.offset;
          store.apply_restored(record);
          last_applied = Some(offset);
          restored += 1;
          in_batch += 1;
          if in_batch == self.batch_size {
            self.listener.on_batch_restored(&name, offset, restored);
            in_batch = 0;
          }
        }
        let reached = last_applied.map_or(start_offset, |o| o + 1);
        if reached != end_offset {
          return Err(RestoreError::Truncated {
            store: name.clone(),
            expected: end_offset,
            reached,
          });
        }
        if in_batch > 0 {
          self.listener.on_batch_restored(&name, reached - 1, restored);
        }
        Ok(())
      });

    match result {
      Ok(()) => {
        store.mark_restored();
        self.listener.on_restore_end(&name, restored, started.elapsed());
        Ok(Some(RestoreSummary {
          store: name,
          start_offset,
          end_offset,
          restored,
        }))
      }
      Err(err) => {
        self.listener.on_restore_aborted(&name, restored, &err);
        Err(err)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::checkpoint::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
  use crate::codec::{JsonSerde, StringSerde};
  use crate::state::{KeyValueStore, StateDirectory, StoreSpec, Stores};
  use std::sync::Arc;
  use tempfile::TempDir;

  #[derive(Debug, Clone, PartialEq, Eq)]
  enum Event {
    Start(u64, u64),
    Batch(u64, u64),
    End(u64),
    Aborted(u64),
  }

  #[derive(Default)]
  struct Recorder {
    events: Mutex<Vec<Event>>,
  }

  impl Recorder {
    fn events(&self) -> Vec<Event> {
      self.events.lock().unwrap().clone()
    }
  }

  impl StateRestoreListener for Recorder {
    fn on_restore_start(&self, _: &str, _: &str, start: u64, end: u64) {
      self.events.lock().unwrap().push(Event::Start(start, end));
    }
    fn on_batch_restored(&self, _: &str, end: u64, restored: u64) {
      self.events.lock().unwrap().push(Event::Batch(end, restored));
    }
    fn on_restore_end(&self, _: &str, total: u64, _: Duration) {
      self.events.lock().unwrap().push(Event::End(total));
    }
    fn on_restore_aborted(&self, _: &str, restored: u64, _: &RestoreError) {
      self.events.lock().unwrap().push(Event::Aborted(restored));
    }
  }

  fn spec(persistent: bool) -> Arc<StoreSpec> {
    let builder = Stores::key_value::<String, Vec<String>>("tuples", StringSerde, JsonSerde::new());
    let builder = if persistent { builder.persistent() } else { builder };
    Arc::new(builder.build())
  }

  /// Writes `ops` through a fresh in-memory store and flushes the log.
  fn write_log(dir: &StateDirectory, ops: &[(&str, Option<Vec<&str>>)]) {
    let mut store = StateStore::open(spec(false), dir, &InMemoryCheckpointStore::new()).unwrap();
    RestorationCoordinator::new(10, &NoopRestoreListener)
      .restore(&mut store)
      .unwrap();
    let mut kv = KeyValueStore::<String, Vec<String>>::new(&mut store).unwrap();
    for (key, value) in ops {
      match value {
        Some(v) => kv
          .put(&key.to_string(), &v.iter().map(|s| s.to_string()).collect::<Vec<_>>())
          .unwrap(),
        None => {
          kv.delete(&key.to_string()).unwrap();
        }
      }
    }
    store.changelog_mut().unwrap().flush().unwrap();
  }

  fn contents(store: &mut StateStore) -> Vec<(String, Vec<String>)> {
    KeyValueStore::<String, Vec<String>>::new(store)
      .unwrap()
      .all()
      .unwrap()
  }

  #[test]
  fn progress_follows_offsets_on_compacted_logs() {
    // a compacted log over offsets 0..10 that only kept offsets 4 and 9
    assert_eq!(progress_percent(0, 10, 4), 50.0);
    assert_eq!(progress_percent(0, 10, 9), 100.0);
    assert_eq!(progress_percent(6, 10, 7), 50.0);
    assert_eq!(progress_percent(3, 3, 3), 100.0);
  }

  #[test]
  fn put_append_delete_replays_to_absent() {
    let tmp = TempDir::new().unwrap();
    let dir = StateDirectory::new(tmp.path(), "app");
    write_log(
      &dir,
      &[("A", Some(vec!["x"])), ("A", Some(vec!["x", "y"])), ("A", None)],
    );

    let mut store = StateStore::open(spec(false), &dir, &InMemoryCheckpointStore::new()).unwrap();
    assert_eq!(store.changelog().unwrap().len(), 3);
    let recorder = Recorder::default();
    let summary = RestorationCoordinator::new(2, &recorder)
      .restore(&mut store)
      .unwrap()
      .unwrap();
    assert_eq!(summary.restored, 3);
    assert!(store.is_restored());
    assert!(store.is_empty());
    assert_eq!(
      recorder.events(),
      vec![
        Event::Start(0, 3),
        Event::Batch(1, 2),
        Event::Batch(2, 3),
        Event::End(3)
      ]
    );
  }

  #[test]
  fn empty_log_needs_no_notification() {
    let tmp = TempDir::new().unwrap();
    let dir = StateDirectory::new(tmp.path(), "app");
    let mut store = StateStore::open(spec(false), &dir, &InMemoryCheckpointStore::new()).unwrap();
    let recorder = Recorder::default();
    let summary = RestorationCoordinator::new(10, &recorder)
      .restore(&mut store)
      .unwrap();
    assert!(summary.is_none());
    assert!(store.is_restored());
    assert!(recorder.events().is_empty());
  }

  #[test]
  fn resumes_from_checkpoint_after_crash() {
    let tmp = TempDir::new().unwrap();
    let dir = StateDirectory::new(tmp.path(), "app");
    let ops = [
      ("A", Some(vec!["1"])),
      ("B", Some(vec!["2"])),
      ("A", Some(vec!["1", "3"])),
      ("C", Some(vec!["4"])),
      ("B", None),
      ("C", Some(vec!["4", "5"])),
    ];
    write_log(&dir, &ops);

    // uninterrupted replay
    let mut full = StateStore::open(spec(false), &dir, &InMemoryCheckpointStore::new()).unwrap();
    RestorationCoordinator::new(100, &NoopRestoreListener)
      .restore(&mut full)
      .unwrap();

    // a persistent store that crashed after committing offset 2
    let checkpoints = FileCheckpointStore::open(dir.checkpoint_file()).unwrap();
    {
      let mut partial = StateStore::open(spec(true), &dir, &checkpoints).unwrap();
      let mut reader = partial.changelog_mut().unwrap().read_from(0).unwrap();
      for _ in 0..3 {
        let record = reader.next().unwrap().unwrap();
        partial.apply_restored(record);
      }
      assert_eq!(partial.flush().unwrap(), Some(2));
      checkpoints.commit("tuples", 2).unwrap();
    }

    let mut resumed = StateStore::open(spec(true), &dir, &checkpoints).unwrap();
    assert_eq!(resumed.checkpoint(), Some(2));
    let recorder = Recorder::default();
    let summary = RestorationCoordinator::new(100, &recorder)
      .restore(&mut resumed)
      .unwrap()
      .unwrap();
    assert_eq!(summary.start_offset, 3);
    assert_eq!(summary.restored, 3);
    assert_eq!(resumed.checkpoint(), Some(5));
    assert_eq!(contents(&mut resumed), contents(&mut full));
  }

  #[test]
  fn corrupt_log_aborts_restoration() {
    let tmp = TempDir::new().unwrap();
    let dir = StateDirectory::new(tmp.path(), "app");
    write_log(&dir, &[("A", Some(vec!["1"])), ("B", Some(vec!["2"]))]);
    let path = dir.changelog_file("tuples");
    let mut data = std::fs::read_to_string(&path).unwrap();
    data.push_str("{\"offset\":2,\"ts\":");
    std::fs::write(&path, data).unwrap();

    let mut store = StateStore::open(spec(false), &dir, &InMemoryCheckpointStore::new()).unwrap();
    let recorder = Recorder::default();
    let err = RestorationCoordinator::new(10, &recorder)
      .restore(&mut store)
      .unwrap_err();
    assert!(matches!(err, RestoreError::ChangeLog { restored: 2, .. }));
    assert!(!store.is_restored());
    assert_eq!(
      recorder.events(),
      vec![Event::Start(0, 2), Event::Aborted(2)]
    );
  }

  #[test]
  fn log_truncated_after_open_aborts_restoration() {
    let tmp = TempDir::new().unwrap();
    let dir = StateDirectory::new(tmp.path(), "app");
    write_log(&dir, &[("A", Some(vec!["1"])), ("B", Some(vec!["2"]))]);

    let mut store = StateStore::open(spec(false), &dir, &InMemoryCheckpointStore::new()).unwrap();
    let path = dir.changelog_file("tuples");
    let first = std::fs::read_to_string(&path)
      .unwrap()
      .lines()
      .next()
      .unwrap()
      .to_string();
    std::fs::write(&path, format!("{first}\n")).unwrap();

    let err = RestorationCoordinator::new(10, &NoopRestoreListener)
      .restore(&mut store)
      .unwrap_err();
    assert!(matches!(
      err,
      RestoreError::Truncated {
        expected: 2,
        reached: 1,
        ..
      }
    ));
    assert!(!store.is_restored());
  }
}
