//! Restoration through the runtime: listener notifications and the state seen
//! after a clean shutdown.

use stateweave::channel::Channels;
use stateweave::checkpoint::FileCheckpointStore;
use stateweave::codec::{JsonSerde, StringSerde};
use stateweave::config::StreamsConfig;
use stateweave::error::{ProcessorError, RestoreError};
use stateweave::processor::{Processor, ProcessorContext};
use stateweave::record::Record;
use stateweave::restore::{NoopRestoreListener, RestorationCoordinator, StateRestoreListener};
use stateweave::runtime::Runtime;
use stateweave::state::{KeyValueStore, StateDirectory, StateStore, StoreSpec, Stores};
use stateweave::topology::Topology;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
  Start(String, u64, u64),
  Batch(u64, u64),
  End(u64),
  Aborted(u64),
}

#[derive(Default)]
struct Recorder(Mutex<Vec<Event>>);

impl StateRestoreListener for Recorder {
  fn on_restore_start(&self, _store: &str, changelog: &str, start_offset: u64, end_offset: u64) {
    self
      .0
      .lock()
      .unwrap()
      .push(Event::Start(changelog.to_string(), start_offset, end_offset));
  }

  fn on_batch_restored(&self, _store: &str, batch_end_offset: u64, restored: u64) {
    self.0.lock().unwrap().push(Event::Batch(batch_end_offset, restored));
  }

  fn on_restore_end(&self, _store: &str, total_restored: u64, _elapsed: Duration) {
    self.0.lock().unwrap().push(Event::End(total_restored));
  }

  fn on_restore_aborted(&self, _store: &str, restored: u64, _error: &RestoreError) {
    self.0.lock().unwrap().push(Event::Aborted(restored));
  }
}

/// Keeps the latest value per key; deletes the key on an empty value.
struct Latest;

impl Processor for Latest {
  fn process(&mut self, record: Record, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessorError> {
    let (Some(key), Some(value)) = (record.key::<String>(), record.value::<String>()) else {
      return Ok(());
    };
    let mut latest = ctx.store::<String, String>("latest")?;
    if value.is_empty() {
      latest.delete(key)?;
    } else {
      latest.put(key, value)?;
    }
    Ok(())
  }
}

fn spec() -> StoreSpec {
  Stores::key_value::<String, String>("latest", StringSerde, StringSerde).build()
}

fn topology() -> Topology {
  let mut topology = Topology::new();
  topology
    .add_source("in", "updates", StringSerde, StringSerde)
    .unwrap()
    .add_processor("latest", || Latest, &["in"])
    .unwrap()
    .add_state_store(spec(), &["latest"])
    .unwrap();
  topology
}

fn config(tmp: &TempDir) -> StreamsConfig {
  StreamsConfig::new("latest-values")
    .with_state_dir(tmp.path())
    .with_poll_timeout(Duration::from_millis(10))
    .with_restore_batch_size(2)
}

fn send(channels: &Channels, key: &str, value: &str) {
  channels
    .producer("updates", StringSerde, StringSerde)
    .send(&key.to_string(), &value.to_string())
    .unwrap();
}

async fn run_until_consumed(tmp: &TempDir, channels: &Channels, count: u64) {
  let config = config(tmp).with_commit_interval(Duration::from_millis(20));
  let mut runtime = Runtime::new(topology(), channels.clone(), config).unwrap();
  runtime.start().await.unwrap();
  let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
  while channels.committed("latest-values", "updates") != Some(count) {
    assert!(tokio::time::Instant::now() < deadline, "records were not consumed");
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  runtime.close().await.unwrap();
}

fn reopen(tmp: &TempDir) -> StateStore {
  let dirs = StateDirectory::new(tmp.path(), "latest-values");
  let checkpoints = FileCheckpointStore::open(dirs.checkpoint_file()).unwrap();
  let mut store = StateStore::open(Arc::new(spec()), &dirs, &checkpoints).unwrap();
  RestorationCoordinator::new(100, &NoopRestoreListener)
    .restore(&mut store)
    .unwrap();
  store
}

#[tokio::test]
async fn test_listener_receives_batches() {
  let tmp = TempDir::new().unwrap();
  let channels = Channels::new();
  for (k, v) in [("a", "1"), ("b", "2"), ("a", "3"), ("c", "4"), ("b", "")] {
    send(&channels, k, v);
  }
  run_until_consumed(&tmp, &channels, 5).await;

  let recorder = Arc::new(Recorder::default());
  let mut runtime = Runtime::new(topology(), channels.clone(), config(&tmp)).unwrap();
  runtime.set_restore_listener(recorder.clone());
  runtime.start().await.unwrap();
  runtime.close().await.unwrap();

  assert_eq!(
    *recorder.0.lock().unwrap(),
    vec![
      Event::Start("latest-values-latest-changelog".to_string(), 0, 5),
      Event::Batch(1, 2),
      Event::Batch(3, 4),
      Event::Batch(4, 5),
      Event::End(5),
    ]
  );
}

#[tokio::test]
async fn test_closed_state_matches_replayed_log() {
  let tmp = TempDir::new().unwrap();
  let channels = Channels::new();
  for (k, v) in [("x", "1"), ("x", "2"), ("y", "9"), ("x", "")] {
    send(&channels, k, v);
  }
  run_until_consumed(&tmp, &channels, 4).await;

  let mut store = reopen(&tmp);
  let view = KeyValueStore::<String, String>::new(&mut store).unwrap();
  assert_eq!(view.get(&"x".to_string()).unwrap(), None);
  assert_eq!(view.get(&"y".to_string()).unwrap(), Some("9".to_string()));
  assert_eq!(view.approximate_num_entries(), 1);
}
