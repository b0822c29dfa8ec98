//! # Processors
//!
//! A [`Processor`] is the unit of work at every node of a topology. Sources,
//! sinks and user logic all implement it; a stream task instantiates one
//! processor per node from the topology's suppliers and drives them with a
//! single thread of control.
//!
//! ## Dispatch
//!
//! [`ProcessorContext::forward`] hands a record to every child of the current
//! node and returns once the whole subtree below has processed it
//! (depth-first). Records of one key are therefore processed strictly in
//! arrival order and a processor may read, modify and write store entries
//! without concurrent writers.
//!
//! ## State
//!
//! [`ProcessorContext::store`] opens a typed view of a store connected to the
//! current processor. Stores still restoring cannot be opened.
//!
//! ## Punctuation
//!
//! A processor may call [`ProcessorContext::schedule`] (usually from
//! [`Processor::init`]) to have [`Processor::punctuate`] invoked on wall-clock
//! intervals, checked at poll-loop boundaries.

pub mod cogroup;
pub mod map;
pub mod sink;
pub mod source;

pub use cogroup::{CoGroupProcessor, CoGrouped, EmitMode};
pub use map::{MapProcessor, PrintProcessor};
pub use sink::SinkNode;
pub use source::SourceNode;

use crate::channel::Channels;
use crate::error::{ProcessorError, StoreError};
use crate::record::Record;
use crate::state::{KeyValueStore, StoreRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-record processing logic of a topology node.
pub trait Processor: Send {
  /// Called once after restoration, before the first record.
  fn init(&mut self, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessorError> {
    let _ = ctx;
    Ok(())
  }

  /// Processes one record.
  fn process(&mut self, record: Record, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessorError>;

  /// Called when a punctuation scheduled with [`ProcessorContext::schedule`]
  /// is due. `timestamp_ms` is the wall-clock time.
  fn punctuate(&mut self, timestamp_ms: i64, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessorError> {
    let _ = (timestamp_ms, ctx);
    Ok(())
  }

  /// Called once when the task shuts down.
  fn close(&mut self) {}
}

/// Creates a fresh processor instance for each stream task.
pub type ProcessorSupplier = Arc<dyn Fn() -> Box<dyn Processor> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Punctuation {
  interval: Duration,
  next_due: Instant,
}

/// A node as instantiated inside a stream task.
pub(crate) struct TaskNode {
  pub(crate) name: String,
  pub(crate) children: Vec<usize>,
  pub(crate) stores: Vec<String>,
  // taken out while the processor runs
  pub(crate) processor: Option<Box<dyn Processor>>,
  pub(crate) punctuation: Option<Punctuation>,
}

/// The processors of a stream task, indexed by node.
pub(crate) struct NodeTable {
  nodes: Vec<TaskNode>,
  index: HashMap<String, usize>,
  failed: Option<String>,
}

impl NodeTable {
  pub(crate) fn new(nodes: Vec<TaskNode>) -> Self {
    let index = nodes
      .iter()
      .enumerate()
      .map(|(i, n)| (n.name.clone(), i))
      .collect();
    Self {
      nodes,
      index,
      failed: None,
    }
  }

  pub(crate) fn len(&self) -> usize {
    self.nodes.len()
  }

  pub(crate) fn index_of(&self, name: &str) -> Option<usize> {
    self.index.get(name).copied()
  }

  pub(crate) fn name(&self, node: usize) -> &str {
    self.nodes.get(node).map_or("", |n| n.name.as_str())
  }

  /// Name of the node whose processor returned the last error, cleared on read.
  pub(crate) fn take_failed(&mut self) -> Option<String> {
    self.failed.take()
  }

  /// Nodes whose punctuation is due at `now`, rescheduling them.
  pub(crate) fn due_punctuations(&mut self, now: Instant) -> Vec<usize> {
    let mut due = Vec::new();
    for (i, node) in self.nodes.iter_mut().enumerate() {
      if let Some(p) = node.punctuation.as_mut() {
        if p.next_due <= now {
          p.next_due = now + p.interval;
          due.push(i);
        }
      }
    }
    due
  }

  pub(crate) fn close_all(&mut self) {
    for node in &mut self.nodes {
      if let Some(processor) = node.processor.as_mut() {
        processor.close();
      }
    }
  }

  fn run<F>(
    &mut self,
    stores: &mut StoreRegistry,
    channels: &Channels,
    node: usize,
    timestamp_ms: i64,
    f: F,
  ) -> Result<(), ProcessorError>
  where
    F: FnOnce(&mut dyn Processor, &mut ProcessorContext<'_>) -> Result<(), ProcessorError>,
  {
    // a node with no processor is running further up the stack; the graph is
    // acyclic so this only happens for nodes not instantiated
    let Some(mut processor) = self.nodes.get_mut(node).and_then(|n| n.processor.take()) else {
      return Ok(());
    };
    let result = {
      let mut ctx = ProcessorContext {
        node,
        nodes: self,
        stores,
        channels,
        timestamp_ms,
      };
      f(processor.as_mut(), &mut ctx)
    };
    if let Some(n) = self.nodes.get_mut(node) {
      n.processor = Some(processor);
      if result.is_err() && self.failed.is_none() {
        self.failed = Some(n.name.clone());
      }
    }
    result
  }

  pub(crate) fn init(
    &mut self,
    stores: &mut StoreRegistry,
    channels: &Channels,
    node: usize,
  ) -> Result<(), ProcessorError> {
    self.run(stores, channels, node, crate::record::now_ms(), |p, ctx| p.init(ctx))
  }

  pub(crate) fn dispatch(
    &mut self,
    stores: &mut StoreRegistry,
    channels: &Channels,
    node: usize,
    record: Record,
  ) -> Result<(), ProcessorError> {
    let timestamp_ms = record.timestamp_ms();
    self.run(stores, channels, node, timestamp_ms, |p, ctx| p.process(record, ctx))
  }

  pub(crate) fn punctuate(
    &mut self,
    stores: &mut StoreRegistry,
    channels: &Channels,
    node: usize,
    timestamp_ms: i64,
  ) -> Result<(), ProcessorError> {
    self.run(stores, channels, node, timestamp_ms, |p, ctx| {
      p.punctuate(timestamp_ms, ctx)
    })
  }
}

/// Everything a processor may touch while it runs.
pub struct ProcessorContext<'a> {
  node: usize,
  nodes: &'a mut NodeTable,
  stores: &'a mut StoreRegistry,
  channels: &'a Channels,
  timestamp_ms: i64,
}

impl ProcessorContext<'_> {
  /// Name of the current node.
  pub fn name(&self) -> &str {
    self.nodes.name(self.node)
  }

  /// Timestamp of the record being processed, or the wall-clock time during
  /// `init` and `punctuate`.
  pub fn timestamp_ms(&self) -> i64 {
    self.timestamp_ms
  }

  /// Names of the current node's children.
  pub fn children(&self) -> Vec<&str> {
    self
      .nodes
      .nodes
      .get(self.node)
      .map(|n| n.children.iter().map(|&c| self.nodes.name(c)).collect())
      .unwrap_or_default()
  }

  pub(crate) fn channels(&self) -> &Channels {
    self.channels
  }

  /// Sends `record` to every child, depth-first.
  pub fn forward(&mut self, record: Record) -> Result<(), ProcessorError> {
    let children = self
      .nodes
      .nodes
      .get(self.node)
      .map(|n| n.children.clone())
      .unwrap_or_default();
    for child in children {
      self
        .nodes
        .dispatch(self.stores, self.channels, child, record.clone())?;
    }
    Ok(())
  }

  /// Sends `record` to the child named `child` only.
  pub fn forward_to(&mut self, child: &str, record: Record) -> Result<(), ProcessorError> {
    let target = self
      .nodes
      .index_of(child)
      .filter(|idx| {
        self
          .nodes
          .nodes
          .get(self.node)
          .is_some_and(|n| n.children.contains(idx))
      })
      .ok_or_else(|| ProcessorError::UnknownChild {
        processor: self.name().to_string(),
        child: child.to_string(),
      })?;
    self.nodes.dispatch(self.stores, self.channels, target, record)
  }

  /// Opens the store `name` with key type `K` and value type `V`.
  ///
  /// Fails if the store is not connected to this processor, is still
  /// restoring, or was declared with other types.
  pub fn store<K: 'static, V: 'static>(
    &mut self,
    name: &str,
  ) -> Result<KeyValueStore<'_, K, V>, StoreError> {
    let connected = self
      .nodes
      .nodes
      .get(self.node)
      .is_some_and(|n| n.stores.iter().any(|s| s == name));
    if !connected {
      return Err(match self.stores.get(name) {
        Some(_) => StoreError::NotConnected {
          store: name.to_string(),
          processor: self.name().to_string(),
        },
        None => StoreError::Unknown(name.to_string()),
      });
    }
    let store = self
      .stores
      .get_mut(name)
      .ok_or_else(|| StoreError::Unknown(name.to_string()))?;
    if !store.is_restored() {
      return Err(StoreError::NotRestored(name.to_string()));
    }
    Ok(KeyValueStore::new(store)?.with_timestamp(self.timestamp_ms))
  }

  /// Schedules [`Processor::punctuate`] every `interval` of wall-clock time.
  /// Replaces any earlier schedule of this node.
  pub fn schedule(&mut self, interval: Duration) {
    if let Some(node) = self.nodes.nodes.get_mut(self.node) {
      node.punctuation = Some(Punctuation {
        interval,
        next_due: Instant::now() + interval,
      });
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::checkpoint::InMemoryCheckpointStore;
  use crate::codec::{JsonSerde, StringSerde};
  use crate::state::{StateDirectory, Stores};
  use std::sync::Mutex;
  use tempfile::TempDir;

  struct Collect(Arc<Mutex<Vec<(String, i64)>>>);

  impl Processor for Collect {
    fn process(&mut self, record: Record, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessorError> {
      let value = record.value::<String>().cloned().unwrap_or_default();
      self.0.lock().unwrap().push((format!("{}:{value}", ctx.name()), record.timestamp_ms()));
      ctx.forward(record)
    }
  }

  struct Counter {
    store: &'static str,
  }

  impl Processor for Counter {
    fn process(&mut self, record: Record, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessorError> {
      let key = record.key::<String>().cloned().unwrap_or_default();
      let mut counts = ctx.store::<String, u64>(self.store)?;
      let next = counts.get(&key)?.unwrap_or(0) + 1;
      counts.put(&key, &next)?;
      ctx.forward(record.with_value(next))
    }
  }

  fn node(name: &str, children: Vec<usize>, stores: Vec<&str>, p: Box<dyn Processor>) -> TaskNode {
    TaskNode {
      name: name.to_string(),
      children,
      stores: stores.into_iter().map(String::from).collect(),
      processor: Some(p),
      punctuation: None,
    }
  }

  fn registry(tmp: &TempDir) -> StoreRegistry {
    let spec = Arc::new(Stores::key_value::<String, u64>("counts", StringSerde, JsonSerde::new()).build());
    let dir = StateDirectory::new(tmp.path(), "app");
    let mut registry =
      StoreRegistry::open(&[spec], &dir, Box::new(InMemoryCheckpointStore::new())).unwrap();
    registry
      .for_each_mut(|s| {
        s.mark_restored();
        Ok::<_, ()>(())
      })
      .unwrap();
    registry
  }

  #[test]
  fn forward_is_depth_first() {
    let tmp = TempDir::new().unwrap();
    let mut stores = registry(&tmp);
    let seen = Arc::new(Mutex::new(Vec::new()));
    // a -> (b -> d), c
    let mut table = NodeTable::new(vec![
      node("a", vec![1, 2], vec![], Box::new(Collect(seen.clone()))),
      node("b", vec![3], vec![], Box::new(Collect(seen.clone()))),
      node("c", vec![], vec![], Box::new(Collect(seen.clone()))),
      node("d", vec![], vec![], Box::new(Collect(seen.clone()))),
    ]);
    table
      .dispatch(&mut stores, &Channels::new(), 0, Record::new("k".to_string(), "v".to_string(), 7, "in"))
      .unwrap();
    let names: Vec<String> = seen.lock().unwrap().iter().map(|(n, _)| n.clone()).collect();
    assert_eq!(names, vec!["a:v", "b:v", "d:v", "c:v"]);
    assert!(seen.lock().unwrap().iter().all(|(_, ts)| *ts == 7));
  }

  #[test]
  fn store_access_is_limited_to_connected_processors() {
    let tmp = TempDir::new().unwrap();
    let mut stores = registry(&tmp);
    let mut table = NodeTable::new(vec![
      node("connected", vec![], vec!["counts"], Box::new(Counter { store: "counts" })),
      node("stranger", vec![], vec![], Box::new(Counter { store: "counts" })),
    ]);
    let record = Record::new("k".to_string(), "v".to_string(), 1, "in");
    table.dispatch(&mut stores, &Channels::new(), 0, record.clone()).unwrap();
    table.dispatch(&mut stores, &Channels::new(), 0, record.clone()).unwrap();

    let err = table
      .dispatch(&mut stores, &Channels::new(), 1, record)
      .unwrap_err();
    assert!(matches!(
      err,
      ProcessorError::Store(StoreError::NotConnected { ref processor, .. }) if processor == "stranger"
    ));
    assert_eq!(table.take_failed().as_deref(), Some("stranger"));
    assert_eq!(stores.get("counts").unwrap().len(), 1);
  }

  #[test]
  fn restoring_store_cannot_be_opened() {
    let tmp = TempDir::new().unwrap();
    let spec = Arc::new(Stores::key_value::<String, u64>("counts", StringSerde, JsonSerde::new()).build());
    let dir = StateDirectory::new(tmp.path(), "app");
    let mut stores =
      StoreRegistry::open(&[spec], &dir, Box::new(InMemoryCheckpointStore::new())).unwrap();
    let mut table = NodeTable::new(vec![node(
      "connected",
      vec![],
      vec!["counts"],
      Box::new(Counter { store: "counts" }),
    )]);
    let err = table
      .dispatch(&mut stores, &Channels::new(), 0, Record::new("k".to_string(), 1u8, 1, "in"))
      .unwrap_err();
    assert!(matches!(err, ProcessorError::Store(StoreError::NotRestored(_))));
  }

  #[test]
  fn forward_to_rejects_non_children() {
    struct Router;
    impl Processor for Router {
      fn process(&mut self, record: Record, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessorError> {
        ctx.forward_to("sibling", record)
      }
    }
    let tmp = TempDir::new().unwrap();
    let mut stores = registry(&tmp);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut table = NodeTable::new(vec![
      node("router", vec![], vec![], Box::new(Router)),
      node("sibling", vec![], vec![], Box::new(Collect(seen))),
    ]);
    let err = table
      .dispatch(&mut stores, &Channels::new(), 0, Record::new(1u8, 1u8, 1, "in"))
      .unwrap_err();
    assert!(matches!(err, ProcessorError::UnknownChild { .. }));
  }
}
