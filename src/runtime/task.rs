//! The stream task: one instance of a topology with its stores and consumer
//! positions, driven by a single thread of control.

use crate::channel::Channels;
use crate::checkpoint::FileCheckpointStore;
use crate::config::{OffsetResetPolicy, StreamsConfig, TimestampExtractor};
use crate::error::{ConfigError, ErrorAction, ProcessorError, StreamsError};
use crate::processor::source::SourceBinding;
use crate::processor::{NodeTable, SinkNode, SourceNode, TaskNode};
use crate::record::{Record, now_ms};
use crate::restore::{RestorationCoordinator, RestoreSummary, StateRestoreListener};
use crate::runtime::{Lifecycle, RuntimeState};
use crate::state::{StateDirectory, StoreRegistry};
use crate::topology::{NodeKind, Topology};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Processors, stores and source positions of one running topology.
pub struct StreamTask {
  group: String,
  channels: Channels,
  nodes: NodeTable,
  stores: StoreRegistry,
  sources: Vec<SourceBinding>,
  poll_timeout: Duration,
  commit_interval: Duration,
  max_poll_records: usize,
  restore_batch_size: usize,
  extractor: TimestampExtractor,
  error_action: ErrorAction,
}

impl StreamTask {
  /// Instantiates `topology`: opens its stores under `dirs`, creates one
  /// processor per node and positions every source on its channel.
  pub(crate) fn new(
    topology: &Topology,
    channels: Channels,
    config: &StreamsConfig,
    dirs: &StateDirectory,
  ) -> Result<Self, StreamsError> {
    let checkpoints = FileCheckpointStore::open(dirs.checkpoint_file())?;
    let stores = StoreRegistry::open(topology.stores(), dirs, Box::new(checkpoints))?;

    let specs = topology.nodes();
    let index: HashMap<&str, usize> = specs
      .iter()
      .enumerate()
      .map(|(i, n)| (n.name.as_str(), i))
      .collect();

    let mut nodes = Vec::with_capacity(specs.len());
    let mut sources = Vec::new();
    for (i, spec) in specs.iter().enumerate() {
      let processor: Box<dyn crate::processor::Processor> = match &spec.kind {
        NodeKind::Source {
          channel,
          key_serde,
          value_serde,
        } => {
          channels.create(channel);
          let position = start_position(&channels, &config.application_id, channel, config.auto_offset_reset)?;
          debug!(source = %spec.name, channel = %channel, position, "source positioned");
          sources.push(SourceBinding {
            node: i,
            name: spec.name.clone(),
            channel: Arc::from(channel.as_str()),
            key_serde: Arc::clone(key_serde),
            value_serde: Arc::clone(value_serde),
            position,
          });
          Box::new(SourceNode)
        }
        NodeKind::Processor { supplier } => supplier(),
        NodeKind::Sink {
          channel,
          key_serde,
          value_serde,
        } => {
          channels.create(channel);
          Box::new(SinkNode::new(
            channel.clone(),
            Arc::clone(key_serde),
            Arc::clone(value_serde),
          ))
        }
      };
      nodes.push(TaskNode {
        name: spec.name.clone(),
        children: spec
          .children
          .iter()
          .filter_map(|c| index.get(c.as_str()).copied())
          .collect(),
        stores: spec.stores.clone(),
        processor: Some(processor),
        punctuation: None,
      });
    }

    Ok(Self {
      group: config.application_id.clone(),
      channels,
      nodes: NodeTable::new(nodes),
      stores,
      sources,
      poll_timeout: config.poll_timeout,
      commit_interval: config.commit_interval,
      max_poll_records: config.max_poll_records,
      restore_batch_size: config.restore_batch_size,
      extractor: config.timestamp_extractor,
      error_action: config.processing_error_action,
    })
  }

  /// Replays every change-logged store, then commits so the reached
  /// checkpoints are persisted.
  pub(crate) fn restore(
    &mut self,
    listener: &dyn StateRestoreListener,
  ) -> Result<Vec<RestoreSummary>, StreamsError> {
    let coordinator = RestorationCoordinator::new(self.restore_batch_size, listener);
    let summaries = coordinator.restore_all(&mut self.stores)?;
    self.stores.commit(now_ms())?;
    let total: u64 = summaries.iter().map(|s| s.restored).sum();
    info!(stores = summaries.len(), records = total, "state restoration complete");
    Ok(summaries)
  }

  /// Calls `init` on every processor in topology order.
  pub(crate) fn init_processors(&mut self) -> Result<(), StreamsError> {
    for node in 0..self.nodes.len() {
      if let Err(source) = self.nodes.init(&mut self.stores, &self.channels, node) {
        let node = self
          .nodes
          .take_failed()
          .unwrap_or_else(|| self.nodes.name(node).to_string());
        return Err(StreamsError::Processor { node, source });
      }
    }
    Ok(())
  }

  /// Next offset each source will read, by channel.
  pub fn positions(&self) -> HashMap<String, u64> {
    self
      .sources
      .iter()
      .map(|s| (s.channel.to_string(), s.position))
      .collect()
  }

  /// Poll loop. Runs until `cancel` fires or a fatal error occurs.
  pub(crate) async fn run(
    mut self,
    cancel: CancellationToken,
    lifecycle: Lifecycle,
  ) -> Result<(), StreamsError> {
    let channels = self.channels.clone();
    let mut last_commit = Instant::now();

    let result = loop {
      if cancel.is_cancelled() {
        break Ok(());
      }
      let notified = channels.notified();

      let processed = match self.poll_once() {
        Ok(processed) => processed,
        Err(e) => break Err(e),
      };
      if let Err(e) = self.punctuate_due() {
        break Err(e);
      }
      if last_commit.elapsed() >= self.commit_interval {
        if let Err(e) = self.commit() {
          break Err(e);
        }
        last_commit = Instant::now();
      }

      if processed == 0 {
        tokio::select! {
          _ = notified => {}
          _ = tokio::time::sleep(self.poll_timeout) => {}
          _ = cancel.cancelled() => {}
        }
      } else {
        tokio::task::yield_now().await;
      }
    };

    self.nodes.close_all();
    match result {
      Ok(()) => {
        self.commit()?;
        info!(group = %self.group, "stream task stopped");
        Ok(())
      }
      Err(e) => {
        error!(group = %self.group, error = %e, "stream task failed");
        if lifecycle.state() == RuntimeState::Running {
          lifecycle.transition(RuntimeState::Closing);
        }
        Err(e)
      }
    }
  }

  /// Fetches and processes up to `max_poll_records` per source. Returns the
  /// number of records consumed.
  fn poll_once(&mut self) -> Result<usize, StreamsError> {
    let mut consumed = 0;
    for i in 0..self.sources.len() {
      let batch = {
        let source = &self.sources[i];
        self
          .channels
          .fetch(&source.channel, source.position, self.max_poll_records)
      };
      for raw in batch {
        match self.sources[i].decode(&raw, self.extractor) {
          Ok(record) => {
            let node = self.sources[i].node;
            self.process(node, record)?;
          }
          Err(e) => {
            let source = &self.sources[i];
            warn!(
              source = %source.name,
              channel = %source.channel,
              offset = raw.offset,
              error = %e,
              "skipping record that cannot be deserialized"
            );
          }
        }
        self.sources[i].position = raw.offset + 1;
        consumed += 1;
      }
    }
    Ok(consumed)
  }

  fn process(&mut self, node: usize, record: Record) -> Result<(), StreamsError> {
    let result = self
      .nodes
      .dispatch(&mut self.stores, &self.channels, node, record);
    self.handle_processor_result(node, result)
  }

  fn punctuate_due(&mut self) -> Result<(), StreamsError> {
    let due = self.nodes.due_punctuations(Instant::now());
    for node in due {
      let result = self
        .nodes
        .punctuate(&mut self.stores, &self.channels, node, now_ms());
      self.handle_processor_result(node, result)?;
    }
    Ok(())
  }

  fn handle_processor_result(
    &mut self,
    node: usize,
    result: Result<(), ProcessorError>,
  ) -> Result<(), StreamsError> {
    let Err(source) = result else {
      return Ok(());
    };
    let failed = self
      .nodes
      .take_failed()
      .unwrap_or_else(|| self.nodes.name(node).to_string());
    if source.is_fatal() || self.error_action == ErrorAction::Stop {
      return Err(StreamsError::Processor {
        node: failed,
        source,
      });
    }
    warn!(node = %failed, error = %source, "skipping record after processing error");
    Ok(())
  }

  /// Flushes stores, persists checkpoints and commits source positions.
  fn commit(&mut self) -> Result<(), StreamsError> {
    let stores = &mut self.stores;
    blocking(|| stores.commit(now_ms()))?;
    for source in &self.sources {
      self
        .channels
        .commit(&self.group, &source.channel, source.position);
    }
    debug!(group = %self.group, sources = self.sources.len(), "committed");
    Ok(())
  }
}

/// Runs synchronous disk I/O without stalling other tasks on a multi-threaded
/// runtime. A current-thread runtime cannot hand off its only worker, so `f`
/// runs in place there.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
  match Handle::try_current() {
    Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
      tokio::task::block_in_place(f)
    }
    _ => f(),
  }
}

fn start_position(
  channels: &Channels,
  group: &str,
  channel: &str,
  policy: OffsetResetPolicy,
) -> Result<u64, StreamsError> {
  if let Some(position) = channels.committed(group, channel) {
    return Ok(position);
  }
  match policy {
    OffsetResetPolicy::Earliest => Ok(0),
    OffsetResetPolicy::Latest => Ok(channels.end_offset(channel)),
    OffsetResetPolicy::None => Err(
      ConfigError::Invalid {
        key: "auto_offset_reset",
        reason: format!("no committed position for group '{group}' on channel '{channel}'"),
      }
      .into(),
    ),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn committed_position_wins_over_reset_policy() {
    let channels = Channels::new();
    for i in 0..3u8 {
      channels.produce("in", vec![i], vec![i], 0);
    }
    assert_eq!(start_position(&channels, "g", "in", OffsetResetPolicy::Earliest).unwrap(), 0);
    assert_eq!(start_position(&channels, "g", "in", OffsetResetPolicy::Latest).unwrap(), 3);
    assert!(matches!(
      start_position(&channels, "g", "in", OffsetResetPolicy::None),
      Err(StreamsError::Config(ConfigError::Invalid { .. }))
    ));

    channels.commit("g", "in", 2);
    assert_eq!(start_position(&channels, "g", "in", OffsetResetPolicy::None).unwrap(), 2);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn blocking_io_runs_on_multi_thread_runtime() {
    let handle = tokio::spawn(async { blocking(|| 40 + 2) });
    assert_eq!(handle.await.unwrap(), 42);
  }

  #[tokio::test]
  async fn blocking_io_runs_in_place_on_current_thread_runtime() {
    assert_eq!(blocking(|| "done"), "done");
  }

  #[test]
  fn blocking_io_runs_outside_a_runtime() {
    assert_eq!(blocking(|| 7), 7);
  }
}
