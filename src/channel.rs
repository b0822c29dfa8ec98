//! In-process channel broker.
//!
//! [`Channels`] is a registry of named, append-only, offset-addressed
//! channels. Source nodes fetch from it, sink nodes produce into it, and the
//! runtime commits its consumer positions per application (consumer group).
//! Cloning a `Channels` handle shares the same broker, so a broker outlives
//! the runtimes that read from it the way an external system would.
//!
//! ```text
//! producer ──► [ channel "events": 0 1 2 3 ... ] ──► source node
//!                                   ^ committed position of group "app"
//! ```

use crate::codec::Serde;
use crate::error::SerializationError;
use crate::record::now_ms;
use bytes::Bytes;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Notify;
use tokio::sync::futures::Notified;

/// A raw record stored in a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRecord {
  /// Position of the record in its channel.
  pub offset: u64,
  /// Serialized key.
  pub key: Bytes,
  /// Serialized value.
  pub value: Bytes,
  /// Producer timestamp in milliseconds since the Unix epoch.
  pub timestamp_ms: i64,
}

#[derive(Default)]
struct Broker {
  channels: RwLock<HashMap<String, Vec<ChannelRecord>>>,
  // (group, channel) -> next offset to read
  committed: RwLock<HashMap<(String, String), u64>>,
  notify: Notify,
}

/// Shared handle to the channel broker.
#[derive(Clone, Default)]
pub struct Channels {
  broker: Arc<Broker>,
}

impl Channels {
  /// Creates an empty broker.
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates `channel` if it does not exist yet.
  pub fn create(&self, channel: &str) {
    let mut channels = self
      .broker
      .channels
      .write()
      .unwrap_or_else(PoisonError::into_inner);
    channels.entry(channel.to_string()).or_default();
  }

  /// Appends a record and returns its offset. Creates the channel on first use.
  pub fn produce(
    &self,
    channel: &str,
    key: impl Into<Bytes>,
    value: impl Into<Bytes>,
    timestamp_ms: i64,
  ) -> u64 {
    let offset = {
      let mut channels = self
        .broker
        .channels
        .write()
        .unwrap_or_else(PoisonError::into_inner);
      let records = channels.entry(channel.to_string()).or_default();
      let offset = records.len() as u64;
      records.push(ChannelRecord {
        offset,
        key: key.into(),
        value: value.into(),
        timestamp_ms,
      });
      offset
    };
    self.broker.notify.notify_waiters();
    offset
  }

  /// Returns up to `max` records of `channel` starting at offset `from`.
  pub fn fetch(&self, channel: &str, from: u64, max: usize) -> Vec<ChannelRecord> {
    let channels = self
      .broker
      .channels
      .read()
      .unwrap_or_else(PoisonError::into_inner);
    let Some(records) = channels.get(channel) else {
      return Vec::new();
    };
    let start = usize::try_from(from).unwrap_or(usize::MAX).min(records.len());
    let end = start.saturating_add(max).min(records.len());
    records[start..end].to_vec()
  }

  /// Returns every record of `channel`.
  pub fn records(&self, channel: &str) -> Vec<ChannelRecord> {
    self.fetch(channel, 0, usize::MAX)
  }

  /// Offset the next produced record will receive (0 for unknown channels).
  pub fn end_offset(&self, channel: &str) -> u64 {
    let channels = self
      .broker
      .channels
      .read()
      .unwrap_or_else(PoisonError::into_inner);
    channels.get(channel).map_or(0, |r| r.len() as u64)
  }

  /// Names of all channels, sorted.
  pub fn channel_names(&self) -> Vec<String> {
    let channels = self
      .broker
      .channels
      .read()
      .unwrap_or_else(PoisonError::into_inner);
    let mut names: Vec<String> = channels.keys().cloned().collect();
    names.sort();
    names
  }

  /// Commits the next offset `group` should read from `channel`.
  pub fn commit(&self, group: &str, channel: &str, next_offset: u64) {
    let mut committed = self
      .broker
      .committed
      .write()
      .unwrap_or_else(PoisonError::into_inner);
    committed.insert((group.to_string(), channel.to_string()), next_offset);
  }

  /// Returns the committed position of `group` on `channel`, if any.
  pub fn committed(&self, group: &str, channel: &str) -> Option<u64> {
    let committed = self
      .broker
      .committed
      .read()
      .unwrap_or_else(PoisonError::into_inner);
    committed
      .get(&(group.to_string(), channel.to_string()))
      .copied()
  }

  /// Returns a future that completes on the next `produce` to any channel.
  ///
  /// Create it before checking for data so a record produced in between is
  /// not missed.
  pub fn notified(&self) -> Notified<'_> {
    self.broker.notify.notified()
  }

  /// Returns a typed producer for `channel`.
  pub fn producer<K, V>(
    &self,
    channel: &str,
    key_serde: impl Serde<K> + 'static,
    value_serde: impl Serde<V> + 'static,
  ) -> ChannelProducer<K, V> {
    self.create(channel);
    ChannelProducer {
      channels: self.clone(),
      channel: channel.to_string(),
      key_serde: Box::new(key_serde),
      value_serde: Box::new(value_serde),
      _marker: PhantomData,
    }
  }
}

/// Serializes typed keys and values and appends them to one channel.
pub struct ChannelProducer<K, V> {
  channels: Channels,
  channel: String,
  key_serde: Box<dyn Serde<K>>,
  value_serde: Box<dyn Serde<V>>,
  _marker: PhantomData<fn(&K, &V)>,
}

impl<K, V> ChannelProducer<K, V> {
  /// Sends a record stamped with the current wall-clock time.
  pub fn send(&self, key: &K, value: &V) -> Result<u64, SerializationError> {
    self.send_at(key, value, now_ms())
  }

  /// Sends a record with an explicit timestamp.
  pub fn send_at(&self, key: &K, value: &V, timestamp_ms: i64) -> Result<u64, SerializationError> {
    let key = self.key_serde.serialize(key)?;
    let value = self.value_serde.serialize(value)?;
    Ok(self.channels.produce(&self.channel, key, value, timestamp_ms))
  }

  /// Name of the target channel.
  pub fn channel(&self) -> &str {
    &self.channel
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::codec::StringSerde;
  use std::time::Duration;

  #[test]
  fn produce_assigns_sequential_offsets() {
    let channels = Channels::new();
    assert_eq!(channels.produce("a", "k", "v1", 1), 0);
    assert_eq!(channels.produce("a", "k", "v2", 2), 1);
    assert_eq!(channels.produce("b", "k", "v", 3), 0);
    assert_eq!(channels.end_offset("a"), 2);
    assert_eq!(channels.end_offset("missing"), 0);
    assert_eq!(channels.channel_names(), vec!["a".to_string(), "b".to_string()]);
  }

  #[test]
  fn fetch_respects_bounds() {
    let channels = Channels::new();
    for i in 0..5 {
      channels.produce("a", "k", format!("v{i}"), i);
    }
    let batch = channels.fetch("a", 3, 10);
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].offset, 3);
    assert!(channels.fetch("a", 9, 10).is_empty());
    assert_eq!(channels.fetch("a", 0, 2).len(), 2);
  }

  #[test]
  fn committed_positions_are_per_group() {
    let channels = Channels::new();
    channels.commit("app-1", "events", 4);
    assert_eq!(channels.committed("app-1", "events"), Some(4));
    assert_eq!(channels.committed("app-2", "events"), None);
  }

  #[test]
  fn typed_producer_serializes() {
    let channels = Channels::new();
    let producer = channels.producer::<String, String>("names", StringSerde, StringSerde);
    producer
      .send_at(&"k".to_string(), &"v".to_string(), 9)
      .unwrap();
    let records = channels.records("names");
    assert_eq!(records[0].key, Bytes::from_static(b"k"));
    assert_eq!(records[0].timestamp_ms, 9);
  }

  #[tokio::test]
  async fn notified_wakes_on_produce() {
    let channels = Channels::new();
    let producer = channels.clone();
    let notified = channels.notified();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(10)).await;
      producer.produce("a", "k", "v", 0);
    });
    tokio::time::timeout(Duration::from_secs(5), notified)
      .await
      .expect("produce should wake the waiter");
  }
}
