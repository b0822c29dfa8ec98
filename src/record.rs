//! Keyed, timestamped records flowing through a topology.
//!
//! Keys and values travel as [`Payload`]s (`Arc<dyn Any + Send + Sync>`), so
//! forwarding a record to several children only bumps reference counts.
//! Processors downcast to the types they expect with [`Record::key`] and
//! [`Record::value`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Type-erased key or value carried by a [`Record`].
pub type Payload = Arc<dyn Any + Send + Sync>;

/// An immutable record: key, value, timestamp and the channel it came from.
///
/// Records are never mutated once produced; `with_*` methods build a new
/// record that keeps the remaining fields.
#[derive(Clone)]
pub struct Record {
  key: Payload,
  value: Payload,
  timestamp_ms: i64,
  channel: Arc<str>,
}

impl Record {
  /// Creates a record from typed key and value.
  pub fn new<K, V>(key: K, value: V, timestamp_ms: i64, channel: impl Into<Arc<str>>) -> Self
  where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
  {
    Self {
      key: Arc::new(key),
      value: Arc::new(value),
      timestamp_ms,
      channel: channel.into(),
    }
  }

  /// Creates a record from already type-erased payloads.
  pub fn from_payloads(
    key: Payload,
    value: Payload,
    timestamp_ms: i64,
    channel: impl Into<Arc<str>>,
  ) -> Self {
    Self {
      key,
      value,
      timestamp_ms,
      channel: channel.into(),
    }
  }

  /// Returns the key if it is a `K`.
  pub fn key<K: 'static>(&self) -> Option<&K> {
    self.key.downcast_ref::<K>()
  }

  /// Returns the value if it is a `V`.
  pub fn value<V: 'static>(&self) -> Option<&V> {
    self.value.downcast_ref::<V>()
  }

  /// Returns the type-erased key.
  pub fn key_payload(&self) -> &Payload {
    &self.key
  }

  /// Returns the type-erased value.
  pub fn value_payload(&self) -> &Payload {
    &self.value
  }

  /// Record timestamp in milliseconds since the Unix epoch.
  pub fn timestamp_ms(&self) -> i64 {
    self.timestamp_ms
  }

  /// Name of the channel the record originally came from.
  pub fn channel(&self) -> &str {
    &self.channel
  }

  /// Returns a record with the same key, timestamp and origin, carrying `value`.
  pub fn with_value<V: Send + Sync + 'static>(&self, value: V) -> Self {
    Self {
      key: Arc::clone(&self.key),
      value: Arc::new(value),
      timestamp_ms: self.timestamp_ms,
      channel: Arc::clone(&self.channel),
    }
  }

  /// Returns a record with the same value, timestamp and origin, carrying `key`.
  pub fn with_key<K: Send + Sync + 'static>(&self, key: K) -> Self {
    Self {
      key: Arc::new(key),
      value: Arc::clone(&self.value),
      timestamp_ms: self.timestamp_ms,
      channel: Arc::clone(&self.channel),
    }
  }

  /// Returns a copy stamped with a different timestamp.
  pub fn with_timestamp(&self, timestamp_ms: i64) -> Self {
    Self {
      timestamp_ms,
      ..self.clone()
    }
  }
}

impl fmt::Debug for Record {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Record")
      .field("timestamp_ms", &self.timestamp_ms)
      .field("channel", &self.channel)
      .finish_non_exhaustive()
  }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
  chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn typed_access_downcasts() {
    let record = Record::new("K".to_string(), 7u32, 10, "events");
    assert_eq!(record.key::<String>().map(String::as_str), Some("K"));
    assert_eq!(record.value::<u32>(), Some(&7));
    assert!(record.value::<i64>().is_none());
    assert_eq!(record.channel(), "events");
  }

  #[test]
  fn with_value_keeps_key_and_origin() {
    let record = Record::new("K".to_string(), 1u8, 42, "txns");
    let next = record.with_value("v".to_string());
    assert_eq!(next.key::<String>().map(String::as_str), Some("K"));
    assert_eq!(next.value::<String>().map(String::as_str), Some("v"));
    assert_eq!(next.timestamp_ms(), 42);
    assert_eq!(next.channel(), "txns");
    // the original is untouched
    assert_eq!(record.value::<u8>(), Some(&1));
  }
}
