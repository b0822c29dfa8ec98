//! Source nodes: decode channel records and forward them.

use crate::channel::ChannelRecord;
use crate::codec::PayloadSerde;
use crate::config::TimestampExtractor;
use crate::error::{ProcessorError, SerializationError};
use crate::processor::{Processor, ProcessorContext};
use crate::record::{Record, now_ms};
use std::sync::Arc;

/// Processor of a source node. Records reach it already decoded; it forwards
/// them to its children.
#[derive(Debug, Default, Clone, Copy)]
pub struct SourceNode;

impl Processor for SourceNode {
  fn process(&mut self, record: Record, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessorError> {
    ctx.forward(record)
  }
}

/// Binding of a source node to its input channel inside a stream task.
pub(crate) struct SourceBinding {
  pub(crate) node: usize,
  pub(crate) name: String,
  pub(crate) channel: Arc<str>,
  pub(crate) key_serde: Arc<dyn PayloadSerde>,
  pub(crate) value_serde: Arc<dyn PayloadSerde>,
  /// Next channel offset to read.
  pub(crate) position: u64,
}

impl SourceBinding {
  /// Decodes a channel record, stamping it according to `extractor`.
  pub(crate) fn decode(
    &self,
    raw: &ChannelRecord,
    extractor: TimestampExtractor,
  ) -> Result<Record, SerializationError> {
    let key = self.key_serde.deserialize_payload(&raw.key)?;
    let value = self.value_serde.deserialize_payload(&raw.value)?;
    let timestamp_ms = match extractor {
      TimestampExtractor::RecordTime => raw.timestamp_ms,
      TimestampExtractor::WallClock => now_ms(),
    };
    Ok(Record::from_payloads(
      key,
      value,
      timestamp_ms,
      Arc::clone(&self.channel),
    ))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::codec::{JsonSerde, StringSerde, erase};
  use bytes::Bytes;

  fn binding() -> SourceBinding {
    SourceBinding {
      node: 0,
      name: "clicks-source".to_string(),
      channel: Arc::from("clicks"),
      key_serde: erase::<String, _>(StringSerde),
      value_serde: erase::<u32, _>(JsonSerde::<u32>::new()),
      position: 0,
    }
  }

  #[test]
  fn decodes_with_record_time() {
    let raw = ChannelRecord {
      offset: 3,
      key: Bytes::from_static(b"user-1"),
      value: Bytes::from_static(b"42"),
      timestamp_ms: 1_000,
    };
    let record = binding().decode(&raw, TimestampExtractor::RecordTime).unwrap();
    assert_eq!(record.key::<String>().unwrap(), "user-1");
    assert_eq!(record.value::<u32>(), Some(&42));
    assert_eq!(record.timestamp_ms(), 1_000);
    assert_eq!(record.channel(), "clicks");
  }

  #[test]
  fn wall_clock_replaces_timestamp() {
    let raw = ChannelRecord {
      offset: 0,
      key: Bytes::from_static(b"k"),
      value: Bytes::from_static(b"1"),
      timestamp_ms: 5,
    };
    let record = binding().decode(&raw, TimestampExtractor::WallClock).unwrap();
    assert!(record.timestamp_ms() > 5);
  }

  #[test]
  fn malformed_value_is_a_serialization_error() {
    let raw = ChannelRecord {
      offset: 0,
      key: Bytes::from_static(b"k"),
      value: Bytes::from_static(b"not a number"),
      timestamp_ms: 0,
    };
    assert!(matches!(
      binding().decode(&raw, TimestampExtractor::RecordTime),
      Err(SerializationError::Deserialize { .. })
    ));
  }
}
