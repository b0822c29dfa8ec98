//! Sink nodes: encode records and append them to an output channel.

use crate::codec::PayloadSerde;
use crate::error::ProcessorError;
use crate::processor::{Processor, ProcessorContext};
use crate::record::Record;
use std::sync::Arc;
use tracing::trace;

/// Processor of a sink node.
pub struct SinkNode {
  channel: String,
  key_serde: Arc<dyn PayloadSerde>,
  value_serde: Arc<dyn PayloadSerde>,
}

impl SinkNode {
  /// Creates a sink writing to `channel` with the given serdes.
  pub fn new(
    channel: impl Into<String>,
    key_serde: Arc<dyn PayloadSerde>,
    value_serde: Arc<dyn PayloadSerde>,
  ) -> Self {
    Self {
      channel: channel.into(),
      key_serde,
      value_serde,
    }
  }

  /// Output channel.
  pub fn channel(&self) -> &str {
    &self.channel
  }
}

impl Processor for SinkNode {
  fn process(&mut self, record: Record, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessorError> {
    let key = self.key_serde.serialize_payload(record.key_payload())?;
    let value = self.value_serde.serialize_payload(record.value_payload())?;
    let offset = ctx
      .channels()
      .produce(&self.channel, key, value, record.timestamp_ms());
    trace!(sink = %ctx.name(), channel = %self.channel, offset, "record written");
    Ok(())
  }
}
