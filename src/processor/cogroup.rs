//! Co-grouping of two streams into one per-key aggregate.
//!
//! [`CoGroupProcessor`] receives records of two value types `A` and `B` that
//! share a key type `K`. For each record it reads the key's [`CoGrouped`]
//! aggregate from its store (empty if absent), appends the value to the side
//! matching its type, writes the aggregate back and forwards it. Because the
//! stream task runs processors on a single thread, the read-modify-write of a
//! key never interleaves with another write to the same key.
//!
//! `A` and `B` must be distinct types: the side is chosen by the value type.
//!
//! Keys are never evicted from the store. With [`EmitMode::Interval`] the
//! aggregates are forwarded on a schedule instead and their lists are emptied
//! after each emission.

use crate::error::ProcessorError;
use crate::processor::{Processor, ProcessorContext};
use crate::record::Record;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::type_name;
use std::marker::PhantomData;
use std::time::Duration;
use tracing::debug;

/// Aggregate of the two sides seen for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoGrouped<A, B> {
  /// Values of the first stream, in arrival order.
  pub left: Vec<A>,
  /// Values of the second stream, in arrival order.
  pub right: Vec<B>,
}

impl<A, B> Default for CoGrouped<A, B> {
  fn default() -> Self {
    Self {
      left: Vec::new(),
      right: Vec::new(),
    }
  }
}

impl<A, B> CoGrouped<A, B> {
  /// Returns true if neither side holds a value.
  pub fn is_empty(&self) -> bool {
    self.left.is_empty() && self.right.is_empty()
  }
}

/// When a [`CoGroupProcessor`] forwards aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmitMode {
  /// Forward the updated aggregate after every record.
  #[default]
  OnUpdate,
  /// Forward every non-empty aggregate on a wall-clock interval, then empty it.
  Interval(Duration),
}

enum Side<A, B> {
  Left(A),
  Right(B),
}

/// Appends values of two streams to a per-key [`CoGrouped`] aggregate.
///
/// The store must be declared with key type `K` and value type
/// `CoGrouped<A, B>` and connected to the processor.
pub struct CoGroupProcessor<K, A, B> {
  store: String,
  emit: EmitMode,
  _marker: PhantomData<fn(K, A, B)>,
}

impl<K, A, B> CoGroupProcessor<K, A, B> {
  /// Creates a processor aggregating into `store`, forwarding on every update.
  pub fn new(store: impl Into<String>) -> Self {
    Self {
      store: store.into(),
      emit: EmitMode::OnUpdate,
      _marker: PhantomData,
    }
  }

  /// Sets the emission mode.
  #[must_use]
  pub fn with_emit_mode(mut self, emit: EmitMode) -> Self {
    self.emit = emit;
    self
  }
}

impl<K, A, B> Processor for CoGroupProcessor<K, A, B>
where
  K: Clone + Send + Sync + 'static,
  A: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
  B: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
  fn init(&mut self, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessorError> {
    if let EmitMode::Interval(interval) = self.emit {
      ctx.schedule(interval);
    }
    Ok(())
  }

  fn process(&mut self, record: Record, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessorError> {
    let Some(key) = record.key::<K>() else {
      return Err(ProcessorError::UnexpectedType {
        processor: ctx.name().to_string(),
        expected: type_name::<K>(),
      });
    };

    let side = if let Some(a) = record.value::<A>() {
      Side::Left(a.clone())
    } else if let Some(b) = record.value::<B>() {
      Side::Right(b.clone())
    } else {
      return Err(ProcessorError::UnexpectedType {
        processor: ctx.name().to_string(),
        expected: type_name::<(A, B)>(),
      });
    };

    let aggregate = {
      let mut store = ctx.store::<K, CoGrouped<A, B>>(&self.store)?;
      let mut aggregate = store.get(key)?.unwrap_or_default();
      match side {
        Side::Left(a) => aggregate.left.push(a),
        Side::Right(b) => aggregate.right.push(b),
      }
      store.put(key, &aggregate)?;
      aggregate
    };

    match self.emit {
      EmitMode::OnUpdate => ctx.forward(record.with_value(aggregate)),
      EmitMode::Interval(_) => Ok(()),
    }
  }

  fn punctuate(&mut self, timestamp_ms: i64, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessorError> {
    let pending: Vec<(K, CoGrouped<A, B>)> = {
      let mut store = ctx.store::<K, CoGrouped<A, B>>(&self.store)?;
      let pending: Vec<_> = store
        .all()?
        .into_iter()
        .filter(|(_, aggregate)| !aggregate.is_empty())
        .collect();
      for (key, _) in &pending {
        store.put(key, &CoGrouped::default())?;
      }
      pending
    };
    debug!(processor = %ctx.name(), emitted = pending.len(), "co-grouped aggregates emitted");
    let origin = ctx.name().to_string();
    for (key, aggregate) in pending {
      ctx.forward(Record::new(key, aggregate, timestamp_ms, origin.as_str()))?;
    }
    Ok(())
  }
}
