//! Stateless helper processors.

use crate::error::ProcessorError;
use crate::processor::{Processor, ProcessorContext};
use crate::record::Record;
use std::any::type_name;
use std::fmt::Debug;
use std::marker::PhantomData;
use tracing::info;

type MapFn = Box<dyn FnMut(&Record) -> Result<Option<Record>, ProcessorError> + Send>;

/// Transforms each record into zero or one record.
///
/// Used to re-key streams before grouping:
///
/// ```rust
/// use stateweave::processor::MapProcessor;
///
/// // key page views by user id, keep the page as value
/// let rekey = MapProcessor::typed(|_key: &String, view: &(String, u32)| {
///   Some((view.0.clone(), view.1))
/// });
/// # let _ = rekey;
/// ```
pub struct MapProcessor {
  f: MapFn,
}

impl MapProcessor {
  /// Maps whole records. Returning `None` drops the record.
  pub fn new<F>(mut f: F) -> Self
  where
    F: FnMut(&Record) -> Option<Record> + Send + 'static,
  {
    Self {
      f: Box::new(move |record: &Record| Ok(f(record))),
    }
  }

  /// Maps typed key/value pairs, keeping the record's timestamp and channel.
  /// Records whose key or value is not `K`/`V` fail with
  /// [`ProcessorError::UnexpectedType`].
  pub fn typed<K, V, K2, V2, F>(mut f: F) -> Self
  where
    K: 'static,
    V: 'static,
    K2: Send + Sync + 'static,
    V2: Send + Sync + 'static,
    F: FnMut(&K, &V) -> Option<(K2, V2)> + Send + 'static,
  {
    Self {
      f: Box::new(move |record: &Record| {
        let (Some(key), Some(value)) = (record.key::<K>(), record.value::<V>()) else {
          return Err(ProcessorError::UnexpectedType {
            processor: String::new(),
            expected: type_name::<(K, V)>(),
          });
        };
        Ok(
          f(key, value).map(|(k, v)| {
            Record::new(k, v, record.timestamp_ms(), record.channel().to_string())
          }),
        )
      }),
    }
  }
}

impl Processor for MapProcessor {
  fn process(&mut self, record: Record, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessorError> {
    match (self.f)(&record) {
      Ok(Some(mapped)) => ctx.forward(mapped),
      Ok(None) => Ok(()),
      Err(ProcessorError::UnexpectedType { expected, .. }) => Err(ProcessorError::UnexpectedType {
        processor: ctx.name().to_string(),
        expected,
      }),
      Err(e) => Err(e),
    }
  }
}

/// Logs every record with a label and forwards it unchanged.
pub struct PrintProcessor<K, V> {
  label: String,
  _marker: PhantomData<fn(&K, &V)>,
}

impl<K, V> PrintProcessor<K, V> {
  /// Creates a printer labelled `label`.
  pub fn new(label: impl Into<String>) -> Self {
    Self {
      label: label.into(),
      _marker: PhantomData,
    }
  }
}

impl<K, V> Processor for PrintProcessor<K, V>
where
  K: Debug + 'static,
  V: Debug + 'static,
{
  fn process(&mut self, record: Record, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessorError> {
    match (record.key::<K>(), record.value::<V>()) {
      (Some(key), Some(value)) => {
        info!(label = %self.label, ?key, ?value, ts = record.timestamp_ms(), "record");
      }
      _ => {
        info!(label = %self.label, channel = %record.channel(), ts = record.timestamp_ms(), "record of unexpected type");
      }
    }
    ctx.forward(record)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn typed_map_rekeys_and_keeps_timestamp() {
    let mut map = MapProcessor::typed(|_: &String, v: &(String, u32)| Some((v.0.clone(), v.1)));
    let record = Record::new("page-1".to_string(), ("user-9".to_string(), 3u32), 77, "views");
    let mapped = (map.f)(&record).unwrap().unwrap();
    assert_eq!(mapped.key::<String>().unwrap(), "user-9");
    assert_eq!(mapped.value::<u32>(), Some(&3));
    assert_eq!(mapped.timestamp_ms(), 77);
    assert_eq!(mapped.channel(), "views");
  }

  #[test]
  fn typed_map_reports_wrong_payload() {
    let mut map = MapProcessor::typed(|k: &String, v: &u32| Some((k.clone(), *v)));
    let record = Record::new(1u8, 2u8, 0, "x");
    assert!(matches!(
      (map.f)(&record),
      Err(ProcessorError::UnexpectedType { .. })
    ));
  }

  #[test]
  fn record_map_can_drop() {
    let mut map = MapProcessor::new(|r: &Record| r.value::<u32>().filter(|v| **v > 1).map(|_| r.clone()));
    assert!((map.f)(&Record::new(0u8, 1u32, 0, "x")).unwrap().is_none());
    assert!((map.f)(&Record::new(0u8, 2u32, 0, "x")).unwrap().is_some());
  }
}
