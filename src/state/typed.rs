//! Typed view over a [`StateStore`].

use crate::codec::Serde;
use crate::error::{SerializationError, StoreError};
use crate::record::now_ms;
use crate::state::StateStore;
use bytes::Bytes;
use std::any::type_name;
use std::sync::Arc;

/// Key/value access to a store through its declared serdes.
///
/// Obtained from [`ProcessorContext::store`](crate::processor::ProcessorContext::store)
/// or [`KeyValueStore::new`]. Mutations are stamped with the timestamp of the
/// record being processed.
pub struct KeyValueStore<'a, K, V> {
  store: &'a mut StateStore,
  key_serde: Arc<dyn Serde<K>>,
  value_serde: Arc<dyn Serde<V>>,
  timestamp_ms: i64,
}

impl<'a, K: 'static, V: 'static> KeyValueStore<'a, K, V> {
  /// Wraps `store`, checking that it was declared with types `K` and `V`.
  pub fn new(store: &'a mut StateStore) -> Result<Self, StoreError> {
    let spec = Arc::clone(store.spec());
    let (Some(key_serde), Some(value_serde)) = (spec.key_serde::<K>(), spec.value_serde::<V>())
    else {
      return Err(StoreError::TypeMismatch {
        store: spec.name().to_string(),
        expected_key: spec.key_type(),
        expected_value: spec.value_type(),
        requested_key: type_name::<K>(),
        requested_value: type_name::<V>(),
      });
    };
    Ok(Self {
      store,
      key_serde,
      value_serde,
      timestamp_ms: now_ms(),
    })
  }

  /// Stamps subsequent mutations with `timestamp_ms`.
  pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
    self.timestamp_ms = timestamp_ms;
    self
  }

  /// Store name.
  pub fn name(&self) -> &str {
    self.store.name()
  }

  fn ser_err(&self, source: SerializationError) -> StoreError {
    StoreError::Serialization {
      store: self.store.name().to_string(),
      source,
    }
  }

  fn encode_key(&self, key: &K) -> Result<Vec<u8>, StoreError> {
    self.key_serde.serialize(key).map_err(|e| self.ser_err(e))
  }

  fn decode_value(&self, bytes: &[u8]) -> Result<V, StoreError> {
    self.value_serde.deserialize(bytes).map_err(|e| self.ser_err(e))
  }

  /// Returns the value stored under `key`.
  pub fn get(&self, key: &K) -> Result<Option<V>, StoreError> {
    let key = self.encode_key(key)?;
    self
      .store
      .get(&key)
      .map(|bytes| self.decode_value(bytes))
      .transpose()
  }

  /// Stores `value` under `key`.
  pub fn put(&mut self, key: &K, value: &V) -> Result<(), StoreError> {
    let key = self.encode_key(key)?;
    let value = self.value_serde.serialize(value).map_err(|e| self.ser_err(e))?;
    self
      .store
      .put(Bytes::from(key), Bytes::from(value), self.timestamp_ms)
  }

  /// Stores `value` unless `key` is present. Returns the existing value, if any.
  pub fn put_if_absent(&mut self, key: &K, value: &V) -> Result<Option<V>, StoreError> {
    match self.get(key)? {
      Some(existing) => Ok(Some(existing)),
      None => {
        self.put(key, value)?;
        Ok(None)
      }
    }
  }

  /// Removes `key` and returns its previous value.
  pub fn delete(&mut self, key: &K) -> Result<Option<V>, StoreError> {
    let key = self.encode_key(key)?;
    let previous = self.store.delete(&key, self.timestamp_ms)?;
    previous.map(|bytes| self.decode_value(&bytes)).transpose()
  }

  /// Returns every entry, in encoded-key order.
  pub fn all(&self) -> Result<Vec<(K, V)>, StoreError> {
    self
      .store
      .iter()
      .map(|(k, v)| {
        let key = self.key_serde.deserialize(k).map_err(|e| self.ser_err(e))?;
        Ok((key, self.decode_value(v)?))
      })
      .collect()
  }

  /// Number of entries.
  pub fn approximate_num_entries(&self) -> usize {
    self.store.len()
  }
}
