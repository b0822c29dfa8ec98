//! Serialize/deserialize pairs for channel payloads and store contents.
//!
//! [`Serde<T>`] is the typed contract. Sources and sinks work on type-erased
//! [`Payload`]s, so a typed serde is wrapped into a [`PayloadSerde`] with
//! [`erase`] when it is attached to a topology node.

use crate::error::SerializationError;
use crate::record::Payload;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::type_name;
use std::marker::PhantomData;
use std::sync::Arc;

/// Converts values of type `T` to and from bytes.
pub trait Serde<T>: Send + Sync {
  /// Encodes `value`.
  fn serialize(&self, value: &T) -> Result<Vec<u8>, SerializationError>;

  /// Decodes a value from `bytes`.
  fn deserialize(&self, bytes: &[u8]) -> Result<T, SerializationError>;
}

/// UTF-8 string serde.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerde;

impl Serde<String> for StringSerde {
  fn serialize(&self, value: &String) -> Result<Vec<u8>, SerializationError> {
    Ok(value.as_bytes().to_vec())
  }

  fn deserialize(&self, bytes: &[u8]) -> Result<String, SerializationError> {
    String::from_utf8(bytes.to_vec()).map_err(|e| SerializationError::Deserialize {
      type_name: "String",
      reason: e.to_string(),
    })
  }
}

/// JSON serde for any `serde` type.
pub struct JsonSerde<T> {
  _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSerde<T> {
  /// Creates a JSON serde.
  pub fn new() -> Self {
    Self {
      _marker: PhantomData,
    }
  }
}

impl<T> Default for JsonSerde<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> Clone for JsonSerde<T> {
  fn clone(&self) -> Self {
    Self::new()
  }
}

impl<T> Serde<T> for JsonSerde<T>
where
  T: Serialize + DeserializeOwned,
{
  fn serialize(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
    serde_json::to_vec(value).map_err(|e| SerializationError::Serialize {
      type_name: type_name::<T>(),
      reason: e.to_string(),
    })
  }

  fn deserialize(&self, bytes: &[u8]) -> Result<T, SerializationError> {
    serde_json::from_slice(bytes).map_err(|e| SerializationError::Deserialize {
      type_name: type_name::<T>(),
      reason: e.to_string(),
    })
  }
}

/// Type-erased serde used by source and sink nodes.
pub trait PayloadSerde: Send + Sync {
  /// Encodes a payload; fails if it does not hold the configured type.
  fn serialize_payload(&self, payload: &Payload) -> Result<Vec<u8>, SerializationError>;

  /// Decodes bytes into a payload.
  fn deserialize_payload(&self, bytes: &[u8]) -> Result<Payload, SerializationError>;

  /// Name of the type this serde handles, for topology descriptions.
  fn type_name(&self) -> &'static str;
}

struct Erased<T, S> {
  inner: S,
  _marker: PhantomData<fn() -> T>,
}

impl<T, S> PayloadSerde for Erased<T, S>
where
  T: Send + Sync + 'static,
  S: Serde<T>,
{
  fn serialize_payload(&self, payload: &Payload) -> Result<Vec<u8>, SerializationError> {
    let value = payload
      .downcast_ref::<T>()
      .ok_or(SerializationError::UnexpectedPayload {
        expected: type_name::<T>(),
      })?;
    self.inner.serialize(value)
  }

  fn deserialize_payload(&self, bytes: &[u8]) -> Result<Payload, SerializationError> {
    Ok(Arc::new(self.inner.deserialize(bytes)?))
  }

  fn type_name(&self) -> &'static str {
    type_name::<T>()
  }
}

/// Wraps a typed serde into a [`PayloadSerde`].
pub fn erase<T, S>(serde: S) -> Arc<dyn PayloadSerde>
where
  T: Send + Sync + 'static,
  S: Serde<T> + 'static,
{
  Arc::new(Erased {
    inner: serde,
    _marker: PhantomData,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::Deserialize;

  #[derive(Debug, PartialEq, Serialize, Deserialize)]
  struct Click {
    user: String,
    page: u32,
  }

  #[test]
  fn string_serde_rejects_invalid_utf8() {
    let err = StringSerde.deserialize(&[0xff, 0xfe]).unwrap_err();
    assert!(matches!(err, SerializationError::Deserialize { .. }));
  }

  #[test]
  fn json_serde_decodes_struct() {
    let serde = JsonSerde::<Click>::new();
    let click = serde.deserialize(br#"{"user":"u1","page":3}"#).unwrap();
    assert_eq!(
      click,
      Click {
        user: "u1".to_string(),
        page: 3
      }
    );
    assert!(serde.deserialize(b"{not json").is_err());
  }

  #[test]
  fn erased_serde_checks_payload_type() {
    let serde = erase::<String, _>(StringSerde);
    let good: Payload = Arc::new("abc".to_string());
    assert_eq!(serde.serialize_payload(&good).unwrap(), b"abc".to_vec());

    let bad: Payload = Arc::new(5u64);
    assert!(matches!(
      serde.serialize_payload(&bad),
      Err(SerializationError::UnexpectedPayload { .. })
    ));

    let decoded = serde.deserialize_payload(b"xyz").unwrap();
    assert_eq!(decoded.downcast_ref::<String>().map(String::as_str), Some("xyz"));
  }
}
