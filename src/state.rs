//! Change-logged key/value state stores.
//!
//! A store is declared with a [`StoreSpec`], built through [`Stores`]:
//!
//! ```rust
//! use stateweave::codec::{JsonSerde, StringSerde};
//! use stateweave::state::{CleanupPolicy, LogConfig, Stores};
//! use std::time::Duration;
//!
//! let spec = Stores::key_value::<String, Vec<u32>>("totals", StringSerde, JsonSerde::new())
//!   .persistent()
//!   .with_logging_enabled(LogConfig {
//!     retention: Duration::from_secs(120),
//!     cleanup_policy: CleanupPolicy::Compact,
//!     ..LogConfig::default()
//!   })
//!   .build();
//! assert!(spec.persistent());
//! ```
//!
//! The key and value types are fixed when the `StoreSpec` is built; opening the store
//! later with other types fails with
//! [`StoreError::TypeMismatch`](crate::error::StoreError::TypeMismatch).
//!
//! Every mutation appends to the store's [`ChangeLog`](changelog::ChangeLog)
//! before it touches the map, so the map can always be rebuilt by replaying
//! the log from its first retained entry.

pub mod changelog;
pub mod directory;
pub mod store;
pub mod typed;


pub use changelog::{ChangeLog, ChangeRecord, CompactionStats};
pub use directory::StateDirectory;
pub use store::{StateStore, StoreRegistry};
pub use typed::KeyValueStore;

use crate::codec::Serde;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Clean-up policy of a change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
  /// The log is never compacted; every entry is retained.
  #[default]
  None,
  /// The log is periodically compacted to the latest entry per key.
  Compact,
}

/// Change log settings of a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
  /// How long tombstones are retained before compaction may remove them.
  #[serde(with = "crate::config::duration_ms")]
  pub retention: Duration,
  /// Whether the log is compacted.
  pub cleanup_policy: CleanupPolicy,
  /// New entries needed since the last compaction before the next one runs.
  pub compaction_threshold: usize,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      retention: Duration::from_secs(24 * 60 * 60),
      cleanup_policy: CleanupPolicy::None,
      compaction_threshold: 1000,
    }
  }
}

impl LogConfig {
  /// Builds a config from string settings.
  ///
  /// Recognized keys are `retention.ms`, `cleanup.policy` (`compact` or
  /// `none`) and `compaction.threshold`; unknown keys are ignored.
  pub fn from_map(settings: &HashMap<String, String>) -> Result<Self, ConfigError> {
    let mut config = Self::default();
    if let Some(raw) = settings.get("retention.ms") {
      let ms = raw.trim().parse::<u64>().map_err(|e| ConfigError::Invalid {
        key: "retention.ms",
        reason: e.to_string(),
      })?;
      config.retention = Duration::from_millis(ms);
    }
    if let Some(raw) = settings.get("cleanup.policy") {
      config.cleanup_policy = match raw.trim() {
        "compact" => CleanupPolicy::Compact,
        "none" => CleanupPolicy::None,
        other => {
          return Err(ConfigError::Invalid {
            key: "cleanup.policy",
            reason: format!("unsupported policy '{other}'"),
          });
        }
      };
    }
    if let Some(raw) = settings.get("compaction.threshold") {
      config.compaction_threshold = raw.trim().parse::<usize>().map_err(|e| ConfigError::Invalid {
        key: "compaction.threshold",
        reason: e.to_string(),
      })?;
    }
    Ok(config)
  }
}

/// Declaration of a key/value store.
///
/// Holds the store's name, its durability and logging settings and the serdes
/// for its key and value types.
#[derive(Clone)]
pub struct StoreSpec {
  name: String,
  persistent: bool,
  logging: Option<LogConfig>,
  key_type: &'static str,
  value_type: &'static str,
  // Arc<dyn Serde<K>> and Arc<dyn Serde<V>> behind Any
  key_serde: Arc<dyn Any + Send + Sync>,
  value_serde: Arc<dyn Any + Send + Sync>,
}

impl StoreSpec {
  /// Store name.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Whether the store keeps its contents on disk across restarts.
  pub fn persistent(&self) -> bool {
    self.persistent
  }

  /// Whether every mutation is recorded in a change log.
  pub fn logging_enabled(&self) -> bool {
    self.logging.is_some()
  }

  /// Change log settings, when logging is enabled.
  pub fn log_config(&self) -> Option<&LogConfig> {
    self.logging.as_ref()
  }

  /// Name of the key type.
  pub fn key_type(&self) -> &'static str {
    self.key_type
  }

  /// Name of the value type.
  pub fn value_type(&self) -> &'static str {
    self.value_type
  }

  pub(crate) fn key_serde<K: 'static>(&self) -> Option<Arc<dyn Serde<K>>> {
    self.key_serde.downcast_ref::<Arc<dyn Serde<K>>>().cloned()
  }

  pub(crate) fn value_serde<V: 'static>(&self) -> Option<Arc<dyn Serde<V>>> {
    self.value_serde.downcast_ref::<Arc<dyn Serde<V>>>().cloned()
  }
}

impl fmt::Debug for StoreSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StoreSpec")
      .field("name", &self.name)
      .field("persistent", &self.persistent)
      .field("logging", &self.logging)
      .field("key_type", &self.key_type)
      .field("value_type", &self.value_type)
      .finish()
  }
}

/// Entry point for declaring stores.
pub struct Stores;

impl Stores {
  /// Starts a key/value store declaration. Defaults: in-memory, logging
  /// enabled with [`LogConfig::default`].
  pub fn key_value<K, V>(
    name: impl Into<String>,
    key_serde: impl Serde<K> + 'static,
    value_serde: impl Serde<V> + 'static,
  ) -> StoreBuilder
  where
    K: 'static,
    V: 'static,
  {
    let key_serde: Arc<dyn Serde<K>> = Arc::new(key_serde);
    let value_serde: Arc<dyn Serde<V>> = Arc::new(value_serde);
    StoreBuilder {
      spec: StoreSpec {
        name: name.into(),
        persistent: false,
        logging: Some(LogConfig::default()),
        key_type: type_name::<K>(),
        value_type: type_name::<V>(),
        key_serde: Arc::new(key_serde),
        value_serde: Arc::new(value_serde),
      },
    }
  }
}

/// Builder returned by [`Stores::key_value`].
pub struct StoreBuilder {
  spec: StoreSpec,
}

impl StoreBuilder {
  /// Keeps the store contents on disk.
  pub fn persistent(mut self) -> Self {
    self.spec.persistent = true;
    self
  }

  /// Keeps the store contents in memory only.
  pub fn in_memory(mut self) -> Self {
    self.spec.persistent = false;
    self
  }

  /// Records every mutation in a change log with the given settings.
  pub fn with_logging_enabled(mut self, config: LogConfig) -> Self {
    self.spec.logging = Some(config);
    self
  }

  /// Disables the change log; the store cannot be restored from a log.
  pub fn with_logging_disabled(mut self) -> Self {
    self.spec.logging = None;
    self
  }

  /// Finishes the declaration.
  pub fn build(self) -> StoreSpec {
    self.spec
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::codec::{JsonSerde, StringSerde};

  #[test]
  fn log_config_from_string_settings() {
    let mut settings = HashMap::new();
    settings.insert("retention.ms".to_string(), "120000".to_string());
    settings.insert("cleanup.policy".to_string(), "compact".to_string());
    let config = LogConfig::from_map(&settings).unwrap();
    assert_eq!(config.retention, Duration::from_millis(120_000));
    assert_eq!(config.cleanup_policy, CleanupPolicy::Compact);
  }

  #[test]
  fn log_config_rejects_unknown_policy() {
    let mut settings = HashMap::new();
    settings.insert("cleanup.policy".to_string(), "delete".to_string());
    assert!(LogConfig::from_map(&settings).is_err());
  }

  #[test]
  fn spec_keeps_its_types() {
    let spec = Stores::key_value::<String, Vec<u8>>("s", StringSerde, JsonSerde::new()).build();
    assert!(spec.key_serde::<String>().is_some());
    assert!(spec.value_serde::<Vec<u8>>().is_some());
    assert!(spec.key_serde::<u64>().is_none());
    assert!(spec.logging_enabled());
    assert!(!spec.persistent());
  }
}
