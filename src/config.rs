//! # Runtime configuration
//!
//! [`StreamsConfig`] holds every setting of a [`Runtime`](crate::runtime::Runtime).
//! It is built in code with `with_*` methods or loaded from a JSON file, where
//! durations are written in milliseconds:
//!
//! ```json
//! {
//!   "application_id": "cogrouping-app",
//!   "state_dir": "/var/lib/stateweave",
//!   "commit_interval": 10000,
//!   "processing_error_action": "skip"
//! }
//! ```
//!
//! Missing fields take their defaults; only `application_id` is required.

use crate::error::{ConfigError, ErrorAction};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where a source starts when its consumer group has no committed position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetResetPolicy {
  /// Start from the first record of the channel.
  #[default]
  Earliest,
  /// Start after the last record present at start-up.
  Latest,
  /// Refuse to start.
  None,
}

/// Which timestamp records carry through the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampExtractor {
  /// The timestamp written with the channel record.
  #[default]
  RecordTime,
  /// Processing time, read when the record is polled.
  WallClock,
}

/// Settings of a stream processing application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamsConfig {
  /// Application id: consumer group of the sources and state sub-directory.
  pub application_id: String,
  /// Client id used in logs.
  pub client_id: String,
  /// Root directory of local state and change logs.
  pub state_dir: PathBuf,
  /// Upper bound of one wait for new input (default: 100 ms).
  #[serde(with = "duration_ms")]
  pub poll_timeout: Duration,
  /// Interval between commits (default: 30 s).
  #[serde(with = "duration_ms")]
  pub commit_interval: Duration,
  /// Records fetched per source and poll (default: 500).
  pub max_poll_records: usize,
  /// Change log entries applied between restoration progress reports
  /// (default: 1000).
  pub restore_batch_size: usize,
  /// Start position without a committed one.
  pub auto_offset_reset: OffsetResetPolicy,
  /// Record timestamp source.
  pub timestamp_extractor: TimestampExtractor,
  /// What to do when a processor fails with a non-fatal error.
  pub processing_error_action: ErrorAction,
}

impl Default for StreamsConfig {
  fn default() -> Self {
    Self {
      application_id: String::new(),
      client_id: String::new(),
      state_dir: std::env::temp_dir().join("stateweave"),
      poll_timeout: Duration::from_millis(100),
      commit_interval: Duration::from_secs(30),
      max_poll_records: 500,
      restore_batch_size: 1000,
      auto_offset_reset: OffsetResetPolicy::Earliest,
      timestamp_extractor: TimestampExtractor::RecordTime,
      processing_error_action: ErrorAction::Stop,
    }
  }
}

impl StreamsConfig {
  /// Creates a config with defaults for `application_id`.
  pub fn new(application_id: impl Into<String>) -> Self {
    let application_id = application_id.into();
    Self {
      client_id: format!("{application_id}-client"),
      application_id,
      ..Self::default()
    }
  }

  /// Loads a config from a JSON file and validates it.
  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    let mut config: Self =
      serde_json::from_str(&data).map_err(|e| ConfigError::Parse(e.to_string()))?;
    if config.client_id.is_empty() {
      config.client_id = format!("{}-client", config.application_id);
    }
    config.validate()?;
    Ok(config)
  }

  /// Checks that every setting is usable.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.application_id.trim().is_empty() {
      return Err(ConfigError::Invalid {
        key: "application_id",
        reason: "must not be empty".to_string(),
      });
    }
    if self.poll_timeout.is_zero() {
      return Err(ConfigError::Invalid {
        key: "poll_timeout",
        reason: "must be positive".to_string(),
      });
    }
    if self.commit_interval.is_zero() {
      return Err(ConfigError::Invalid {
        key: "commit_interval",
        reason: "must be positive".to_string(),
      });
    }
    if self.max_poll_records == 0 {
      return Err(ConfigError::Invalid {
        key: "max_poll_records",
        reason: "must be at least 1".to_string(),
      });
    }
    if self.restore_batch_size == 0 {
      return Err(ConfigError::Invalid {
        key: "restore_batch_size",
        reason: "must be at least 1".to_string(),
      });
    }
    Ok(())
  }

  /// Sets the client id.
  #[must_use]
  pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
    self.client_id = client_id.into();
    self
  }

  /// Sets the state directory.
  #[must_use]
  pub fn with_state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
    self.state_dir = state_dir.into();
    self
  }

  /// Sets the poll timeout.
  #[must_use]
  pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
    self.poll_timeout = timeout;
    self
  }

  /// Sets the commit interval.
  #[must_use]
  pub fn with_commit_interval(mut self, interval: Duration) -> Self {
    self.commit_interval = interval;
    self
  }

  /// Sets the number of records fetched per poll.
  #[must_use]
  pub fn with_max_poll_records(mut self, max: usize) -> Self {
    self.max_poll_records = max;
    self
  }

  /// Sets the restoration batch size.
  #[must_use]
  pub fn with_restore_batch_size(mut self, size: usize) -> Self {
    self.restore_batch_size = size;
    self
  }

  /// Sets the offset reset policy.
  #[must_use]
  pub fn with_auto_offset_reset(mut self, policy: OffsetResetPolicy) -> Self {
    self.auto_offset_reset = policy;
    self
  }

  /// Sets the timestamp extractor.
  #[must_use]
  pub fn with_timestamp_extractor(mut self, extractor: TimestampExtractor) -> Self {
    self.timestamp_extractor = extractor;
    self
  }

  /// Sets the processing error action.
  #[must_use]
  pub fn with_processing_error_action(mut self, action: ErrorAction) -> Self {
    self.processing_error_action = action;
    self
  }
}

/// Serializes a [`Duration`] as whole milliseconds.
pub mod duration_ms {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  /// Writes `duration` as milliseconds.
  pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
  }

  /// Reads milliseconds into a [`Duration`].
  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn defaults() {
    let config = StreamsConfig::new("app");
    assert_eq!(config.client_id, "app-client");
    assert_eq!(config.poll_timeout, Duration::from_millis(100));
    assert_eq!(config.commit_interval, Duration::from_secs(30));
    assert_eq!(config.auto_offset_reset, OffsetResetPolicy::Earliest);
    assert_eq!(config.processing_error_action, ErrorAction::Stop);
    assert!(config.validate().is_ok());
  }

  #[test]
  fn validate_rejects_empty_id_and_zero_sizes() {
    assert!(matches!(
      StreamsConfig::default().validate(),
      Err(ConfigError::Invalid {
        key: "application_id",
        ..
      })
    ));
    assert!(matches!(
      StreamsConfig::new("a").with_max_poll_records(0).validate(),
      Err(ConfigError::Invalid {
        key: "max_poll_records",
        ..
      })
    ));
    assert!(matches!(
      StreamsConfig::new("a")
        .with_poll_timeout(Duration::ZERO)
        .validate(),
      Err(ConfigError::Invalid {
        key: "poll_timeout",
        ..
      })
    ));
  }

  #[test]
  fn loads_json_with_millisecond_durations() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("streams.json");
    std::fs::write(
      &path,
      r#"{
        "application_id": "cogrouping-app",
        "commit_interval": 250,
        "auto_offset_reset": "latest",
        "timestamp_extractor": "wall_clock",
        "processing_error_action": "skip"
      }"#,
    )
    .unwrap();

    let config = StreamsConfig::from_json_file(&path).unwrap();
    assert_eq!(config.application_id, "cogrouping-app");
    assert_eq!(config.client_id, "cogrouping-app-client");
    assert_eq!(config.commit_interval, Duration::from_millis(250));
    assert_eq!(config.poll_timeout, Duration::from_millis(100));
    assert_eq!(config.auto_offset_reset, OffsetResetPolicy::Latest);
    assert_eq!(config.timestamp_extractor, TimestampExtractor::WallClock);
    assert_eq!(config.processing_error_action, ErrorAction::Skip);
  }

  #[test]
  fn missing_file_and_bad_json_are_reported() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
      StreamsConfig::from_json_file(dir.path().join("absent.json")),
      Err(ConfigError::Io { .. })
    ));
    let path = dir.path().join("bad.json");
    std::fs::write(&path, "{").unwrap();
    assert!(matches!(
      StreamsConfig::from_json_file(&path),
      Err(ConfigError::Parse(_))
    ));
  }
}
