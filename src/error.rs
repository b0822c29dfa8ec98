//! # Error Handling
//!
//! Typed errors for every concern of a stateweave application, composed into
//! the top-level [`StreamsError`] returned by the [`Runtime`](crate::runtime::Runtime).
//!
//! ## Error classes
//!
//! - **[`GraphError`]**: malformed topology (duplicate names, missing parents).
//!   Raised while the topology is assembled, never at runtime.
//! - **[`SerializationError`]**: a payload could not be encoded or decoded. At a
//!   source this is logged and the record is skipped.
//! - **[`StoreError`]**: state store failures. [`StoreError::Io`] is the
//!   store-I/O class and is always fatal to the owning runtime.
//! - **[`RestoreError`]**: restoration aborted (truncated or corrupt change log).
//!   Fatal for the affected store; reported as aborted, never as complete.
//! - **[`LifecycleError`]**: invalid state transition such as a double start.
//!   Rejected synchronously with no partial effect.
//!
//! ## Processing errors
//!
//! User processors return [`ProcessorError`]. Whether a non-fatal processor
//! error stops the runtime or skips the record is decided by the configured
//! [`ErrorAction`].

use crate::runtime::RuntimeState;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Action to take when a processor fails on a record with a non-fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
  /// Stop processing: the runtime moves to `Closing` and reports the error.
  #[default]
  Stop,
  /// Log the failure and continue with the next record.
  Skip,
}

/// Error raised while assembling a [`Topology`](crate::topology::Topology).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
  /// A node with this name already exists.
  #[error("node name '{0}' is already used in this topology")]
  DuplicateName(String),
  /// A parent or processor reference names a node that was not added yet.
  #[error("unknown node '{0}'")]
  UnknownNode(String),
  /// A processor or sink was added without any parent.
  #[error("node '{0}' must have at least one parent")]
  NoParents(String),
  /// The referenced node cannot be used as a parent (sinks have no children).
  #[error("node '{parent}' cannot be a parent of '{child}': sinks have no successors")]
  InvalidParent {
    /// The offending parent.
    parent: String,
    /// The node being added.
    child: String,
  },
  /// The same parent was listed more than once for one node.
  #[error("node '{parent}' is listed more than once as a parent of '{child}'")]
  DuplicateParent {
    /// The repeated parent.
    parent: String,
    /// The node being added.
    child: String,
  },
  /// A channel is already consumed by another source node.
  #[error("channel '{channel}' is already consumed by source '{source_node}'")]
  ChannelAlreadySubscribed {
    /// The channel name.
    channel: String,
    /// The source that already reads it.
    source_node: String,
  },
  /// A store with this name was already added.
  #[error("state store '{0}' is already registered")]
  DuplicateStore(String),
  /// A store reference names a store that was not added.
  #[error("unknown state store '{0}'")]
  UnknownStore(String),
  /// Stores can only be connected to processor nodes.
  #[error("state store '{store}' can only be connected to processors, '{node}' is not one")]
  StoreOnNonProcessor {
    /// The store name.
    store: String,
    /// The node it was connected to.
    node: String,
  },
}

/// Error raised when a payload cannot be serialized or deserialized.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SerializationError {
  /// The bytes could not be decoded into the expected type.
  #[error("cannot deserialize {type_name}: {reason}")]
  Deserialize {
    /// Target type.
    type_name: &'static str,
    /// Decoder message.
    reason: String,
  },
  /// The value could not be encoded.
  #[error("cannot serialize {type_name}: {reason}")]
  Serialize {
    /// Source type.
    type_name: &'static str,
    /// Encoder message.
    reason: String,
  },
  /// A type-erased payload did not hold the type the serializer expects.
  #[error("payload is not a {expected}")]
  UnexpectedPayload {
    /// The type the serializer was configured for.
    expected: &'static str,
  },
}

/// Error raised by change log operations.
#[derive(Error, Debug)]
pub enum ChangeLogError {
  /// The log file could not be read or written.
  #[error("change log {path}: {source}")]
  Io {
    /// Path of the log file.
    path: PathBuf,
    /// Underlying I/O error.
    #[source]
    source: std::io::Error,
  },
  /// The log holds an entry that cannot be decoded (truncated write or corruption).
  #[error("change log {path} is corrupt at line {line}: {reason}")]
  Corrupt {
    /// Path of the log file.
    path: PathBuf,
    /// 1-based line number of the first bad entry.
    line: usize,
    /// Decoder message.
    reason: String,
  },
}

/// Error raised by checkpoint stores.
#[derive(Error, Debug)]
pub enum CheckpointError {
  /// I/O error while persisting checkpoints.
  #[error("checkpoint io error: {0}")]
  Io(#[from] std::io::Error),
  /// The checkpoint file could not be decoded.
  #[error("checkpoint serialization error: {0}")]
  Serialization(String),
  /// A lock guarding the checkpoints was poisoned.
  #[error("checkpoint lock error: {0}")]
  Lock(String),
}

/// Error raised by state store operations.
#[derive(Error, Debug)]
pub enum StoreError {
  /// The underlying persistent storage is unavailable. Fatal to the runtime.
  #[error("store '{store}' io error: {source}")]
  Io {
    /// Store name.
    store: String,
    /// Underlying error.
    #[source]
    source: std::io::Error,
  },
  /// The change log backing the store failed.
  #[error("store '{store}' change log error: {source}")]
  ChangeLog {
    /// Store name.
    store: String,
    /// Underlying change log error.
    #[source]
    source: ChangeLogError,
  },
  /// Persisting the checkpoint failed.
  #[error("store '{store}' checkpoint error: {source}")]
  Checkpoint {
    /// Store name.
    store: String,
    /// Underlying checkpoint error.
    #[source]
    source: CheckpointError,
  },
  /// A key or value failed to encode or decode with the store's serdes.
  #[error("store '{store}': {source}")]
  Serialization {
    /// Store name.
    store: String,
    /// Underlying serde error.
    #[source]
    source: SerializationError,
  },
  /// The store was opened with types other than those it was created with.
  #[error("store '{store}' holds {expected_key} -> {expected_value}, requested {requested_key} -> {requested_value}")]
  TypeMismatch {
    /// Store name.
    store: String,
    /// Key type fixed at creation.
    expected_key: &'static str,
    /// Value type fixed at creation.
    expected_value: &'static str,
    /// Key type requested by the caller.
    requested_key: &'static str,
    /// Value type requested by the caller.
    requested_value: &'static str,
  },
  /// No store with this name exists in the running topology.
  #[error("unknown state store '{0}'")]
  Unknown(String),
  /// The calling processor is not connected to the store.
  #[error("processor '{processor}' is not connected to state store '{store}'")]
  NotConnected {
    /// Store name.
    store: String,
    /// Processor name.
    processor: String,
  },
  /// The store has not finished restoration and cannot be read yet.
  #[error("state store '{0}' is still restoring")]
  NotRestored(String),
}

impl StoreError {
  /// Returns true for the storage-unavailable class that must stop the runtime.
  pub fn is_fatal(&self) -> bool {
    matches!(
      self,
      StoreError::Io { .. } | StoreError::ChangeLog { .. } | StoreError::Checkpoint { .. }
    )
  }
}

/// Error raised when restoration of a store is aborted.
///
/// An aborted restoration never leaves the store presented as complete: the
/// store stays in the restoring state and the runtime refuses to start.
#[derive(Error, Debug)]
pub enum RestoreError {
  /// The change log could not be replayed.
  #[error("restoration of '{store}' aborted after {restored} records: {source}")]
  ChangeLog {
    /// Store name.
    store: String,
    /// Records applied before the failure.
    restored: u64,
    /// Underlying change log error.
    #[source]
    source: ChangeLogError,
  },
  /// The store could not be opened for restoration.
  #[error("restoration of '{store}' could not start: {source}")]
  Store {
    /// Store name.
    store: String,
    /// Underlying store error.
    #[source]
    source: Box<StoreError>,
  },
  /// The log ended before the offset recorded at restoration start.
  #[error("change log of '{store}' ended at offset {reached}, expected {expected}")]
  Truncated {
    /// Store name.
    store: String,
    /// Offset the log was expected to reach.
    expected: u64,
    /// Offset actually reached.
    reached: u64,
  },
}

/// Error raised on an invalid lifecycle transition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot {operation} while runtime is {state}")]
pub struct LifecycleError {
  /// State the runtime was in.
  pub state: RuntimeState,
  /// Operation that was rejected.
  pub operation: &'static str,
}

/// Error returned by a [`Processor`](crate::processor::Processor).
#[derive(Error, Debug)]
pub enum ProcessorError {
  /// A state store operation failed.
  #[error(transparent)]
  Store(#[from] StoreError),
  /// A payload failed to encode or decode.
  #[error(transparent)]
  Serialization(#[from] SerializationError),
  /// The record did not carry the payload type the processor expects.
  #[error("processor '{processor}' received a payload that is not {expected}")]
  UnexpectedType {
    /// Processor name.
    processor: String,
    /// Expected type description.
    expected: &'static str,
  },
  /// A record was forwarded to a node that is not a child of the sender.
  #[error("processor '{processor}' has no child named '{child}'")]
  UnknownChild {
    /// Sending processor.
    processor: String,
    /// Requested child.
    child: String,
  },
  /// Any other processing failure.
  #[error("{0}")]
  Other(String),
}

impl ProcessorError {
  /// Returns true if the error belongs to the fatal store-I/O class.
  pub fn is_fatal(&self) -> bool {
    matches!(self, ProcessorError::Store(e) if e.is_fatal())
  }
}

/// Error raised by configuration loading or validation.
#[derive(Error, Debug)]
pub enum ConfigError {
  /// The configuration file could not be read.
  #[error("cannot read config {path}: {source}")]
  Io {
    /// Path of the file.
    path: PathBuf,
    /// Underlying error.
    #[source]
    source: std::io::Error,
  },
  /// The configuration could not be parsed.
  #[error("cannot parse config: {0}")]
  Parse(String),
  /// A setting holds an invalid value.
  #[error("invalid setting {key}: {reason}")]
  Invalid {
    /// Setting name.
    key: &'static str,
    /// Why it was rejected.
    reason: String,
  },
}

/// Top-level error returned by runtime operations.
#[derive(Error, Debug)]
pub enum StreamsError {
  /// Topology assembly failed.
  #[error(transparent)]
  Graph(#[from] GraphError),
  /// Invalid lifecycle transition.
  #[error(transparent)]
  Lifecycle(#[from] LifecycleError),
  /// Restoration aborted.
  #[error(transparent)]
  Restore(#[from] RestoreError),
  /// Fatal store failure.
  #[error(transparent)]
  Store(#[from] StoreError),
  /// A payload could not be encoded for a channel.
  #[error(transparent)]
  Serialization(#[from] SerializationError),
  /// A processor failed and the error action was `Stop`.
  #[error("processing failed in '{node}': {source}")]
  Processor {
    /// Node where the failure happened.
    node: String,
    /// Underlying error.
    #[source]
    source: ProcessorError,
  },
  /// Checkpoint persistence failed.
  #[error(transparent)]
  Checkpoint(#[from] CheckpointError),
  /// Configuration rejected.
  #[error(transparent)]
  Config(#[from] ConfigError),
  /// The processing task panicked or was aborted.
  #[error("stream task failed: {0}")]
  Task(String),
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn store_io_errors_are_fatal() {
    let err = StoreError::Io {
      store: "s".to_string(),
      source: std::io::Error::from(std::io::ErrorKind::NotFound),
    };
    assert!(err.is_fatal());
    assert!(ProcessorError::Store(err).is_fatal());
    assert!(!StoreError::Unknown("s".to_string()).is_fatal());
    assert!(!ProcessorError::Other("boom".to_string()).is_fatal());
  }

  #[test]
  fn lifecycle_error_message_names_state_and_operation() {
    let err = LifecycleError {
      state: RuntimeState::Closed,
      operation: "close",
    };
    assert_eq!(err.to_string(), "cannot close while runtime is CLOSED");
  }
}
