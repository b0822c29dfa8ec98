//! # StateWeave
//!
//! Restartable stream processing with change-logged state in pure Rust.
//!
//! StateWeave runs a topology of processors over named, offset-addressed
//! channels. Processors keep their state in key/value stores whose every
//! mutation is appended to a change log; on start the runtime replays each log
//! from the store's last checkpoint before the first record is processed, so a
//! restarted application picks up exactly the state it had.
//!
//! ## Key Features
//!
//! - **Topology graph**: sources, processors and sinks wired by name, validated as they are added
//! - **Change-logged stores**: in-memory or persistent, with optional log compaction
//! - **Restoration**: checkpointed, resumable replay with progress listeners
//! - **Co-grouping**: per-key aggregation of two streams into one tuple
//! - **Lifecycle**: `CREATED → RESTORING → RUNNING → CLOSING → CLOSED` on Tokio
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stateweave::channel::Channels;
//! use stateweave::codec::{JsonSerde, StringSerde};
//! use stateweave::config::StreamsConfig;
//! use stateweave::processor::{CoGroupProcessor, CoGrouped};
//! use stateweave::runtime::Runtime;
//! use stateweave::state::Stores;
//! use stateweave::topology::Topology;
//!
//! # async fn run() -> Result<(), stateweave::error::StreamsError> {
//! let mut topology = Topology::new();
//! topology
//!   .add_source("clicks", "clicks", StringSerde, JsonSerde::<u32>::new())?
//!   .add_source("purchases", "purchases", StringSerde, StringSerde)?
//!   .add_processor(
//!     "cogroup",
//!     || CoGroupProcessor::<String, u32, String>::new("tuples"),
//!     &["clicks", "purchases"],
//!   )?
//!   .add_state_store(
//!     Stores::key_value::<String, CoGrouped<u32, String>>("tuples", StringSerde, JsonSerde::new())
//!       .persistent()
//!       .build(),
//!     &["cogroup"],
//!   )?;
//!
//! let channels = Channels::new();
//! let mut runtime = Runtime::new(topology, channels.clone(), StreamsConfig::new("cogrouping-app"))?;
//! runtime.start().await?;
//! channels.producer("clicks", StringSerde, JsonSerde::<u32>::new()).send(&"user-1".to_string(), &3)?;
//! runtime.close().await?;
//! # Ok(())
//! # }
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// In-process broker of named, offset-addressed channels.
pub mod channel;
/// Persisted restoration checkpoints.
pub mod checkpoint;
/// Key and value serializers.
pub mod codec;
/// Runtime configuration.
pub mod config;
/// Error types.
pub mod error;
/// Processor trait, context and built-in processors.
pub mod processor;
/// Records flowing through a topology.
pub mod record;
/// Change log replay and restoration listeners.
pub mod restore;
/// Runtime lifecycle and the stream task.
pub mod runtime;
/// Change-logged key/value state stores.
pub mod state;
/// Topology graph and its description.
pub mod topology;


pub use channel::Channels;
pub use config::StreamsConfig;
pub use error::StreamsError;
pub use record::Record;
pub use runtime::{Runtime, RuntimeState};
pub use topology::Topology;
