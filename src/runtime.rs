//! # Runtime
//!
//! A [`Runtime`] owns a [`Topology`] and drives it against a [`Channels`]
//! broker. Its lifecycle is:
//!
//! ```text
//! CREATED ──start()──► RESTORING ──► RUNNING ──close()──► CLOSING ──► CLOSED
//!    │                     │                                 ▲
//!    └──────close()────────┼─────────────────────────────────┘ (to CLOSED)
//!                          └──── restore/init failure ───────► CLOSING
//! ```
//!
//! `start()` opens every state store, replays change logs through the
//! [`RestorationCoordinator`](crate::restore::RestorationCoordinator), calls
//! `init` on every processor and then spawns the poll loop on the tokio
//! runtime. A fatal failure in the loop moves the runtime to `CLOSING`; the
//! error is returned by the following `close()`.
//!
//! `close()` asks the loop to stop at its next poll boundary, waits for the
//! in-flight record to finish, then flushes the stores, persists checkpoints
//! and commits consumer positions before reaching `CLOSED`.
//!
//! ```rust,no_run
//! use stateweave::channel::Channels;
//! use stateweave::config::StreamsConfig;
//! use stateweave::runtime::Runtime;
//! use stateweave::topology::Topology;
//!
//! # async fn run(topology: Topology) -> Result<(), stateweave::error::StreamsError> {
//! let channels = Channels::new();
//! let mut runtime = Runtime::new(topology, channels.clone(), StreamsConfig::new("app"))?;
//! runtime.set_state_listener(|new, old| println!("{old} -> {new}"));
//! runtime.start().await?;
//! // ...
//! runtime.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod task;

pub use task::StreamTask;

use crate::channel::Channels;
use crate::config::StreamsConfig;
use crate::error::{LifecycleError, StoreError, StreamsError};
use crate::restore::{NoopRestoreListener, RestoreSummary, StateRestoreListener};
use crate::state::StateDirectory;
use crate::topology::{Topology, TopologyDescription};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Lifecycle state of a [`Runtime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeState {
  /// Built, not started.
  Created,
  /// Restoring state stores.
  Restoring,
  /// Processing records.
  Running,
  /// Shutting down, or stopped by a fatal error.
  Closing,
  /// Stopped.
  Closed,
}

impl RuntimeState {
  /// Whether a transition from `self` to `next` is allowed.
  pub fn can_transition_to(self, next: RuntimeState) -> bool {
    use RuntimeState::*;
    matches!(
      (self, next),
      (Created, Restoring)
        | (Created, Closed)
        | (Restoring, Running)
        | (Restoring, Closing)
        | (Running, Closing)
        | (Closing, Closed)
    )
  }

  /// Whether the runtime is restoring or processing.
  pub fn is_alive(self) -> bool {
    matches!(self, RuntimeState::Restoring | RuntimeState::Running)
  }
}

impl fmt::Display for RuntimeState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      RuntimeState::Created => "CREATED",
      RuntimeState::Restoring => "RESTORING",
      RuntimeState::Running => "RUNNING",
      RuntimeState::Closing => "CLOSING",
      RuntimeState::Closed => "CLOSED",
    };
    f.write_str(name)
  }
}

type StateListener = Arc<dyn Fn(RuntimeState, RuntimeState) + Send + Sync>;

/// Lifecycle state shared between a runtime and its stream task.
#[derive(Clone)]
pub(crate) struct Lifecycle {
  inner: Arc<LifecycleInner>,
}

struct LifecycleInner {
  state: Mutex<RuntimeState>,
  listener: Mutex<Option<StateListener>>,
}

impl Lifecycle {
  fn new() -> Self {
    Self {
      inner: Arc::new(LifecycleInner {
        state: Mutex::new(RuntimeState::Created),
        listener: Mutex::new(None),
      }),
    }
  }

  pub(crate) fn state(&self) -> RuntimeState {
    *self
      .inner
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn set_listener(&self, listener: StateListener) {
    *self
      .inner
      .listener
      .lock()
      .unwrap_or_else(PoisonError::into_inner) = Some(listener);
  }

  /// Moves to `next` if allowed. Returns false and changes nothing otherwise.
  pub(crate) fn transition(&self, next: RuntimeState) -> bool {
    let old = {
      let mut state = self
        .inner
        .state
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
      if !state.can_transition_to(next) {
        return false;
      }
      std::mem::replace(&mut *state, next)
    };
    info!(from = %old, to = %next, "runtime state transition");
    let listener = self
      .inner
      .listener
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone();
    // called without holding any lock so the listener may query the runtime
    if let Some(listener) = listener {
      listener(next, old);
    }
    true
  }
}

/// Runs a topology: restores its stores, then processes records until closed.
pub struct Runtime {
  topology: Arc<Topology>,
  channels: Channels,
  config: StreamsConfig,
  dirs: StateDirectory,
  lifecycle: Lifecycle,
  restore_listener: Arc<dyn StateRestoreListener>,
  restored: Vec<RestoreSummary>,
  cancel: CancellationToken,
  handle: Option<JoinHandle<Result<(), StreamsError>>>,
}

impl Runtime {
  /// Creates a runtime for `topology`, reading and writing `channels`.
  ///
  /// Fails if `config` does not validate.
  pub fn new(
    topology: Topology,
    channels: Channels,
    config: StreamsConfig,
  ) -> Result<Self, StreamsError> {
    config.validate()?;
    let dirs = StateDirectory::new(&config.state_dir, &config.application_id);
    Ok(Self {
      topology: Arc::new(topology),
      channels,
      config,
      dirs,
      lifecycle: Lifecycle::new(),
      restore_listener: Arc::new(NoopRestoreListener),
      restored: Vec::new(),
      cancel: CancellationToken::new(),
      handle: None,
    })
  }

  /// Registers a callback receiving every `(new, old)` state transition.
  pub fn set_state_listener<F>(&mut self, listener: F)
  where
    F: Fn(RuntimeState, RuntimeState) + Send + Sync + 'static,
  {
    self.lifecycle.set_listener(Arc::new(listener));
  }

  /// Sets the listener notified of restoration progress. Takes effect on the
  /// next `start()`.
  pub fn set_restore_listener(&mut self, listener: Arc<dyn StateRestoreListener>) {
    self.restore_listener = listener;
  }

  /// Current lifecycle state.
  pub fn state(&self) -> RuntimeState {
    self.lifecycle.state()
  }

  /// Describes the topology being run.
  pub fn describe(&self) -> TopologyDescription {
    self.topology.describe()
  }

  /// Root of this application's local state and change logs.
  pub fn state_directory(&self) -> &Path {
    self.dirs.root()
  }

  /// Runtime configuration.
  pub fn config(&self) -> &StreamsConfig {
    &self.config
  }

  /// Stores restored by the last `start()`, in declaration order.
  pub fn restored(&self) -> &[RestoreSummary] {
    &self.restored
  }

  /// Deletes local store state so the next start restores every store from
  /// its change log. Only allowed while `CREATED` or `CLOSED`.
  pub fn clean_up(&self) -> Result<(), StreamsError> {
    let state = self.state();
    if !matches!(state, RuntimeState::Created | RuntimeState::Closed) {
      return Err(
        LifecycleError {
          state,
          operation: "clean up",
        }
        .into(),
      );
    }
    self
      .dirs
      .clean_local_state()
      .map_err(|source| StoreError::Io {
        store: self.dirs.stores_dir().display().to_string(),
        source,
      })?;
    info!(dir = %self.dirs.stores_dir().display(), "local state removed");
    Ok(())
  }

  /// Restores all stores and starts processing.
  ///
  /// Returns once the poll loop is running. On failure the runtime is left
  /// `CLOSING`; call [`close`](Self::close) to finish the shutdown.
  pub async fn start(&mut self) -> Result<(), StreamsError> {
    let state = self.state();
    if state != RuntimeState::Created || !self.lifecycle.transition(RuntimeState::Restoring) {
      return Err(
        LifecycleError {
          state,
          operation: "start",
        }
        .into(),
      );
    }
    info!(
      application_id = %self.config.application_id,
      client_id = %self.config.client_id,
      state_dir = %self.dirs.root().display(),
      "starting runtime"
    );

    let topology = Arc::clone(&self.topology);
    let channels = self.channels.clone();
    let config = self.config.clone();
    let dirs = self.dirs.clone();
    let listener = Arc::clone(&self.restore_listener);
    // store files and change logs are read synchronously
    let prepared = tokio::task::spawn_blocking(move || {
      let mut task = StreamTask::new(&topology, channels, &config, &dirs)?;
      let summaries = task.restore(listener.as_ref())?;
      task.init_processors()?;
      Ok::<_, StreamsError>((task, summaries))
    })
    .await
    .map_err(|e| StreamsError::Task(e.to_string()))
    .and_then(|r| r);

    let (task, summaries) = match prepared {
      Ok(prepared) => prepared,
      Err(e) => {
        error!(error = %e, "runtime failed to start");
        self.lifecycle.transition(RuntimeState::Closing);
        return Err(e);
      }
    };
    self.restored = summaries;

    self.lifecycle.transition(RuntimeState::Running);
    let cancel = self.cancel.child_token();
    let lifecycle = self.lifecycle.clone();
    self.handle = Some(tokio::spawn(task.run(cancel, lifecycle)));
    Ok(())
  }

  /// Stops processing, persists final checkpoints and moves to `CLOSED`.
  ///
  /// Returns the error that stopped the poll loop, if any. Fails with a
  /// [`LifecycleError`] when already closed.
  pub async fn close(&mut self) -> Result<(), StreamsError> {
    let state = self.state();
    match state {
      RuntimeState::Closed => Err(
        LifecycleError {
          state,
          operation: "close",
        }
        .into(),
      ),
      RuntimeState::Created => {
        self.lifecycle.transition(RuntimeState::Closed);
        Ok(())
      }
      _ => {
        self.lifecycle.transition(RuntimeState::Closing);
        self.cancel.cancel();
        let result = match self.handle.take() {
          Some(handle) => match handle.await {
            Ok(result) => result,
            Err(e) => Err(StreamsError::Task(e.to_string())),
          },
          None => Ok(()),
        };
        self.lifecycle.transition(RuntimeState::Closed);
        info!(application_id = %self.config.application_id, "runtime closed");
        result
      }
    }
  }
}

impl Drop for Runtime {
  fn drop(&mut self) {
    // lets a still running loop commit and exit
    self.cancel.cancel();
  }
}

impl fmt::Debug for Runtime {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Runtime")
      .field("application_id", &self.config.application_id)
      .field("state", &self.state())
      .finish()
  }
}

