//! On-disk layout of an application's state.
//!
//! ```text
//! <state_dir>/<application_id>/
//!   stores/
//!     .checkpoint                 checkpoints of all stores
//!     <store>.db                  persistent store contents
//!   changelog/
//!     <application_id>-<store>-changelog.log
//! ```
//!
//! Only `stores/` is local state: [`StateDirectory::clean_local_state`] removes
//! it and the next start rebuilds every store from its change log.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Paths of one application's state.
#[derive(Debug, Clone)]
pub struct StateDirectory {
  application_id: String,
  root: PathBuf,
}

impl StateDirectory {
  /// Creates the layout rooted at `<state_dir>/<application_id>`. Nothing is
  /// created on disk until a store is opened.
  pub fn new<P: AsRef<Path>>(state_dir: P, application_id: &str) -> Self {
    Self {
      application_id: application_id.to_string(),
      root: state_dir.as_ref().join(sanitize(application_id)),
    }
  }

  /// Application root directory.
  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Directory of local store state.
  pub fn stores_dir(&self) -> PathBuf {
    self.root.join("stores")
  }

  /// Directory of change logs.
  pub fn changelog_dir(&self) -> PathBuf {
    self.root.join("changelog")
  }

  /// File holding a persistent store's contents.
  pub fn store_file(&self, store: &str) -> PathBuf {
    self.stores_dir().join(format!("{}.db", sanitize(store)))
  }

  /// File holding the checkpoints of all stores.
  pub fn checkpoint_file(&self) -> PathBuf {
    self.stores_dir().join(".checkpoint")
  }

  /// Name of a store's change log.
  pub fn changelog_name(&self, store: &str) -> String {
    format!("{}-{}-changelog", self.application_id, store)
  }

  /// File holding a store's change log.
  pub fn changelog_file(&self, store: &str) -> PathBuf {
    self
      .changelog_dir()
      .join(format!("{}.log", sanitize(&self.changelog_name(store))))
  }

  /// Deletes local store state (store files and checkpoints). Change logs are kept.
  pub fn clean_local_state(&self) -> io::Result<()> {
    let dir = self.stores_dir();
    match fs::remove_dir_all(&dir) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e),
    }
  }
}

fn sanitize(name: &str) -> String {
  name.replace(|c: char| !c.is_alphanumeric() && c != '_' && c != '-' && c != '.', "_")
}
