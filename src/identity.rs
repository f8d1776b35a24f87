//! Persistence of the local player's display name.
//!
//! The name is read once when the [`SyncEngine`](crate::engine::SyncEngine)
//! starts and written whenever it changes.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::error::{CounterSyncError, Result};
use crate::protocol::PlayerName;

/// Key-value storage for the chosen player name.
pub trait NameStore: Send + Sync + 'static {
    /// Read the stored name, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be read.
    fn load(&self) -> Result<Option<PlayerName>>;

    /// Persist `name`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be written.
    fn save(&self, name: &str) -> Result<()>;
}

/// Trim `raw` and reject names that are empty afterwards.
///
/// # Errors
///
/// Returns [`CounterSyncError::EmptyName`] for blank input.
pub fn normalize_name(raw: &str) -> Result<PlayerName> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CounterSyncError::EmptyName);
    }
    Ok(trimmed.to_string())
}

/// A [`NameStore`] that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryNameStore {
    name: Mutex<Option<PlayerName>>,
}

impl MemoryNameStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with `name` already stored.
    pub fn with_name(name: impl Into<PlayerName>) -> Self {
        Self {
            name: Mutex::new(Some(name.into())),
        }
    }
}

impl NameStore for MemoryNameStore {
    fn load(&self) -> Result<Option<PlayerName>> {
        Ok(self
            .name
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, name: &str) -> Result<()> {
        *self.name.lock().unwrap_or_else(PoisonError::into_inner) = Some(name.to_string());
        Ok(())
    }
}

/// A [`NameStore`] backed by a small text file holding just the name.
#[derive(Debug, Clone)]
pub struct FileNameStore {
    path: PathBuf,
}

impl FileNameStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl NameStore for FileNameStore {
    fn load(&self) -> Result<Option<PlayerName>> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Ok(normalize_name(&contents).ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, name: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, name)?;
        tracing::debug!(path = %self.path.display(), "player name saved");
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn normalize_trims_and_rejects_blank() {
        assert_eq!(normalize_name("  Alice \n").unwrap(), "Alice");
        assert!(matches!(
            normalize_name("   "),
            Err(CounterSyncError::EmptyName)
        ));
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryNameStore::new();
        assert_eq!(store.load().unwrap(), None);
        store.save("Bob").unwrap();
        assert_eq!(store.load().unwrap().as_deref(), Some("Bob"));
    }

    #[test]
    fn file_store_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileNameStore::new(dir.path().join("player-name"));
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("player-name");

        FileNameStore::new(&path).save("Alice").unwrap();
        let reopened = FileNameStore::new(&path);
        assert_eq!(reopened.load().unwrap().as_deref(), Some("Alice"));
        assert_eq!(reopened.path(), path.as_path());
    }

    #[test]
    fn file_store_ignores_blank_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("player-name");
        std::fs::write(&path, "\n").unwrap();
        assert_eq!(FileNameStore::new(path).load().unwrap(), None);
    }
}
