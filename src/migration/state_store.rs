//! Cutover state persistence
//!
//! Stores the [`CutoverRecord`] of an attempt as pretty-printed JSON in the
//! configured data directory. Every write goes to a temp file that is then
//! renamed over the previous record, so a crash leaves either the old or the
//! new state on disk, never a torn one.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, error};

use super::state::CutoverRecord;

/// Errors during state persistence.
#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    /// I/O error reading or writing the state file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file content could not be parsed.
    #[error("corrupt state file: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// File-backed store for one cutover record.
#[derive(Debug, Clone)]
pub struct CutoverStateStore {
    path: PathBuf,
}

impl CutoverStateStore {
    /// Store the record for attempt `id` under `data_dir`.
    pub fn new(data_dir: impl AsRef<Path>, id: &str) -> Self {
        Self {
            path: data_dir.as_ref().join(format!("cutover-{}.json", id)),
        }
    }

    /// Create with an explicit file path.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `record`, replacing the previous one.
    pub async fn save(&self, record: &CutoverRecord) -> Result<(), StateStoreError> {
        let content = serde_json::to_vec_pretty(record)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write atomically via a temp file + rename
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &content).await?;
        fs::rename(&tmp, &self.path).await?;

        debug!(id = %record.id, state = %record.state, "persisted cutover state");
        Ok(())
    }

    /// Load the persisted record, if any.
    pub async fn load(&self) -> Result<Option<CutoverRecord>, StateStoreError> {
        match fs::read(&self.path).await {
            Ok(content) => {
                let record: CutoverRecord = serde_json::from_slice(&content)?;
                debug!(id = %record.id, state = %record.state, "loaded cutover state");
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                error!(error = %e, path = %self.path.display(), "failed to read cutover state");
                Err(StateStoreError::Io(e))
            }
        }
    }

    /// Remove the state file.
    pub async fn remove(&self) -> Result<(), StateStoreError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateStoreError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::state::{CutoverState, Transition};
    use chrono::Utc;

    fn record() -> CutoverRecord {
        let now = Utc::now();
        let mut record = CutoverRecord::new("m1", vec!["users".into(), "orders".into()], now);
        record.state = CutoverState::Syncing;
        record.history.push(Transition {
            from: CutoverState::Preparing,
            to: CutoverState::Syncing,
            reason: "schema version 3 applied".into(),
            at: now,
        });
        record
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let store = CutoverStateStore::new(dir.path(), "m1");

        let record = record();
        store.save(&record).await.expect("save");
        let loaded = store.load().await.expect("load").expect("some");
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let store = CutoverStateStore::new(dir.path(), "missing");
        assert!(store.load().await.expect("load").is_none());
    }

    #[tokio::test]
    async fn test_save_overwrites_previous() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let store = CutoverStateStore::new(dir.path(), "m1");

        let mut record = record();
        store.save(&record).await.expect("save");
        record.state = CutoverState::Verifying;
        store.save(&record).await.expect("save");

        let loaded = store.load().await.expect("load").expect("some");
        assert_eq!(loaded.state, CutoverState::Verifying);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("cutover-m1.json");
        tokio::fs::write(&path, b"{ not json").await.expect("write");

        let store = CutoverStateStore::with_path(&path);
        assert!(matches!(store.load().await, Err(StateStoreError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let store = CutoverStateStore::new(dir.path(), "m1");
        store.save(&record()).await.expect("save");
        store.remove().await.expect("remove");
        assert!(store.load().await.expect("load").is_none());
        store.remove().await.expect("remove twice");
    }
}
