//! The `meta.state` checkpoint: an advisory cache of the transaction log's replayed state,
//! rewritten on every successful flush via [`crate::fs::FileDriver::atomic_write`] so a torn
//! write can never leave it in a half-written state. The transaction log remains the source of
//! truth; if the checkpoint and the log disagree, the log wins and the checkpoint is rebuilt.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::fs::FileDriver;

pub const META_STATE_FILE_NAME: &str = "meta.state";

/// Errors produced while reading or writing `meta.state`.
#[derive(Debug, Snafu)]
pub enum CheckpointError {
    #[snafu(display("checkpoint I/O error: {}", source))]
    Io { source: io::Error },

    #[snafu(display("checkpoint contents are corrupt: {}", reason))]
    Corrupt { reason: String },
}

/// A data file's still-live byte ranges.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileLiveRanges {
    pub file_number: u32,
    pub live_ranges: Vec<(u64, u32)>,
}

/// The cached checkpoint written after every successful commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetaState {
    pub current_write_file: u32,
    pub current_write_position: u64,
    pub current_transaction_id: u64,
    pub live_ranges: Vec<FileLiveRanges>,
}

impl MetaState {
    pub fn empty() -> Self {
        MetaState {
            current_write_file: 0,
            current_write_position: 0,
            current_transaction_id: 0,
            live_ranges: Vec::new(),
        }
    }
}

/// Owns the path to `meta.state` and reads/writes it through a [`FileDriver`].
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(queue_root: &Path) -> Self {
        CheckpointStore {
            path: queue_root.join(META_STATE_FILE_NAME),
        }
    }

    /// Loads the checkpoint, tolerating its absence (a brand-new queue directory).
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Corrupt`] if the file exists but cannot be decoded, or
    /// [`CheckpointError::Io`] for any other I/O failure.
    pub async fn load(&self, driver: &FileDriver) -> Result<Option<MetaState>, CheckpointError> {
        match driver.atomic_read(&self.path).await {
            Ok(bytes) => {
                if bytes.is_empty() {
                    return Ok(None);
                }
                let state = bincode::deserialize(&bytes).map_err(|e| CheckpointError::Corrupt {
                    reason: e.to_string(),
                })?;
                Ok(Some(state))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(CheckpointError::Io { source: err }),
        }
    }

    /// Atomically rewrites the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Io`] if the underlying atomic write fails after retrying.
    pub async fn save(&self, driver: &FileDriver, state: &MetaState) -> Result<(), CheckpointError> {
        let bytes = bincode::serialize(state).expect("MetaState encoding is infallible");
        driver
            .atomic_write(&self.path, &bytes)
            .await
            .context(IoSnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn load_missing_checkpoint_returns_none() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let driver = FileDriver::new();
        let loaded = store.load(&driver).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let driver = FileDriver::new();

        let mut state = MetaState::empty();
        state.current_write_file = 3;
        state.current_write_position = 4096;
        state.current_transaction_id = 7;
        state.live_ranges.push(FileLiveRanges {
            file_number: 0,
            live_ranges: vec![(0, 128), (256, 64)],
        });

        store.save(&driver, &state).await.unwrap();
        let loaded = store.load(&driver).await.unwrap().unwrap();
        assert_eq!(loaded, state);
    }
}
