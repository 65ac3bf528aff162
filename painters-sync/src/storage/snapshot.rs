//! Snapshot file load/save.

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Snapshot not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("Snapshot is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One canvas snapshot file of a fixed size.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
    expected_len: usize,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>, expected_len: usize) -> Self {
        Self {
            path: path.into(),
            expected_len,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn expected_len(&self) -> usize {
        self.expected_len
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Read the snapshot. A missing file is `NotFound`; a file of the wrong
    /// length is rejected rather than partially applied.
    pub fn load(&self) -> Result<Vec<u8>, StoreError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(self.path.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        if bytes.len() != self.expected_len {
            return Err(StoreError::SizeMismatch {
                expected: self.expected_len,
                actual: bytes.len(),
            });
        }
        Ok(bytes)
    }

    /// Replace the snapshot atomically: write a sibling temp file, flush it,
    /// then rename it over the old one.
    pub fn save(&self, bytes: &[u8]) -> Result<(), StoreError> {
        if bytes.len() != self.expected_len {
            return Err(StoreError::SizeMismatch {
                expected: self.expected_len,
                actual: bytes.len(),
            });
        }
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| StoreError::Io(e.error))?;

        log::debug!("Wrote {} byte snapshot to {}", bytes.len(), self.path.display());
        Ok(())
    }
}
