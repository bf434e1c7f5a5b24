//! On-disk storage layout.
//!
//! A configurable base directory with `downloads/` for completed files,
//! `incomplete/` for partial chunk data, and the SQLite database file.
//! Chunks are partitioned into subdirectories by the first two hex
//! characters of the file hash:
//!
//! ```text
//! <base>/incomplete/ab/<file_hash>.chunk.000042
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct StorageLayout {
    base_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.base_dir.join("downloads")
    }

    pub fn incomplete_dir(&self) -> PathBuf {
        self.base_dir.join("incomplete")
    }

    pub fn database_path(&self) -> PathBuf {
        self.base_dir.join("hypershare.db")
    }

    pub fn identity_key_path(&self) -> PathBuf {
        self.base_dir.join("identity.key")
    }

    /// Destination path for a completed download.
    pub fn download_path(&self, filename: &str) -> PathBuf {
        self.downloads_dir().join(filename)
    }

    /// Path of one chunk of a partially downloaded file.
    pub fn incomplete_chunk_path(&self, file_hash: &str, chunk_index: u32) -> PathBuf {
        chunk_path(&self.incomplete_dir(), file_hash, chunk_index)
    }

    /// Create the directory tree. Idempotent.
    pub fn create_directories(&self) -> io::Result<()> {
        fs::create_dir_all(&self.base_dir)?;
        fs::create_dir_all(self.downloads_dir())?;
        fs::create_dir_all(self.incomplete_dir())?;
        Ok(())
    }
}

/// `base / first_two_hex_chars / "<file_hash>.chunk.NNNNNN"`.
pub fn chunk_path(base: &Path, file_hash: &str, chunk_index: u32) -> PathBuf {
    let subdir = if file_hash.len() >= 2 {
        &file_hash[..2]
    } else {
        file_hash
    };
    base.join(subdir)
        .join(format!("{}.chunk.{:06}", file_hash, chunk_index))
}
