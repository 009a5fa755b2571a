//! Disk abstraction trait.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;

/// Shared handle to a disk.
pub type DiskPtr = Arc<dyn Disk>;

/// A storage backend holding one table: its part directories, scratch
/// directories and metadata.
///
/// Paths are relative to [`Disk::root`] and use `/` as separator. Errors from
/// the underlying file system are returned as [`crate::error::PartIndexError::Io`]
/// so callers can inspect the [`std::io::ErrorKind`].
pub trait Disk: Send + Sync + std::fmt::Debug {
    /// Root directory of this disk.
    fn root(&self) -> &Path;

    /// Absolute path of a relative disk path.
    fn full_path(&self, path: &str) -> PathBuf {
        self.root().join(path)
    }

    /// Check if a file or directory exists.
    fn exists(&self, path: &str) -> bool;

    /// Check if the path is an existing directory.
    fn is_directory(&self, path: &str) -> bool;

    /// Create a directory and all of its parents.
    fn create_directories(&self, path: &str) -> Result<()>;

    /// Names of the entries directly under `path`, sorted.
    fn list_directory(&self, path: &str) -> Result<Vec<String>>;

    /// Read a whole file.
    fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    /// Create or truncate a file and write `data` into it.
    fn write_file(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Write `data` to a sibling temporary file, sync it, and rename it over
    /// `path`. Readers see either the old or the new content.
    fn write_file_atomic(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Size of a file in bytes.
    fn file_size(&self, path: &str) -> Result<u64>;

    /// Rename a file or directory. Fails if `to` is a non-empty directory.
    fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Copy a single file.
    fn copy_file(&self, from: &str, to: &str) -> Result<()>;

    /// Remove a single file.
    fn remove_file(&self, path: &str) -> Result<()>;

    /// Remove a directory tree. Missing paths are not an error.
    fn remove_recursive(&self, path: &str) -> Result<()>;

    /// Flush directory entries of `path` to stable storage.
    fn sync_directory(&self, path: &str) -> Result<()>;
}

/// Join two relative disk paths.
pub fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        return name.to_string();
    }
    if name.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), name.trim_start_matches('/'))
}
