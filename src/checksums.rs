//! Per-part checksum manifest.
//!
//! Every part directory carries a `checksums.json` listing every file the part
//! owns with its size and CRC32. The manifest is always replaced atomically,
//! so a reader either sees the old file set or the new one. A vector index is
//! only considered present on a part once its files are listed here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{PartIndexError, Result};
use crate::storage::{Disk, join_path};

/// File name of the manifest inside a part directory.
pub const CHECKSUMS_FILE_NAME: &str = "checksums.json";

/// Size and hash of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChecksum {
    pub size: u64,
    pub crc32: u32,
}

impl FileChecksum {
    pub fn of(data: &[u8]) -> Self {
        FileChecksum {
            size: data.len() as u64,
            crc32: crc32fast::hash(data),
        }
    }
}

/// A file whose content does not match the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumMismatch {
    pub file: String,
    pub expected: Option<FileChecksum>,
    pub actual: Option<FileChecksum>,
}

/// Mapping from file name (relative to the part directory) to its checksum.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumManifest {
    pub files: BTreeMap<String, FileChecksum>,
}

impl ChecksumManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the manifest of the part at `part_path`. A missing manifest is
    /// an empty one.
    pub fn load(disk: &dyn Disk, part_path: &str) -> Result<Self> {
        let path = join_path(part_path, CHECKSUMS_FILE_NAME);
        match disk.read_file(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.is_not_found() => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    /// Atomically replace the manifest of the part at `part_path`.
    pub fn store(&self, disk: &dyn Disk, part_path: &str) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        disk.write_file_atomic(&join_path(part_path, CHECKSUMS_FILE_NAME), &bytes)
    }

    /// Hash `files` (relative to `part_path`) and record them.
    pub fn add_files<S: AsRef<str>>(
        &mut self,
        disk: &dyn Disk,
        part_path: &str,
        files: &[S],
    ) -> Result<()> {
        for file in files {
            let file = file.as_ref();
            let data = disk.read_file(&join_path(part_path, file))?;
            self.files.insert(file.to_string(), FileChecksum::of(&data));
        }
        Ok(())
    }

    pub fn insert(&mut self, file: impl Into<String>, checksum: FileChecksum) {
        self.files.insert(file.into(), checksum);
    }

    pub fn get(&self, file: &str) -> Option<&FileChecksum> {
        self.files.get(file)
    }

    pub fn contains(&self, file: &str) -> bool {
        self.files.contains_key(file)
    }

    /// Remove every entry under `prefix` and return the removed names.
    pub fn remove_prefix(&mut self, prefix: &str) -> Vec<String> {
        let removed: Vec<String> = self
            .files
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        for name in &removed {
            self.files.remove(name);
        }
        removed
    }

    /// Names of the entries under `prefix`.
    pub fn files_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.files
            .keys()
            .filter(move |name| name.starts_with(prefix))
            .map(String::as_str)
    }

    /// Compare every listed file against its current content.
    pub fn verify(&self, disk: &dyn Disk, part_path: &str) -> Result<Vec<ChecksumMismatch>> {
        let mut mismatches = Vec::new();
        for (file, expected) in &self.files {
            let actual = match disk.read_file(&join_path(part_path, file)) {
                Ok(data) => Some(FileChecksum::of(&data)),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            };
            if actual.as_ref() != Some(expected) {
                mismatches.push(ChecksumMismatch {
                    file: file.clone(),
                    expected: Some(*expected),
                    actual,
                });
            }
        }
        Ok(mismatches)
    }

    /// Like [`verify`](Self::verify) but fails on the first mismatch.
    pub fn check(&self, disk: &dyn Disk, part_path: &str) -> Result<()> {
        match self.verify(disk, part_path)?.first() {
            None => Ok(()),
            Some(m) => Err(PartIndexError::storage(format!(
                "checksum mismatch for {part_path}/{}: expected {:?}, found {:?}",
                m.file, m.expected, m.actual
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DiskConfig;
    use crate::storage::file::LocalDisk;
    use tempfile::TempDir;

    #[test]
    fn test_missing_manifest_is_empty() {
        let dir = TempDir::new().unwrap();
        let disk = LocalDisk::new(dir.path(), DiskConfig::default()).unwrap();
        disk.create_directories("p").unwrap();

        let manifest = ChecksumManifest::load(&disk, "p").unwrap();
        assert!(manifest.files.is_empty());
    }

    #[test]
    fn test_verify_detects_changes() {
        let dir = TempDir::new().unwrap();
        let disk = LocalDisk::new(dir.path(), DiskConfig::default()).unwrap();
        disk.create_directories("p/vector_index/v1").unwrap();
        disk.write_file("p/a.vec", b"abc").unwrap();
        disk.write_file("p/vector_index/v1/index.meta", b"{}").unwrap();

        let mut manifest = ChecksumManifest::new();
        manifest
            .add_files(&disk, "p", &["a.vec", "vector_index/v1/index.meta"])
            .unwrap();
        manifest.store(&disk, "p").unwrap();

        let loaded = ChecksumManifest::load(&disk, "p").unwrap();
        assert_eq!(loaded, manifest);
        assert!(loaded.verify(&disk, "p").unwrap().is_empty());

        disk.write_file("p/a.vec", b"abd").unwrap();
        let mismatches = loaded.verify(&disk, "p").unwrap();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].file, "a.vec");
        assert!(loaded.check(&disk, "p").is_err());
    }

    #[test]
    fn test_remove_prefix() {
        let mut manifest = ChecksumManifest::new();
        manifest.insert("a.vec", FileChecksum::of(b"a"));
        manifest.insert("vector_index/v1/index.meta", FileChecksum::of(b"b"));
        manifest.insert("vector_index/v10/index.meta", FileChecksum::of(b"c"));

        let removed = manifest.remove_prefix("vector_index/v1/");
        assert_eq!(removed, vec!["vector_index/v1/index.meta".to_string()]);
        assert!(manifest.contains("vector_index/v10/index.meta"));
        assert!(manifest.contains("a.vec"));
    }
}
