//! File-system disk implementation.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{PartIndexError, Result};
use crate::storage::DiskConfig;
use crate::storage::traits::Disk;

/// A disk rooted at a local directory.
#[derive(Debug)]
pub struct LocalDisk {
    /// The root directory (the table directory).
    root: PathBuf,
    /// Disk configuration.
    config: DiskConfig,
}

impl LocalDisk {
    /// Create a disk rooted at `root`, creating the directory if needed.
    pub fn new<P: AsRef<Path>>(root: P, config: DiskConfig) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.exists() {
            fs::create_dir_all(&root)
                .map_err(|e| PartIndexError::storage(format!("Failed to create directory: {e}")))?;
        }

        if !root.is_dir() {
            return Err(PartIndexError::storage(format!(
                "Path is not a directory: {}",
                root.display()
            )));
        }

        Ok(LocalDisk { root, config })
    }

    fn path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn sync_parent(&self, path: &Path) -> Result<()> {
        if !self.config.sync_writes {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            File::open(parent)?.sync_all()?;
        }
        Ok(())
    }
}

impl Disk for LocalDisk {
    fn root(&self) -> &Path {
        &self.root
    }

    fn exists(&self, path: &str) -> bool {
        self.path(path).exists()
    }

    fn is_directory(&self, path: &str) -> bool {
        self.path(path).is_dir()
    }

    fn create_directories(&self, path: &str) -> Result<()> {
        fs::create_dir_all(self.path(path))?;
        Ok(())
    }

    fn list_directory(&self, path: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.path(path))? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.path(path))?)
    }

    fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let full = self.path(path);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&full)?;
        let mut writer = BufWriter::with_capacity(self.config.buffer_size, file);
        writer.write_all(data)?;
        writer.flush()?;
        if self.config.sync_writes {
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    fn write_file_atomic(&self, path: &str, data: &[u8]) -> Result<()> {
        let full = self.path(path);
        let file_name = full
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PartIndexError::storage(format!("Invalid file path: {path}")))?;
        let tmp = full.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::with_capacity(self.config.buffer_size, file);
            writer.write_all(data)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        if let Err(e) = fs::rename(&tmp, &full) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        self.sync_parent(&full)
    }

    fn file_size(&self, path: &str) -> Result<u64> {
        Ok(fs::metadata(self.path(path))?.len())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let to_path = self.path(to);
        fs::rename(self.path(from), &to_path)?;
        self.sync_parent(&to_path)
    }

    fn copy_file(&self, from: &str, to: &str) -> Result<()> {
        fs::copy(self.path(from), self.path(to))?;
        Ok(())
    }

    fn remove_file(&self, path: &str) -> Result<()> {
        fs::remove_file(self.path(path))?;
        Ok(())
    }

    fn remove_recursive(&self, path: &str) -> Result<()> {
        let full = self.path(path);
        match fs::metadata(&full) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&full)?,
            Ok(_) => fs::remove_file(&full)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn sync_directory(&self, path: &str) -> Result<()> {
        if self.config.sync_writes {
            File::open(self.path(path))?.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn disk() -> (TempDir, LocalDisk) {
        let dir = TempDir::new().unwrap();
        let disk = LocalDisk::new(dir.path(), DiskConfig::default()).unwrap();
        (dir, disk)
    }

    #[test]
    fn test_write_and_read() {
        let (_dir, disk) = disk();
        disk.create_directories("p/sub").unwrap();
        disk.write_file("p/sub/a.bin", b"hello").unwrap();

        assert_eq!(disk.read_file("p/sub/a.bin").unwrap(), b"hello");
        assert_eq!(disk.file_size("p/sub/a.bin").unwrap(), 5);
        assert_eq!(disk.list_directory("p/sub").unwrap(), vec!["a.bin"]);
    }

    #[test]
    fn test_atomic_write_replaces_content() {
        let (_dir, disk) = disk();
        disk.write_file_atomic("m.json", b"old").unwrap();
        disk.write_file_atomic("m.json", b"new").unwrap();

        assert_eq!(disk.read_file("m.json").unwrap(), b"new");
        // No temporary files left behind.
        assert_eq!(disk.list_directory("").unwrap(), vec!["m.json"]);
    }

    #[test]
    fn test_rename_missing_source_is_not_found() {
        let (_dir, disk) = disk();
        let err = disk.rename("missing", "other").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_remove_recursive_missing_is_ok() {
        let (_dir, disk) = disk();
        disk.remove_recursive("nothing/here").unwrap();
        disk.create_directories("a/b").unwrap();
        disk.write_file("a/b/c", b"x").unwrap();
        disk.remove_recursive("a").unwrap();
        assert!(!disk.exists("a"));
    }
}
