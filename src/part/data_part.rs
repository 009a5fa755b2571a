//! Data part handles and their vector index inventory.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::checksums::ChecksumManifest;
use crate::error::{PartIndexError, Result};
use crate::part::column::VectorColumn;
use crate::part::info::PartInfo;
use crate::part::{
    COLUMN_FILE_EXTENSION, INDEX_META_FILE, ROW_IDS_MAP_SUFFIX, VECTOR_INDEX_DIR,
};
use crate::storage::{Disk, join_path};

/// Shared handle to a part.
pub type DataPartPtr = Arc<DataPart>;

/// Process-unique identity of a part object. A part replaced by a merge or a
/// mutation gets a new id even if it reuses a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartId(pub u64);

impl fmt::Display for PartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// State of one vector index on one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorIndexState {
    /// Nothing on disk.
    Missing,
    /// Complete and listed in the part's checksum manifest.
    Built,
    /// Only legacy row-id maps inherited from merged source parts.
    Decoupled,
}

impl VectorIndexState {
    pub fn is_built(&self) -> bool {
        matches!(self, VectorIndexState::Built)
    }
}

/// An immutable storage part.
#[derive(Debug)]
pub struct DataPart {
    pub id: PartId,
    pub name: String,
    pub info: PartInfo,
    pub rows_count: u64,
    /// Directory of the part relative to the disk root.
    pub relative_path: String,
    /// Serializes writers of this part's index files and checksum manifest.
    files_lock: Mutex<()>,
}

impl DataPart {
    pub fn new(id: PartId, info: PartInfo, rows_count: u64) -> Self {
        let name = info.name();
        DataPart {
            id,
            relative_path: name.clone(),
            name,
            info,
            rows_count,
            files_lock: Mutex::new(()),
        }
    }

    /// Lock held while index files or the manifest of this part change.
    pub fn lock_files(&self) -> MutexGuard<'_, ()> {
        self.files_lock.lock()
    }

    pub fn path_of(&self, file: &str) -> String {
        join_path(&self.relative_path, file)
    }

    pub fn column_file_name(column: &str) -> String {
        format!("{column}.{COLUMN_FILE_EXTENSION}")
    }

    /// Directory of `index_name` relative to the part directory.
    pub fn vector_index_dir(index_name: &str) -> String {
        join_path(VECTOR_INDEX_DIR, index_name)
    }

    /// Manifest key of the marker file of a complete index.
    pub fn vector_index_meta_file(index_name: &str) -> String {
        join_path(&Self::vector_index_dir(index_name), INDEX_META_FILE)
    }

    pub fn checksums(&self, disk: &dyn Disk) -> Result<ChecksumManifest> {
        ChecksumManifest::load(disk, &self.relative_path)
    }

    pub fn read_vector_column(&self, disk: &dyn Disk, column: &str) -> Result<VectorColumn> {
        let path = self.path_of(&Self::column_file_name(column));
        let bytes = disk.read_file(&path).map_err(|e| {
            PartIndexError::part(format!("cannot read column '{column}' of part {}: {e}", self.name))
        })?;
        let data = VectorColumn::decode(&bytes)?;
        if data.rows() as u64 != self.rows_count {
            return Err(PartIndexError::part(format!(
                "column '{column}' of part {} has {} rows, part has {}",
                self.name,
                data.rows(),
                self.rows_count
            )));
        }
        Ok(data)
    }

    pub fn vector_index_state(&self, disk: &dyn Disk, index_name: &str) -> Result<VectorIndexState> {
        let manifest = self.checksums(disk)?;
        if manifest.contains(&Self::vector_index_meta_file(index_name)) {
            return Ok(VectorIndexState::Built);
        }
        if self.contains_row_ids_maps(disk, index_name) {
            return Ok(VectorIndexState::Decoupled);
        }
        Ok(VectorIndexState::Missing)
    }

    /// True if the index directory holds row-id maps from merged parts.
    pub fn contains_row_ids_maps(&self, disk: &dyn Disk, index_name: &str) -> bool {
        let dir = self.path_of(&Self::vector_index_dir(index_name));
        match disk.list_directory(&dir) {
            Ok(files) => files.iter().any(|f| f.ends_with(ROW_IDS_MAP_SUFFIX)),
            Err(_) => false,
        }
    }

    /// Every index name with files or manifest entries on this part.
    pub fn vector_index_names(&self, disk: &dyn Disk) -> Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();

        let root = self.path_of(VECTOR_INDEX_DIR);
        if disk.is_directory(&root) {
            names.extend(disk.list_directory(&root)?);
        }

        let prefix = format!("{VECTOR_INDEX_DIR}/");
        let manifest = self.checksums(disk)?;
        for file in manifest.files_with_prefix(&prefix) {
            if let Some(name) = file[prefix.len()..].split('/').next() {
                names.insert(name.to_string());
            }
        }
        Ok(names)
    }
}

impl fmt::Display for DataPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Contents of `part.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PartFileInfo {
    pub name: String,
    pub rows_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksums::FileChecksum;
    use crate::storage::DiskConfig;
    use crate::storage::file::LocalDisk;
    use tempfile::TempDir;

    #[test]
    fn test_index_states() {
        let dir = TempDir::new().unwrap();
        let disk = LocalDisk::new(dir.path(), DiskConfig::default()).unwrap();
        let part = DataPart::new(PartId(1), PartInfo::new("all", 1, 1, 0), 3);
        disk.create_directories("all_1_1_0/vector_index/legacy").unwrap();
        disk.create_directories("all_1_1_0/vector_index/built").unwrap();
        disk.write_file("all_1_1_0/vector_index/legacy/merged-all_1_1_0-row_ids_map.bin", b"")
            .unwrap();

        let mut manifest = ChecksumManifest::new();
        manifest.insert("vector_index/built/index.meta", FileChecksum::of(b"{}"));
        manifest.store(&disk, "all_1_1_0").unwrap();

        assert_eq!(part.vector_index_state(&disk, "built").unwrap(), VectorIndexState::Built);
        assert_eq!(
            part.vector_index_state(&disk, "legacy").unwrap(),
            VectorIndexState::Decoupled
        );
        assert_eq!(part.vector_index_state(&disk, "none").unwrap(), VectorIndexState::Missing);

        let names: Vec<String> = part.vector_index_names(&disk).unwrap().into_iter().collect();
        assert_eq!(names, vec!["built", "legacy"]);
    }
}
