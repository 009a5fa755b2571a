//! Atomic installation of built index files.
//!
//! A build writes into a scratch directory outside every part. Installing it
//! runs while the registry pins the destination part, so it stays active:
//!
//! 1. rows deleted since the build started are written next to the index as
//!    `deleted_rows.bin`;
//! 2. `index.meta` is written into the scratch directory;
//! 3. whatever already sits at `vector_index/<index>/` (legacy row-id maps,
//!    leftovers of an interrupted install) is moved aside;
//! 4. the scratch directory is renamed to `vector_index/<index>/` and the
//!    rename is synced;
//! 5. the part's checksum manifest is rewritten atomically, listing the new
//!    files. Only from this point on is the index considered built.
//!
//! A part that is no longer active, or whose directory disappears while the
//! files are moved, yields [`InstallOutcome::PartSuperseded`] and leaves the
//! part untouched.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PartIndexError, Result};
use crate::gate::BuildPermit;
use crate::library::BuildOutput;
use crate::metadata::{VectorIndexDescription, VectorIndexKind};
use crate::part::{DELETED_ROWS_FILE, DataPart, INDEX_META_FILE, PartRegistryPtr, RowMask};
use crate::storage::{Disk, join_path};

/// Contents of `index.meta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub name: String,
    pub kind: VectorIndexKind,
    pub column: String,
    pub dimension: usize,
    pub params: BTreeMap<String, String>,
    pub part_name: String,
    pub rows: usize,
    pub deleted_rows: usize,
    pub library: String,
    pub built_at: DateTime<Utc>,
    pub files: Vec<String>,
}

/// Result of one install attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The index is in place. Holds the manifest entries that were written.
    Installed { files: Vec<String> },
    /// The destination part was replaced; nothing durable was changed.
    PartSuperseded,
}

/// What to install where.
#[derive(Debug)]
pub struct InstallRequest<'a> {
    /// Scratch directory holding the build output, relative to the disk root.
    pub scratch_dir: &'a str,
    pub part: &'a DataPart,
    pub description: &'a VectorIndexDescription,
    pub output: &'a BuildOutput,
    pub library_name: &'a str,
}

/// Moves build output into parts.
#[derive(Debug, Clone)]
pub struct AtomicInstaller {
    registry: PartRegistryPtr,
}

impl AtomicInstaller {
    pub fn new(registry: PartRegistryPtr) -> Self {
        AtomicInstaller { registry }
    }

    /// Install `request.output` into `request.part`.
    ///
    /// Storage failures are returned as errors; a revoked permit fails with a
    /// cancellation error before anything is moved.
    pub fn install(&self, request: &InstallRequest<'_>, permit: &BuildPermit) -> Result<InstallOutcome> {
        let disk = self.registry.disk();
        let disk = disk.as_ref();
        let part = request.part;

        permit.check()?;
        for file in &request.output.files {
            if !disk.exists(&join_path(request.scratch_dir, file)) {
                return Err(PartIndexError::storage(format!(
                    "build output file {file} missing from {}",
                    request.scratch_dir
                )));
            }
        }

        let mut outcome = InstallOutcome::PartSuperseded;
        let active = self.registry.with_active_part(part, &mut || {
            outcome = self.install_locked(disk, request, permit)?;
            Ok(())
        })?;
        if !active {
            debug!(
                "part {} was superseded before vector index {} could be installed",
                part.name, request.description.name
            );
            return Ok(InstallOutcome::PartSuperseded);
        }
        if let InstallOutcome::Installed { files } = &outcome {
            info!(
                "installed vector index {} on part {} ({} files)",
                request.description.name,
                part.name,
                files.len()
            );
        }
        Ok(outcome)
    }

    /// Runs with the part pinned active and its file lock held.
    fn install_locked(
        &self,
        disk: &dyn Disk,
        request: &InstallRequest<'_>,
        permit: &BuildPermit,
    ) -> Result<InstallOutcome> {
        let part = request.part;
        let description = request.description;
        if !disk.is_directory(&part.relative_path) {
            return Ok(InstallOutcome::PartSuperseded);
        }

        let mut files = request.output.files.clone();

        // Deletions that landed while the index was being built.
        let mask = self.registry.deleted_rows(part)?;
        let deleted_rows = mask.as_ref().map_or(0, RowMask::deleted_count);
        let scratch_mask = join_path(request.scratch_dir, DELETED_ROWS_FILE);
        match mask {
            Some(mask) if mask.deleted_count() > 0 => {
                if mask.rows() != request.output.indexed_rows {
                    return Err(PartIndexError::storage(format!(
                        "delete bitmap of part {} covers {} rows, index has {}",
                        part.name,
                        mask.rows(),
                        request.output.indexed_rows
                    )));
                }
                disk.write_file(&scratch_mask, &mask.encode()?)?;
                files.push(DELETED_ROWS_FILE.to_string());
            }
            _ => disk.remove_recursive(&scratch_mask)?,
        }

        let meta = IndexMeta {
            name: description.name.clone(),
            kind: description.kind,
            column: description.column.clone(),
            dimension: description.dimension,
            params: description.params.clone(),
            part_name: part.name.clone(),
            rows: request.output.indexed_rows,
            deleted_rows,
            library: request.library_name.to_string(),
            built_at: Utc::now(),
            files: files.clone(),
        };
        disk.write_file(
            &join_path(request.scratch_dir, INDEX_META_FILE),
            &serde_json::to_vec_pretty(&meta)?,
        )?;
        files.push(INDEX_META_FILE.to_string());

        permit.check()?;

        let index_dir = DataPart::vector_index_dir(&description.name);
        let target = part.path_of(&index_dir);
        let parent = part.path_of(crate::part::VECTOR_INDEX_DIR);
        disk.create_directories(&parent)?;

        let replaced = if disk.exists(&target) {
            let aside = format!("{}.replaced-{}", request.scratch_dir, Uuid::new_v4());
            disk.rename(&target, &aside)?;
            Some(aside)
        } else {
            None
        };

        if let Err(e) = disk.rename(request.scratch_dir, &target) {
            if let Some(aside) = &replaced {
                if let Err(restore) = disk.rename(aside, &target) {
                    warn!("cannot restore {target} after failed install: {restore}");
                }
            }
            if e.is_not_found() {
                return Ok(InstallOutcome::PartSuperseded);
            }
            return Err(e);
        }
        disk.sync_directory(&parent)?;

        let keys: Vec<String> = files.iter().map(|f| join_path(&index_dir, f)).collect();
        let mut manifest = part.checksums(disk)?;
        manifest.remove_prefix(&format!("{index_dir}/"));
        manifest.add_files(disk, &part.relative_path, &keys)?;
        manifest.store(disk, &part.relative_path)?;

        if let Some(aside) = replaced {
            if let Err(e) = disk.remove_recursive(&aside) {
                warn!("cannot remove replaced index directory {aside}: {e}");
            }
        }
        Ok(InstallOutcome::Installed { files: keys })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::BuildGate;
    use crate::metadata::{ColumnDescription, TableMetadata};
    use crate::part::{LocalPartRegistry, PartRegistry, VectorColumn, VectorIndexState};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> Arc<LocalPartRegistry> {
        let metadata = TableMetadata::new("t", vec![ColumnDescription::vector("e", 2)])
            .with_vector_index(VectorIndexDescription::new("v1", "e", 2, VectorIndexKind::Flat));
        Arc::new(LocalPartRegistry::create(dir.path(), metadata).unwrap())
    }

    fn column(rows: usize) -> VectorColumn {
        let data: Vec<Vec<f32>> = (0..rows).map(|i| vec![i as f32, 1.0]).collect();
        VectorColumn::from_rows(2, &data).unwrap()
    }

    fn scratch(disk: &dyn Disk, name: &str) -> (String, BuildOutput) {
        let dir = join_path("tmp_vector_index", name);
        disk.create_directories(&dir).unwrap();
        disk.write_file(&join_path(&dir, "data.flat"), b"index bytes").unwrap();
        (
            dir,
            BuildOutput {
                files: vec!["data.flat".to_string()],
                indexed_rows: 4,
            },
        )
    }

    #[test]
    fn test_install_writes_manifest_entries() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let part = registry.insert_part("all", &[("e", column(4))]).unwrap();
        let disk = registry.disk();
        let (scratch_dir, output) = scratch(disk.as_ref(), "a");
        let description = registry.metadata().vector_indices[0].clone();
        let gate = BuildGate::new();
        let permit = gate.acquire_permit().unwrap();

        let installer = AtomicInstaller::new(registry.clone());
        let outcome = installer
            .install(
                &InstallRequest {
                    scratch_dir: &scratch_dir,
                    part: &part,
                    description: &description,
                    output: &output,
                    library_name: "test",
                },
                &permit,
            )
            .unwrap();

        let InstallOutcome::Installed { files } = outcome else {
            panic!("expected install");
        };
        assert_eq!(
            files,
            vec!["vector_index/v1/data.flat", "vector_index/v1/index.meta"]
        );
        let manifest = part.checksums(disk.as_ref()).unwrap();
        for file in &files {
            assert!(manifest.contains(file));
        }
        manifest.check(disk.as_ref(), &part.relative_path).unwrap();
        assert!(!disk.exists(&scratch_dir));
        assert_eq!(
            part.vector_index_state(disk.as_ref(), "v1").unwrap(),
            VectorIndexState::Built
        );

        let meta: IndexMeta = serde_json::from_slice(
            &disk.read_file(&part.path_of("vector_index/v1/index.meta")).unwrap(),
        )
        .unwrap();
        assert_eq!(meta.rows, 4);
        assert_eq!(meta.library, "test");
    }

    #[test]
    fn test_superseded_part_is_untouched() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let p1 = registry.insert_part("all", &[("e", column(4))]).unwrap();
        let p2 = registry.insert_part("all", &[("e", column(1))]).unwrap();
        let disk = registry.disk();
        let before = disk.list_directory(&p1.relative_path).unwrap();
        let manifest_before = p1.checksums(disk.as_ref()).unwrap();

        registry.merge_parts(&[&p1.name, &p2.name]).unwrap();

        let (scratch_dir, output) = scratch(disk.as_ref(), "b");
        let description = registry.metadata().vector_indices[0].clone();
        let gate = BuildGate::new();
        let permit = gate.acquire_permit().unwrap();
        let outcome = AtomicInstaller::new(registry.clone())
            .install(
                &InstallRequest {
                    scratch_dir: &scratch_dir,
                    part: &p1,
                    description: &description,
                    output: &output,
                    library_name: "test",
                },
                &permit,
            )
            .unwrap();

        assert_eq!(outcome, InstallOutcome::PartSuperseded);
        assert_eq!(disk.list_directory(&p1.relative_path).unwrap(), before);
        assert_eq!(p1.checksums(disk.as_ref()).unwrap(), manifest_before);
        assert!(disk.exists(&scratch_dir));
    }

    #[test]
    fn test_deleted_rows_are_applied() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let part = registry.insert_part("all", &[("e", column(4))]).unwrap();
        registry.lightweight_delete(&part.name, &[2]).unwrap();
        let disk = registry.disk();
        let (scratch_dir, output) = scratch(disk.as_ref(), "c");
        let description = registry.metadata().vector_indices[0].clone();
        let gate = BuildGate::new();
        let permit = gate.acquire_permit().unwrap();

        AtomicInstaller::new(registry.clone())
            .install(
                &InstallRequest {
                    scratch_dir: &scratch_dir,
                    part: &part,
                    description: &description,
                    output: &output,
                    library_name: "test",
                },
                &permit,
            )
            .unwrap();

        let bytes = disk
            .read_file(&part.path_of("vector_index/v1/deleted_rows.bin"))
            .unwrap();
        let mask = RowMask::decode(&bytes).unwrap();
        assert!(mask.is_deleted(2));
        assert_eq!(mask.deleted_count(), 1);
        assert!(
            part.checksums(disk.as_ref())
                .unwrap()
                .contains("vector_index/v1/deleted_rows.bin")
        );
    }

    #[test]
    fn test_cancelled_permit_moves_nothing() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let part = registry.insert_part("all", &[("e", column(4))]).unwrap();
        let disk = registry.disk();
        let (scratch_dir, output) = scratch(disk.as_ref(), "d");
        let description = registry.metadata().vector_indices[0].clone();
        let gate = BuildGate::new();
        let permit = gate.acquire_permit().unwrap();
        let _block = gate.request_block();

        let err = AtomicInstaller::new(registry.clone())
            .install(
                &InstallRequest {
                    scratch_dir: &scratch_dir,
                    part: &part,
                    description: &description,
                    output: &output,
                    library_name: "test",
                },
                &permit,
            )
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(!disk.exists(&part.path_of("vector_index/v1")));
    }
}
