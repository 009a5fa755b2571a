//! Removal of index files whose index definition was dropped.

use std::collections::BTreeSet;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::claims::BuildClaims;
use crate::error::Result;
use crate::metadata::StorageMetadataPtr;
use crate::part::{DataPart, PartRegistryPtr};
use crate::storage::{Disk, join_path};

/// What one reaper pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapReport {
    pub parts_scanned: usize,
    /// (part name, index name) pairs that were removed.
    pub removed_indices: Vec<(String, String)>,
    /// Files removed from disk or from checksum manifests.
    pub removed_files: usize,
    /// Pairs left alone because a build holds them.
    pub skipped_claimed: usize,
}

/// Deletes stale vector index files from parts.
#[derive(Debug, Clone)]
pub struct StaleIndexReaper {
    registry: PartRegistryPtr,
    claims: BuildClaims,
}

impl StaleIndexReaper {
    pub fn new(registry: PartRegistryPtr, claims: BuildClaims) -> Self {
        StaleIndexReaper { registry, claims }
    }

    /// Remove every index present on a part but absent from `metadata`.
    ///
    /// Each pair is claimed while it is removed, so a build of the same pair
    /// never runs concurrently; pairs claimed by a build are skipped and
    /// picked up by a later pass.
    pub fn reap(&self, metadata: &StorageMetadataPtr) -> Result<ReapReport> {
        let disk = self.registry.disk();
        let mut parts = self.registry.data_parts();
        parts.sort_by(|a, b| a.name.cmp(&b.name));

        let mut report = ReapReport::default();
        for part in parts {
            report.parts_scanned += 1;
            for index_name in part.vector_index_names(disk.as_ref())? {
                if metadata.has_vector_index(&index_name) {
                    continue;
                }
                let Some(_claim) = self.claims.try_claim(&part.name, &index_name) else {
                    debug!(
                        "vector index {index_name} on part {} is being built, not removing it",
                        part.name
                    );
                    report.skipped_claimed += 1;
                    continue;
                };

                let mut removed = 0;
                self.registry.with_active_part(&part, &mut || {
                    removed = remove_index(disk.as_ref(), &part, &index_name)?;
                    Ok(())
                })?;
                if removed > 0 {
                    debug!(
                        "removed {removed} files of dropped vector index {index_name} from part {}",
                        part.name
                    );
                    report.removed_files += removed;
                    report.removed_indices.push((part.name.clone(), index_name));
                }
            }
        }

        if !report.removed_indices.is_empty() {
            info!(
                "removed {} dropped vector indices ({} files) from table '{}'",
                report.removed_indices.len(),
                report.removed_files,
                metadata.table
            );
        }
        Ok(report)
    }
}

/// Remove the directory and manifest entries of one index. Returns the
/// number of distinct files removed.
fn remove_index(disk: &dyn Disk, part: &DataPart, index_name: &str) -> Result<usize> {
    let index_dir = DataPart::vector_index_dir(index_name);
    let mut files = BTreeSet::new();

    let full_dir = part.path_of(&index_dir);
    if disk.is_directory(&full_dir) {
        collect_files(disk, &full_dir, &index_dir, &mut files)?;
        disk.remove_recursive(&full_dir)?;
    }

    let mut manifest = part.checksums(disk)?;
    let listed = manifest.remove_prefix(&format!("{index_dir}/"));
    if !listed.is_empty() {
        manifest.store(disk, &part.relative_path)?;
        files.extend(listed);
    }
    Ok(files.len())
}

fn collect_files(disk: &dyn Disk, dir: &str, relative: &str, out: &mut BTreeSet<String>) -> Result<()> {
    for entry in disk.list_directory(dir)? {
        let path = join_path(dir, &entry);
        let key = join_path(relative, &entry);
        if disk.is_directory(&path) {
            collect_files(disk, &path, &key, out)?;
        } else {
            out.insert(key);
        }
    }
    Ok(())
}
