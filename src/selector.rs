//! Candidate selection.
//!
//! Picks the next (part, index) pair that still needs an index. Parts taking
//! part in a merge or mutation are never selected, and neither are pairs that
//! another build has claimed. Among eligible parts the oldest (lowest block
//! number) wins, with the partition id and the part name as tie-breaks, so
//! selection is deterministic for a given registry state.

use std::collections::BTreeSet;

use log::{debug, warn};

use crate::admission::BuildMode;
use crate::claims::BuildClaims;
use crate::config::SettingsHandle;
use crate::metadata::{StorageMetadataPtr, VectorIndexDescription};
use crate::part::{DataPart, DataPartPtr, PartRegistryPtr, VectorIndexState};

/// A part and an index to build on it.
#[derive(Debug, Clone)]
pub struct BuildTask {
    pub part: DataPartPtr,
    pub index: VectorIndexDescription,
    pub mode: BuildMode,
}

/// Chooses parts that lack a vector index.
#[derive(Debug, Clone)]
pub struct CandidateSelector {
    registry: PartRegistryPtr,
    settings: SettingsHandle,
    claims: BuildClaims,
}

impl CandidateSelector {
    pub fn new(registry: PartRegistryPtr, settings: SettingsHandle, claims: BuildClaims) -> Self {
        CandidateSelector {
            registry,
            settings,
            claims,
        }
    }

    /// Small parts and parts still carrying legacy row-id maps for the index
    /// are slow-mode work.
    pub fn is_slow_mode_part(&self, part: &DataPart, index_name: &str) -> bool {
        let disk = self.registry.disk();
        part.contains_row_ids_maps(disk.as_ref(), index_name)
            || part.rows_count
                < self
                    .settings
                    .load()
                    .max_rows_for_slow_mode_single_vector_index_build
    }

    pub fn classify(&self, part: &DataPart, index_name: &str) -> BuildMode {
        BuildMode::from_slow_flag(self.is_slow_mode_part(part, index_name))
    }

    /// Select the oldest eligible (part, index) pair of the requested mode.
    pub fn select(
        &self,
        metadata: &StorageMetadataPtr,
        select_slow_mode_part: bool,
        excluded_parts: &BTreeSet<String>,
    ) -> Option<BuildTask> {
        self.select_with(metadata, select_slow_mode_part, excluded_parts, |_, _| false)
    }

    /// Like [`select`](Self::select), also skipping pairs for which `skip`
    /// returns true.
    pub fn select_with<F>(
        &self,
        metadata: &StorageMetadataPtr,
        select_slow_mode_part: bool,
        excluded_parts: &BTreeSet<String>,
        skip: F,
    ) -> Option<BuildTask>
    where
        F: Fn(&DataPart, &VectorIndexDescription) -> bool,
    {
        if metadata.vector_indices.is_empty() {
            return None;
        }

        let disk = self.registry.disk();
        let busy = self.registry.currently_merging_mutating_parts();
        let min_rows = self.settings.load().min_rows_to_build_vector_index;

        let mut parts = self.registry.data_parts();
        parts.sort_by(|a, b| a.info.cmp(&b.info).then_with(|| a.name.cmp(&b.name)));

        for part in parts {
            if excluded_parts.contains(&part.name) || busy.contains(&part.name) {
                continue;
            }
            if part.rows_count < min_rows {
                continue;
            }

            for description in &metadata.vector_indices {
                if self.claims.is_claimed(&part.name, &description.name) || skip(part.as_ref(), description) {
                    continue;
                }
                let state = match part.vector_index_state(disk.as_ref(), &description.name) {
                    Ok(state) => state,
                    Err(e) => {
                        warn!(
                            "cannot read vector index state of {} on {}: {e}",
                            description.name, part.name
                        );
                        continue;
                    }
                };
                if state == VectorIndexState::Built {
                    continue;
                }

                let mode = self.classify(&part, &description.name);
                if mode.is_slow() != select_slow_mode_part {
                    continue;
                }

                debug!(
                    "selected part {} for vector index {} ({mode} mode)",
                    part.name, description.name
                );
                return Some(BuildTask {
                    part: part.clone(),
                    index: description.clone(),
                    mode,
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuilderSettings;
    use crate::metadata::{ColumnDescription, TableMetadata, VectorIndexKind};
    use crate::part::{LocalPartRegistry, PartRegistry, VectorColumn};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn column(rows: usize) -> VectorColumn {
        let data: Vec<Vec<f32>> = (0..rows).map(|i| vec![i as f32 + 1.0, 1.0]).collect();
        VectorColumn::from_rows(2, &data).unwrap()
    }

    fn setup(dir: &TempDir, threshold: u64) -> (Arc<LocalPartRegistry>, CandidateSelector) {
        let metadata = TableMetadata::new("t", vec![ColumnDescription::vector("e", 2)])
            .with_vector_index(VectorIndexDescription::new("v1", "e", 2, VectorIndexKind::Flat))
            .with_vector_index(VectorIndexDescription::new("v2", "e", 2, VectorIndexKind::Flat));
        let registry = Arc::new(LocalPartRegistry::create(dir.path(), metadata).unwrap());
        let settings = SettingsHandle::new(BuilderSettings {
            max_rows_for_slow_mode_single_vector_index_build: threshold,
            ..Default::default()
        });
        let selector = CandidateSelector::new(registry.clone(), settings, BuildClaims::new());
        (registry, selector)
    }

    #[test]
    fn test_oldest_first_and_deterministic() {
        let dir = TempDir::new().unwrap();
        let (registry, selector) = setup(&dir, 0);
        registry.insert_part("all", &[("e", column(3))]).unwrap();
        registry.insert_part("all", &[("e", column(3))]).unwrap();
        let metadata = registry.metadata();

        let first = selector.select(&metadata, false, &BTreeSet::new()).unwrap();
        let again = selector.select(&metadata, false, &BTreeSet::new()).unwrap();
        assert_eq!(first.part.name, "all_1_1_0");
        assert_eq!(first.index.name, "v1");
        assert_eq!(again.part.id, first.part.id);
        assert_eq!(again.index.name, first.index.name);
    }

    #[test]
    fn test_excluded_and_merging_parts_are_skipped() {
        let dir = TempDir::new().unwrap();
        let (registry, selector) = setup(&dir, 0);
        let p1 = registry.insert_part("all", &[("e", column(3))]).unwrap();
        let p2 = registry.insert_part("all", &[("e", column(3))]).unwrap();
        let p3 = registry.insert_part("all", &[("e", column(3))]).unwrap();
        let metadata = registry.metadata();

        registry.begin_merge(&[&p2.name]).unwrap();
        let excluded: BTreeSet<String> = [p1.name.clone()].into_iter().collect();
        let task = selector.select(&metadata, false, &excluded).unwrap();
        assert_eq!(task.part.name, p3.name);
    }

    #[test]
    fn test_claimed_pairs_move_to_next_index() {
        let dir = TempDir::new().unwrap();
        let (registry, selector) = setup(&dir, 0);
        let p1 = registry.insert_part("all", &[("e", column(3))]).unwrap();
        let metadata = registry.metadata();

        let _claim = selector.claims.try_claim(&p1.name, "v1").unwrap();
        let task = selector.select(&metadata, false, &BTreeSet::new()).unwrap();
        assert_eq!(task.index.name, "v2");
    }

    #[test]
    fn test_mode_classification() {
        let dir = TempDir::new().unwrap();
        let (registry, selector) = setup(&dir, 100);
        let small = registry.insert_part("all", &[("e", column(50))]).unwrap();
        let large = registry.insert_part("all", &[("e", column(500))]).unwrap();
        let metadata = registry.metadata();

        assert_eq!(selector.classify(&small, "v1"), BuildMode::Slow);
        assert_eq!(selector.classify(&large, "v1"), BuildMode::Fast);

        let fast = selector.select(&metadata, false, &BTreeSet::new()).unwrap();
        assert_eq!(fast.part.name, large.name);
        assert_eq!(fast.mode, BuildMode::Fast);
        let slow = selector.select(&metadata, true, &BTreeSet::new()).unwrap();
        assert_eq!(slow.part.name, small.name);
    }

    #[test]
    fn test_no_indices_no_candidates() {
        let dir = TempDir::new().unwrap();
        let (registry, selector) = setup(&dir, 0);
        registry.insert_part("all", &[("e", column(3))]).unwrap();
        let metadata = registry
            .alter_metadata(|m| m.vector_indices.clear())
            .unwrap();
        assert!(selector.select(&metadata, false, &BTreeSet::new()).is_none());
    }
}
