//! Directory-backed part registry.
//!
//! Layout of a table directory:
//!
//! ```text
//! <table>/metadata.json
//! <table>/<part name>/part.json
//! <table>/<part name>/<column>.vec
//! <table>/<part name>/deleted_rows.bin          (after lightweight deletes)
//! <table>/<part name>/vector_index/<index>/...  (built or decoupled indices)
//! <table>/<part name>/checksums.json
//! ```
//!
//! New parts are written under a `tmp_*` directory and renamed into place.
//! Parts replaced by merges, mutations or drops become outdated and their
//! directories are removed by [`LocalPartRegistry::clear_old_parts`] once no
//! one holds a reference to them.
//!
//! Index installs pin their destination part instead of holding the registry
//! lock. A pinned part cannot be replaced or dropped; commits touching it
//! wait for the pin to go away, while every other table operation proceeds.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use byteorder::{LittleEndian, WriteBytesExt};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, RwLock, RwLockWriteGuard};

use crate::checksums::{ChecksumManifest, FileChecksum};
use crate::error::{PartIndexError, Result};
use crate::metadata::{ColumnKind, StorageMetadataPtr, TableMetadata};
use crate::part::column::VectorColumn;
use crate::part::data_part::{DataPart, DataPartPtr, PartFileInfo, PartId, VectorIndexState};
use crate::part::info::PartInfo;
use crate::part::mask::RowMask;
use crate::part::registry::PartRegistry;
use crate::part::{DELETED_ROWS_FILE, METADATA_FILE, PART_INFO_FILE, ROW_IDS_MAP_SUFFIX};
use crate::storage::file::LocalDisk;
use crate::storage::{Disk, DiskConfig, DiskPtr, join_path};

#[derive(Debug)]
struct RegistryState {
    metadata: StorageMetadataPtr,
    active: BTreeMap<String, DataPartPtr>,
    merging: BTreeSet<String>,
    outdated: Vec<DataPartPtr>,
    next_block: u64,
}

impl RegistryState {
    fn is_active(&self, part: &DataPart) -> bool {
        self.active.get(&part.name).is_some_and(|p| p.id == part.id)
    }

    fn allocate_block(&mut self) -> u64 {
        let block = self.next_block;
        self.next_block += 1;
        block
    }
}

/// Upper bound of one wait for a pin or a merge to go away. Waits are
/// re-checked after it, so a missed wakeup only costs latency.
const PIN_WAIT_INTERVAL: Duration = Duration::from_millis(50);

/// A table stored in a local directory.
#[derive(Debug)]
pub struct LocalPartRegistry {
    disk: DiskPtr,
    state: RwLock<RegistryState>,
    next_part_id: AtomicU64,
    /// Pin counts of parts being written through `with_active_part`.
    /// Always locked after `state`, never before.
    pins: Mutex<BTreeMap<PartId, usize>>,
    pins_changed: Condvar,
}

/// Keeps a part from being replaced or dropped while alive.
struct PartPin<'a> {
    registry: &'a LocalPartRegistry,
    id: PartId,
}

impl Drop for PartPin<'_> {
    fn drop(&mut self) {
        let mut pins = self.registry.pins.lock();
        if let Some(count) = pins.get_mut(&self.id) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&self.id);
            }
        }
        self.registry.pins_changed.notify_all();
    }
}

impl LocalPartRegistry {
    /// Create a new, empty table at `root`.
    pub fn create<P: AsRef<Path>>(root: P, metadata: TableMetadata) -> Result<Self> {
        let disk: DiskPtr = Arc::new(LocalDisk::new(root, DiskConfig::default())?);
        Self::create_on(disk, metadata)
    }

    /// Create a new, empty table on an existing disk.
    pub fn create_on(disk: DiskPtr, metadata: TableMetadata) -> Result<Self> {
        if disk.exists(METADATA_FILE) {
            return Err(PartIndexError::InvalidOperation(format!(
                "table already exists at {}",
                disk.root().display()
            )));
        }
        disk.write_file_atomic(METADATA_FILE, &serde_json::to_vec_pretty(&metadata)?)?;

        Ok(LocalPartRegistry {
            disk,
            state: RwLock::new(RegistryState {
                metadata: Arc::new(metadata),
                active: BTreeMap::new(),
                merging: BTreeSet::new(),
                outdated: Vec::new(),
                next_block: 1,
            }),
            next_part_id: AtomicU64::new(1),
            pins: Mutex::new(BTreeMap::new()),
            pins_changed: Condvar::new(),
        })
    }

    /// Open an existing table at `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let disk: DiskPtr = Arc::new(LocalDisk::new(root, DiskConfig::default())?);
        Self::open_on(disk)
    }

    /// Open an existing table on `disk`, loading every complete part.
    pub fn open_on(disk: DiskPtr) -> Result<Self> {
        let metadata: TableMetadata = serde_json::from_slice(&disk.read_file(METADATA_FILE)?)?;
        let next_part_id = AtomicU64::new(1);

        let mut loaded: Vec<DataPart> = Vec::new();
        for entry in disk.list_directory("")? {
            if entry.starts_with("tmp") || entry.starts_with('.') || !disk.is_directory(&entry) {
                continue;
            }
            let Ok(info) = PartInfo::parse(&entry) else {
                debug!("skipping non-part directory {entry}");
                continue;
            };
            let info_path = join_path(&entry, PART_INFO_FILE);
            if !disk.exists(&info_path) {
                warn!("skipping incomplete part {entry}: no {PART_INFO_FILE}");
                continue;
            }
            let file_info: PartFileInfo = serde_json::from_slice(&disk.read_file(&info_path)?)?;
            let id = PartId(next_part_id.fetch_add(1, Ordering::SeqCst));
            loaded.push(DataPart::new(id, info, file_info.rows_count));
        }

        let next_block = loaded
            .iter()
            .map(|p| p.info.max_block.max(p.info.mutation) + 1)
            .max()
            .unwrap_or(1);
        let covered: BTreeSet<PartId> = loaded
            .iter()
            .filter(|p| {
                loaded
                    .iter()
                    .any(|other| other.id != p.id && other.info.contains(&p.info))
            })
            .map(|p| p.id)
            .collect();

        let mut active = BTreeMap::new();
        for part in loaded {
            if covered.contains(&part.id) {
                debug!("part {} is covered by another part, not loading it", part.name);
                continue;
            }
            active.insert(part.name.clone(), Arc::new(part));
        }

        info!(
            "opened table '{}' at {} with {} active parts",
            metadata.table,
            disk.root().display(),
            active.len()
        );

        Ok(LocalPartRegistry {
            disk,
            state: RwLock::new(RegistryState {
                metadata: Arc::new(metadata),
                active,
                merging: BTreeSet::new(),
                outdated: Vec::new(),
                next_block,
            }),
            next_part_id,
            pins: Mutex::new(BTreeMap::new()),
            pins_changed: Condvar::new(),
        })
    }

    fn allocate_id(&self) -> PartId {
        PartId(self.next_part_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Pin `part`, first waiting for a merge or mutation involving it to
    /// commit or cancel. `None` once the part is no longer active.
    fn pin_active(&self, part: &DataPart) -> Option<PartPin<'_>> {
        loop {
            let state = self.state.read();
            if !state.is_active(part) {
                return None;
            }
            let mut pins = self.pins.lock();
            if !state.merging.contains(&part.name) {
                *pins.entry(part.id).or_insert(0) += 1;
                return Some(PartPin {
                    registry: self,
                    id: part.id,
                });
            }
            drop(state);
            self.pins_changed.wait_for(&mut pins, PIN_WAIT_INTERVAL);
        }
    }

    /// Write-lock the state once none of the parts named by `ids` is pinned.
    /// New pins cannot be taken while the returned guard is held.
    fn write_unpinned<F>(&self, ids: F) -> RwLockWriteGuard<'_, RegistryState>
    where
        F: Fn(&RegistryState) -> Vec<PartId>,
    {
        loop {
            let state = self.state.write();
            let mut pins = self.pins.lock();
            if !ids(&state).iter().any(|id| pins.contains_key(id)) {
                return state;
            }
            drop(state);
            self.pins_changed.wait_for(&mut pins, PIN_WAIT_INTERVAL);
        }
    }

    fn notify_pin_waiters(&self) {
        let _pins = self.pins.lock();
        self.pins_changed.notify_all();
    }

    /// Replace the table metadata, bumping its version.
    pub fn alter_metadata<F>(&self, f: F) -> Result<StorageMetadataPtr>
    where
        F: FnOnce(&mut TableMetadata),
    {
        let mut state = self.state.write();
        let mut metadata = (*state.metadata).clone();
        f(&mut metadata);
        metadata.version = state.metadata.version + 1;
        self.disk
            .write_file_atomic(METADATA_FILE, &serde_json::to_vec_pretty(&metadata)?)?;
        state.metadata = Arc::new(metadata);
        Ok(state.metadata.clone())
    }

    /// Insert a new level-0 part holding `columns`.
    pub fn insert_part(
        &self,
        partition_id: &str,
        columns: &[(&str, VectorColumn)],
    ) -> Result<DataPartPtr> {
        let metadata = self.metadata();
        let rows = columns.first().map_or(0, |(_, c)| c.rows());
        for (name, column) in columns {
            match metadata.column(name).map(|c| &c.kind) {
                Some(ColumnKind::Vector { dimension }) if *dimension == column.dimension() => {}
                _ => {
                    return Err(PartIndexError::part(format!(
                        "column '{name}' is not a vector column of dimension {}",
                        column.dimension()
                    )));
                }
            }
            if column.rows() != rows {
                return Err(PartIndexError::part("columns have different row counts"));
            }
        }

        let block = self.state.write().allocate_block();
        let info = PartInfo::new(partition_id, block, block, 0);
        let files: Vec<(String, Vec<u8>)> = columns
            .iter()
            .map(|(name, column)| -> Result<(String, Vec<u8>)> {
                Ok((DataPart::column_file_name(name), column.encode()?))
            })
            .collect::<Result<_>>()?;

        let part = Arc::new(DataPart::new(self.allocate_id(), info, rows as u64));
        self.write_part_directory(&part, &files)?;

        self.state.write().active.insert(part.name.clone(), part.clone());
        debug!("inserted part {} with {} rows", part.name, rows);
        Ok(part)
    }

    /// Write `files` plus `part.json` and `checksums.json` into a temporary
    /// directory and rename it to the part's directory.
    fn write_part_directory(&self, part: &DataPart, files: &[(String, Vec<u8>)]) -> Result<()> {
        let tmp = format!("tmp_write_{}", part.name);
        self.disk.remove_recursive(&tmp)?;
        self.disk.create_directories(&tmp)?;

        let result = (|| {
            let mut manifest = ChecksumManifest::new();
            for (name, data) in files {
                let path = join_path(&tmp, name);
                if let Some((dir, _)) = path.rsplit_once('/') {
                    self.disk.create_directories(dir)?;
                }
                self.disk.write_file(&path, data)?;
                manifest.insert(name.clone(), FileChecksum::of(data));
            }
            let file_info = PartFileInfo {
                name: part.name.clone(),
                rows_count: part.rows_count,
            };
            let info_bytes = serde_json::to_vec_pretty(&file_info)?;
            self.disk.write_file(&join_path(&tmp, PART_INFO_FILE), &info_bytes)?;
            manifest.insert(PART_INFO_FILE, FileChecksum::of(&info_bytes));
            manifest.store(self.disk.as_ref(), &tmp)?;
            self.disk.rename(&tmp, &part.relative_path)
        })();

        if result.is_err() {
            let _ = self.disk.remove_recursive(&tmp);
        }
        result
    }

    /// Mark parts as taking part in a merge so that nothing else selects
    /// them. Fails if any of them is unknown or already busy.
    pub fn begin_merge(&self, names: &[&str]) -> Result<Vec<DataPartPtr>> {
        let mut state = self.state.write();
        let mut parts = Vec::with_capacity(names.len());
        for name in names {
            let part = state
                .active
                .get(*name)
                .cloned()
                .ok_or_else(|| PartIndexError::not_found(format!("part {name}")))?;
            if state.merging.contains(*name) {
                return Err(PartIndexError::InvalidOperation(format!(
                    "part {name} is already merging or mutating"
                )));
            }
            parts.push(part);
        }
        for name in names {
            state.merging.insert(name.to_string());
        }
        Ok(parts)
    }

    /// Release parts marked by [`begin_merge`](Self::begin_merge).
    pub fn cancel_merge(&self, names: &[&str]) {
        {
            let mut state = self.state.write();
            for name in names {
                state.merging.remove(*name);
            }
        }
        self.notify_pin_waiters();
    }

    /// Merge `names` into one part. Rows removed by lightweight deletes are
    /// dropped. Vector indices built on every source part are carried over
    /// as row-id maps, which leaves them decoupled on the new part.
    pub fn merge_parts(&self, names: &[&str]) -> Result<DataPartPtr> {
        if names.is_empty() {
            return Err(PartIndexError::invalid_argument("nothing to merge"));
        }
        let mut sources = self.begin_merge(names)?;
        let result = self.merge_sources(&mut sources);
        self.cancel_merge(names);
        result
    }

    fn merge_sources(&self, sources: &mut [DataPartPtr]) -> Result<DataPartPtr> {
        sources.sort_by(|a, b| a.info.cmp(&b.info));
        let partition = sources[0].info.partition_id.clone();
        if sources.iter().any(|p| p.info.partition_id != partition) {
            return Err(PartIndexError::InvalidOperation(
                "cannot merge parts of different partitions".to_string(),
            ));
        }

        let metadata = self.metadata();
        let disk = self.disk.as_ref();
        let info = PartInfo {
            partition_id: partition,
            min_block: sources.iter().map(|p| p.info.min_block).min().unwrap_or(0),
            max_block: sources.iter().map(|p| p.info.max_block).max().unwrap_or(0),
            level: sources.iter().map(|p| p.info.level).max().unwrap_or(0) + 1,
            mutation: sources.iter().map(|p| p.info.mutation).max().unwrap_or(0),
        };

        let masks: Vec<Option<RowMask>> = sources
            .iter()
            .map(|p| self.deleted_rows(p))
            .collect::<Result<_>>()?;
        let is_deleted = |source: usize, row: usize| {
            masks[source].as_ref().is_some_and(|m| m.is_deleted(row))
        };

        let mut files = Vec::new();
        let mut rows = 0usize;
        for column in &metadata.columns {
            let ColumnKind::Vector { dimension } = column.kind else {
                continue;
            };
            let file_name = DataPart::column_file_name(&column.name);
            if !disk.exists(&sources[0].path_of(&file_name)) {
                continue;
            }
            let mut merged = VectorColumn::new(dimension);
            for (i, source) in sources.iter().enumerate() {
                let data = source.read_vector_column(disk, &column.name)?;
                merged.extend_filtered(&data, |row| is_deleted(i, row))?;
            }
            rows = merged.rows();
            files.push((file_name, merged.encode()?));
        }

        // Old row -> new row, u64::MAX for dropped rows.
        let mut row_maps: Vec<Vec<u64>> = Vec::with_capacity(sources.len());
        let mut next_row = 0u64;
        for (i, source) in sources.iter().enumerate() {
            let mut map = Vec::with_capacity(source.rows_count as usize);
            for row in 0..source.rows_count as usize {
                if is_deleted(i, row) {
                    map.push(u64::MAX);
                } else {
                    map.push(next_row);
                    next_row += 1;
                }
            }
            row_maps.push(map);
        }

        for description in &metadata.vector_indices {
            let mut built_everywhere = true;
            for source in sources.iter() {
                if !source.vector_index_state(disk, &description.name)?.is_built() {
                    built_everywhere = false;
                    break;
                }
            }
            if !built_everywhere {
                continue;
            }
            for (source, map) in sources.iter().zip(&row_maps) {
                let mut bytes = Vec::with_capacity(map.len() * 8);
                for new_row in map {
                    bytes.write_u64::<LittleEndian>(*new_row)?;
                }
                let name = join_path(
                    &DataPart::vector_index_dir(&description.name),
                    &format!("merged-{}-{ROW_IDS_MAP_SUFFIX}", source.name),
                );
                files.push((name, bytes));
            }
        }

        let part = Arc::new(DataPart::new(self.allocate_id(), info, rows as u64));
        self.write_part_directory(&part, &files)?;
        self.commit_replacement(sources, part.clone())?;
        info!(
            "merged {} parts into {} ({} rows)",
            sources.len(),
            part.name,
            part.rows_count
        );
        Ok(part)
    }

    /// Apply a mutation that leaves the vector columns untouched: the new
    /// part is a copy of the old one under a new mutation version.
    pub fn mutate_part(&self, name: &str) -> Result<DataPartPtr> {
        let sources = self.begin_merge(&[name])?;
        let result = self.mutate_source(&sources[0]);
        self.cancel_merge(&[name]);
        result
    }

    fn mutate_source(&self, source: &DataPartPtr) -> Result<DataPartPtr> {
        let mut info = source.info.clone();
        info.mutation = self.state.write().allocate_block();
        let part = Arc::new(DataPart::new(self.allocate_id(), info, source.rows_count));

        let tmp = format!("tmp_mutate_{}", part.name);
        self.disk.remove_recursive(&tmp)?;
        let copied = {
            let _files = source.lock_files();
            copy_tree(self.disk.as_ref(), &source.relative_path, &tmp)
        };
        let renamed = copied.and_then(|_| {
            let file_info = PartFileInfo {
                name: part.name.clone(),
                rows_count: part.rows_count,
            };
            let info_bytes = serde_json::to_vec_pretty(&file_info)?;
            self.disk.write_file(&join_path(&tmp, PART_INFO_FILE), &info_bytes)?;
            let mut manifest = ChecksumManifest::load(self.disk.as_ref(), &tmp)?;
            manifest.insert(PART_INFO_FILE, FileChecksum::of(&info_bytes));
            manifest.store(self.disk.as_ref(), &tmp)?;
            self.disk.rename(&tmp, &part.relative_path)
        });
        if let Err(e) = renamed {
            let _ = self.disk.remove_recursive(&tmp);
            return Err(e);
        }

        self.commit_replacement(std::slice::from_ref(source), part.clone())?;
        info!("mutated part {} into {}", source.name, part.name);
        Ok(part)
    }

    fn commit_replacement(&self, sources: &[DataPartPtr], part: DataPartPtr) -> Result<()> {
        let ids: Vec<PartId> = sources.iter().map(|p| p.id).collect();
        let mut state = self.write_unpinned(|_| ids.clone());
        if let Some(stale) = sources.iter().find(|p| !state.is_active(p)) {
            let name = stale.name.clone();
            drop(state);
            let _ = self.disk.remove_recursive(&part.relative_path);
            return Err(PartIndexError::InvalidOperation(format!(
                "source part {name} is no longer active"
            )));
        }
        for source in sources {
            if let Some(old) = state.active.remove(&source.name) {
                state.outdated.push(old);
            }
        }
        state.active.insert(part.name.clone(), part);
        Ok(())
    }

    /// Deactivate a part.
    pub fn drop_part(&self, name: &str) -> Result<()> {
        let mut state =
            self.write_unpinned(|state| state.active.get(name).map(|p| p.id).into_iter().collect());
        let part = state
            .active
            .remove(name)
            .ok_or_else(|| PartIndexError::not_found(format!("part {name}")))?;
        state.outdated.push(part);
        Ok(())
    }

    /// Mark `rows` of a part as deleted. The part keeps its identity; the
    /// delete bitmap of every index already built on it is updated too.
    ///
    /// Waits for a merge or mutation of the part to finish and fails if that
    /// replaced it.
    pub fn lightweight_delete(&self, name: &str, rows: &[usize]) -> Result<()> {
        let part = self
            .get_active_part(name)
            .ok_or_else(|| PartIndexError::not_found(format!("part {name}")))?;
        let active = self.with_active_part(&part, &mut || self.apply_deletes(&part, rows))?;
        if !active {
            return Err(PartIndexError::InvalidOperation(format!(
                "part {name} was replaced before rows could be deleted"
            )));
        }
        debug!("deleted {} rows from part {}", rows.len(), name);
        Ok(())
    }

    /// Runs pinned and with the part's files lock held.
    fn apply_deletes(&self, part: &DataPart, rows: &[usize]) -> Result<()> {
        let disk = self.disk.as_ref();

        let mut mask = read_mask(disk, part)?.unwrap_or_else(|| RowMask::new(part.rows_count as usize));
        for row in rows {
            mask.delete(*row)?;
        }
        let bytes = mask.encode()?;

        let mut manifest = part.checksums(disk)?;
        disk.write_file_atomic(&part.path_of(DELETED_ROWS_FILE), &bytes)?;
        manifest.insert(DELETED_ROWS_FILE, FileChecksum::of(&bytes));

        for index_name in part.vector_index_names(disk)? {
            if part.vector_index_state(disk, &index_name)? != VectorIndexState::Built {
                continue;
            }
            let file = join_path(&DataPart::vector_index_dir(&index_name), DELETED_ROWS_FILE);
            disk.write_file_atomic(&part.path_of(&file), &bytes)?;
            manifest.insert(file, FileChecksum::of(&bytes));
        }
        manifest.store(disk, &part.relative_path)
    }

    /// Remove directories of outdated parts nobody references any more.
    /// Returns the number of removed parts.
    pub fn clear_old_parts(&self) -> Result<usize> {
        let removable: Vec<DataPartPtr> = {
            let mut state = self.state.write();
            let (free, busy): (Vec<_>, Vec<_>) = state
                .outdated
                .drain(..)
                .partition(|p| Arc::strong_count(p) == 1);
            state.outdated = busy;
            free
        };
        for part in &removable {
            self.disk.remove_recursive(&part.relative_path)?;
            debug!("removed outdated part {}", part.name);
        }
        Ok(removable.len())
    }
}

fn read_mask(disk: &dyn Disk, part: &DataPart) -> Result<Option<RowMask>> {
    match disk.read_file(&part.path_of(DELETED_ROWS_FILE)) {
        Ok(bytes) => Ok(Some(RowMask::decode(&bytes)?)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

fn copy_tree(disk: &dyn Disk, from: &str, to: &str) -> Result<()> {
    disk.create_directories(to)?;
    for entry in disk.list_directory(from)? {
        let src = join_path(from, &entry);
        let dst = join_path(to, &entry);
        if disk.is_directory(&src) {
            copy_tree(disk, &src, &dst)?;
        } else {
            disk.copy_file(&src, &dst)?;
        }
    }
    Ok(())
}

impl PartRegistry for LocalPartRegistry {
    fn disk(&self) -> DiskPtr {
        self.disk.clone()
    }

    fn metadata(&self) -> StorageMetadataPtr {
        self.state.read().metadata.clone()
    }

    fn data_parts(&self) -> Vec<DataPartPtr> {
        self.state.read().active.values().cloned().collect()
    }

    fn get_active_part(&self, name: &str) -> Option<DataPartPtr> {
        self.state.read().active.get(name).cloned()
    }

    fn currently_merging_mutating_parts(&self) -> BTreeSet<String> {
        self.state.read().merging.clone()
    }

    fn is_merging_or_mutating(&self, part_name: &str) -> bool {
        self.state.read().merging.contains(part_name)
    }

    fn is_active(&self, part: &DataPart) -> bool {
        self.state.read().is_active(part)
    }

    fn covering_part(&self, part: &DataPart) -> Option<DataPartPtr> {
        self.state
            .read()
            .active
            .values()
            .filter(|p| p.id != part.id && p.info.contains(&part.info))
            .max_by(|a, b| a.info.cmp(&b.info))
            .cloned()
    }

    fn deleted_rows(&self, part: &DataPart) -> Result<Option<RowMask>> {
        read_mask(self.disk.as_ref(), part)
    }

    fn with_active_part(&self, part: &DataPart, f: &mut dyn FnMut() -> Result<()>) -> Result<bool> {
        let Some(_pin) = self.pin_active(part) else {
            return Ok(false);
        };
        let _files = part.lock_files();
        f()?;
        Ok(true)
    }
}
