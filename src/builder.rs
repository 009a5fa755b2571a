//! Build orchestration.
//!
//! [`VectorIndexBuilder`] ties the pieces together. A build of one
//! (part, index) pair goes through these steps:
//!
//! 1. resolve the part in the registry (`NO_DATA_PART` if it is gone);
//! 2. check the index definition against the table metadata
//!    (`META_ERROR` / `MISCONFIGURED`), and skip pairs that need no work;
//! 3. take a permit from the [`BuildGate`], failing with a cancellation
//!    error while the gate is blocked;
//! 4. run the [`VectorIndexLibrary`](crate::library::VectorIndexLibrary)
//!    into a fresh scratch directory (`BUILD_FAIL` if it fails);
//! 5. hand the output to the [`AtomicInstaller`]. If the part was replaced
//!    by a mutation that left its vectors alone, the output is installed on
//!    the successor instead, up to `max_install_retries` times; any other
//!    replacement yields `BUILD_RETRY`.
//!
//! The scratch directory is removed on every outcome. Each attempt emits one
//! [`BuildEvent`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::admission::{AdmissionController, BuildMode, BuildSlot, BuildSlots};
use crate::claims::{BuildClaim, BuildClaims};
use crate::config::SettingsHandle;
use crate::error::Result;
use crate::events::{BuildEvent, BuildEventSink, BuildOutcome, BuilderStats, LogEventSink};
use crate::gate::{BuildGate, BuildPermit};
use crate::installer::{AtomicInstaller, InstallOutcome, InstallRequest};
use crate::library::{BuildOutput, BuildRequest, VectorIndexLibraryPtr};
use crate::metadata::{IndexDefinitionError, StorageMetadataPtr, VectorIndexDescription};
use crate::part::{DataPart, DataPartPtr, PartRegistryPtr, VectorIndexState};
use crate::reaper::{ReapReport, StaleIndexReaper};
use crate::selector::{BuildTask, CandidateSelector};
use crate::status::BuildStatus;
use crate::storage::{DiskPtr, join_path};

/// A selected, admitted and claimed build, ready to [`run`](VectorIndexBuilder::run).
///
/// Holds the admission slot and the (part, index) claim until dropped.
#[derive(Debug)]
pub struct ScheduledBuild {
    pub task: BuildTask,
    pub metadata: StorageMetadataPtr,
    slot: BuildSlot,
    claim: BuildClaim,
}

impl ScheduledBuild {
    pub fn mode(&self) -> BuildMode {
        self.slot.mode()
    }
}

/// Per-attempt facts reported in the build event.
#[derive(Debug, Default)]
struct AttemptReport {
    install_retries: usize,
    indexed_rows: Option<usize>,
}

/// A scratch directory removed on drop.
struct ScratchDir<'a> {
    disk: DiskPtr,
    path: String,
    name: String,
    active: &'a Mutex<BTreeSet<String>>,
}

impl<'a> ScratchDir<'a> {
    fn create(disk: DiskPtr, root: &str, active: &'a Mutex<BTreeSet<String>>) -> Result<Self> {
        let name = Uuid::new_v4().to_string();
        let path = join_path(root, &name);
        active.lock().insert(name.clone());
        let scratch = ScratchDir {
            disk,
            path,
            name,
            active,
        };
        scratch.disk.create_directories(&scratch.path)?;
        Ok(scratch)
    }
}

impl Drop for ScratchDir<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.disk.remove_recursive(&self.path) {
            warn!("cannot remove scratch directory {}: {e}", self.path);
        }
        self.active.lock().remove(&self.name);
    }
}

/// Background vector index builder of one table.
#[derive(Debug)]
pub struct VectorIndexBuilder {
    registry: PartRegistryPtr,
    library: VectorIndexLibraryPtr,
    settings: SettingsHandle,
    admission: AdmissionController,
    slots: BuildSlots,
    gate: BuildGate,
    claims: BuildClaims,
    selector: CandidateSelector,
    installer: AtomicInstaller,
    events: Arc<dyn BuildEventSink>,
    stats: Arc<BuilderStats>,
    /// Serializes admission, selection and claiming.
    selection_lock: Mutex<()>,
    /// Names of scratch directories owned by running builds.
    active_scratch: Mutex<BTreeSet<String>>,
}

impl VectorIndexBuilder {
    pub fn new(registry: PartRegistryPtr, library: VectorIndexLibraryPtr, settings: SettingsHandle) -> Self {
        let claims = BuildClaims::new();
        VectorIndexBuilder {
            selector: CandidateSelector::new(registry.clone(), settings.clone(), claims.clone()),
            installer: AtomicInstaller::new(registry.clone()),
            admission: AdmissionController::new(settings.clone()),
            slots: BuildSlots::new(),
            gate: BuildGate::new(),
            events: Arc::new(LogEventSink),
            stats: Arc::new(BuilderStats::new()),
            selection_lock: Mutex::new(()),
            active_scratch: Mutex::new(BTreeSet::new()),
            registry,
            library,
            settings,
            claims,
        }
    }

    /// Send build events to `sink` instead of the log.
    pub fn with_event_sink(mut self, sink: Arc<dyn BuildEventSink>) -> Self {
        self.events = sink;
        self
    }

    pub fn registry(&self) -> &PartRegistryPtr {
        &self.registry
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    pub fn gate(&self) -> &BuildGate {
        &self.gate
    }

    pub fn claims(&self) -> &BuildClaims {
        &self.claims
    }

    pub fn selector(&self) -> &CandidateSelector {
        &self.selector
    }

    pub fn stats(&self) -> &BuilderStats {
        &self.stats
    }

    pub fn in_flight(&self, mode: BuildMode) -> usize {
        self.slots.in_flight(mode)
    }

    /// Admission check against the current budget of the mode.
    pub fn allow_to_build_vector_index(&self, slow_mode: bool, builds_count_in_queue: usize) -> bool {
        self.admission
            .allowed(BuildMode::from_slow_flag(slow_mode), builds_count_in_queue)
    }

    /// Pick the next pair to build without claiming it.
    pub fn select_part_to_build_vector_index(
        &self,
        metadata: &StorageMetadataPtr,
        select_slow_mode_part: bool,
        excluded_parts: &BTreeSet<String>,
    ) -> Option<BuildTask> {
        self.selector
            .select(metadata, select_slow_mode_part, excluded_parts)
    }

    /// Admit, select and claim the next build of the given mode.
    ///
    /// Pairs for which `skip` returns true are passed over. Returns `None` if
    /// the budget is exhausted, the gate is blocked or nothing is eligible.
    pub fn schedule_next(
        &self,
        select_slow_mode_part: bool,
        skip: &dyn Fn(&DataPart, &VectorIndexDescription) -> bool,
    ) -> Option<ScheduledBuild> {
        if self.gate.is_blocked() {
            return None;
        }
        let _guard = self.selection_lock.lock();
        let mode = BuildMode::from_slow_flag(select_slow_mode_part);
        let slot = self.slots.try_admit(&self.admission, mode)?;

        let metadata = self.registry.metadata();
        let task =
            self.selector
                .select_with(&metadata, select_slow_mode_part, &BTreeSet::new(), skip)?;
        let claim = self.claims.try_claim(&task.part.name, &task.index.name)?;
        Some(ScheduledBuild {
            task,
            metadata,
            slot,
            claim,
        })
    }

    /// Run a build obtained from [`schedule_next`](Self::schedule_next).
    pub fn run(&self, scheduled: ScheduledBuild) -> Result<BuildStatus> {
        let ScheduledBuild {
            task,
            metadata,
            slot,
            claim,
        } = scheduled;
        let status = self.build_claimed(&metadata, &task.part.name, &task.index.name, slot.mode());
        drop(claim);
        drop(slot);
        status
    }

    /// Build `index_name` on `part_name`.
    ///
    /// Returns one of the seven [`BuildStatus`] values, or an error for
    /// cancellation (see [`crate::error::PartIndexError::is_cancelled`]) and
    /// for storage failures.
    pub fn build_vector_index(
        &self,
        metadata: &StorageMetadataPtr,
        part_name: &str,
        index_name: &str,
        slow_mode: bool,
    ) -> Result<BuildStatus> {
        let mode = BuildMode::from_slow_flag(slow_mode);
        let Some(claim) = self.claims.try_claim(part_name, index_name) else {
            debug!("vector index {index_name} on part {part_name} is already being built");
            let started = Instant::now();
            let result = Ok(BuildStatus::BuildSkipped);
            self.report(metadata, part_name, index_name, mode, started, &AttemptReport::default(), &result);
            return result;
        };
        let status = self.build_claimed(metadata, part_name, index_name, mode);
        drop(claim);
        status
    }

    fn build_claimed(
        &self,
        metadata: &StorageMetadataPtr,
        part_name: &str,
        index_name: &str,
        mode: BuildMode,
    ) -> Result<BuildStatus> {
        let started = Instant::now();
        let mut report = AttemptReport::default();
        let result = self.build_steps(metadata, part_name, index_name, &mut report);
        self.report(metadata, part_name, index_name, mode, started, &report, &result);
        result
    }

    fn build_steps(
        &self,
        metadata: &StorageMetadataPtr,
        part_name: &str,
        index_name: &str,
        report: &mut AttemptReport,
    ) -> Result<BuildStatus> {
        let Some(part) = self.registry.get_active_part(part_name) else {
            debug!("part {part_name} is gone, nothing to build");
            return Ok(BuildStatus::NoDataPart);
        };

        let description = match metadata.resolve_vector_index(index_name) {
            Ok(description) => description.clone(),
            Err(IndexDefinitionError::Inconsistent(reason)) => {
                warn!("cannot build vector index on part {part_name}: {reason}");
                return Ok(BuildStatus::MetaError);
            }
            Err(IndexDefinitionError::Misconfigured(reason)) => {
                warn!("cannot build vector index on part {part_name}: {reason}");
                return Ok(BuildStatus::Misconfigured);
            }
        };
        let current = self.registry.metadata();
        if current.version != metadata.version && current.vector_index(index_name) != Some(&description) {
            warn!(
                "vector index {index_name} changed since metadata version {} (now {})",
                metadata.version, current.version
            );
            return Ok(BuildStatus::MetaError);
        }

        let disk = self.registry.disk();
        let settings = self.settings.load();
        if part.rows_count < settings.min_rows_to_build_vector_index {
            debug!(
                "part {part_name} has {} rows, below the minimum of {}",
                part.rows_count, settings.min_rows_to_build_vector_index
            );
            return Ok(BuildStatus::BuildSkipped);
        }
        if part.vector_index_state(disk.as_ref(), index_name)? == VectorIndexState::Built {
            debug!("vector index {index_name} is already built on part {part_name}");
            return Ok(BuildStatus::BuildSkipped);
        }

        let permit = self.gate.acquire_permit()?;

        let scratch = ScratchDir::create(disk.clone(), &settings.scratch_dir_name, &self.active_scratch)?;

        let vectors = match part.read_vector_column(disk.as_ref(), &description.column) {
            Ok(vectors) => vectors,
            Err(_) if !self.registry.is_active(&part) => return Ok(BuildStatus::NoDataPart),
            Err(e) => return Err(e),
        };

        let scratch_path = disk.full_path(&scratch.path);
        let request = BuildRequest {
            part_name,
            description: &description,
            vectors: &vectors,
            scratch_dir: &scratch_path,
        };
        let output = match self.library.build(&request, &permit) {
            Ok(output) => output,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!("library {} failed on part {part_name}: {e}", self.library.name());
                return Ok(BuildStatus::BuildFail);
            }
        };
        report.indexed_rows = Some(output.indexed_rows);
        drop(vectors);

        self.install_with_retargeting(part, &description, &scratch, &output, &permit, report)
    }

    /// Install, following mutation-only successors of the part.
    fn install_with_retargeting(
        &self,
        part: DataPartPtr,
        description: &VectorIndexDescription,
        scratch: &ScratchDir<'_>,
        output: &BuildOutput,
        permit: &BuildPermit,
        report: &mut AttemptReport,
    ) -> Result<BuildStatus> {
        let max_retries = self.settings.load().max_install_retries;
        let mut target = part;
        let mut successor_claims: Vec<BuildClaim> = Vec::new();

        loop {
            let request = InstallRequest {
                scratch_dir: &scratch.path,
                part: &target,
                description,
                output,
                library_name: self.library.name(),
            };
            match self.installer.install(&request, permit)? {
                InstallOutcome::Installed { .. } => return Ok(BuildStatus::Success),
                InstallOutcome::PartSuperseded => {}
            }

            if report.install_retries >= max_retries {
                info!(
                    "giving up installing vector index {} after {} retargets",
                    description.name, report.install_retries
                );
                return Ok(BuildStatus::BuildRetry);
            }
            let Some(successor) = self.mutation_successor(&target, description)? else {
                debug!(
                    "part {} was replaced, vector index {} must be rebuilt",
                    target.name, description.name
                );
                return Ok(BuildStatus::BuildRetry);
            };
            let Some(claim) = self.claims.try_claim(&successor.name, &description.name) else {
                return Ok(BuildStatus::BuildRetry);
            };
            debug!(
                "retargeting vector index {} from {} to {}",
                description.name, target.name, successor.name
            );
            successor_claims.push(claim);
            report.install_retries += 1;
            target = successor;
        }
    }

    /// The active part that replaced `part` through a mutation which left the
    /// indexed column byte-identical.
    fn mutation_successor(
        &self,
        part: &DataPart,
        description: &VectorIndexDescription,
    ) -> Result<Option<DataPartPtr>> {
        let Some(successor) = self.registry.covering_part(part) else {
            return Ok(None);
        };
        if !successor.info.is_mutation_of(&part.info) || successor.rows_count != part.rows_count {
            return Ok(None);
        }
        let disk = self.registry.disk();
        if successor.vector_index_state(disk.as_ref(), &description.name)?.is_built() {
            return Ok(None);
        }

        let column = DataPart::column_file_name(&description.column);
        let before = part.checksums(disk.as_ref())?;
        let after = successor.checksums(disk.as_ref())?;
        match (before.get(&column), after.get(&column)) {
            (Some(a), Some(b)) if a == b => Ok(Some(successor)),
            _ => Ok(None),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn report(
        &self,
        metadata: &StorageMetadataPtr,
        part_name: &str,
        index_name: &str,
        mode: BuildMode,
        started: Instant,
        report: &AttemptReport,
        result: &Result<BuildStatus>,
    ) {
        let outcome = match result {
            Ok(status) => BuildOutcome::Status(*status),
            Err(e) if e.is_cancelled() => BuildOutcome::Cancelled,
            Err(e) => BuildOutcome::Failed(e.to_string()),
        };
        self.stats.record(&outcome);

        let event = BuildEvent {
            time: Utc::now(),
            table: metadata.table.clone(),
            part_name: part_name.to_string(),
            index_name: index_name.to_string(),
            mode,
            outcome,
            duration_ms: started.elapsed().as_millis() as u64,
            install_retries: report.install_retries,
            indexed_rows: report.indexed_rows,
        };
        if let Err(e) = self.events.record(&event) {
            warn!("cannot record build event for {part_name}/{index_name}: {e}");
            self.stats.record_sink_failure();
        }
    }

    /// Remove index files of indices no longer defined in the current
    /// metadata.
    pub fn remove_dropped_vector_indices(&self) -> Result<ReapReport> {
        let metadata = self.registry.metadata();
        StaleIndexReaper::new(self.registry.clone(), self.claims.clone()).reap(&metadata)
    }

    /// Remove scratch directories not owned by a running build, e.g. those
    /// left behind by a crash. Returns the number of removed entries.
    pub fn cleanup_scratch(&self) -> Result<usize> {
        let disk = self.registry.disk();
        let root = self.settings.load().scratch_dir_name.clone();
        if !disk.is_directory(&root) {
            return Ok(0);
        }
        let active = self.active_scratch.lock().clone();
        let mut removed = 0;
        for entry in disk.list_directory(&root)? {
            let owner = entry.split('.').next().unwrap_or(&entry);
            if active.contains(owner) {
                continue;
            }
            disk.remove_recursive(&join_path(&root, &entry))?;
            removed += 1;
        }
        if removed > 0 {
            info!("removed {removed} stale scratch directories");
        }
        Ok(removed)
    }
}
