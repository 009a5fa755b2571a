//! Command implementations for the partindex CLI.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};

use crate::admission::BuildMode;
use crate::builder::VectorIndexBuilder;
use crate::cli::args::*;
use crate::cli::output::*;
use crate::config::{BuilderSettings, SettingsHandle};
use crate::error::{PartIndexError, Result};
use crate::events::{BuildOutcome, MemoryEventSink};
use crate::library::DefaultIndexLibrary;
use crate::metadata::{StorageMetadataPtr, VectorIndexDescription};
use crate::part::{DataPart, LocalPartRegistry, PartRegistry, PartRegistryPtr, VectorIndexState};
use crate::scheduler::{BuildAttempt, BuildScheduler};

/// Execute a CLI command.
pub fn execute_command(args: PartIndexArgs) -> Result<()> {
    match &args.command {
        Command::Status(status_args) => show_status(status_args, &args),
        Command::Build(build_args) => build_indices(build_args, &args),
        Command::Reap(reap_args) => reap_indices(reap_args, &args),
        Command::Verify(verify_args) => verify_parts(verify_args, &args),
    }
}

fn load_settings(args: &PartIndexArgs) -> Result<BuilderSettings> {
    match &args.config {
        Some(path) => {
            debug!("loading settings from {}", path.display());
            BuilderSettings::from_file(path)
        }
        None => Ok(BuilderSettings::default()),
    }
}

fn open_table(path: &Path) -> Result<Arc<LocalPartRegistry>> {
    Ok(Arc::new(LocalPartRegistry::open(path)?))
}

fn open_builder(path: &Path, args: &PartIndexArgs) -> Result<(PartRegistryPtr, VectorIndexBuilder)> {
    let registry: PartRegistryPtr = open_table(path)?;
    let builder = VectorIndexBuilder::new(
        registry.clone(),
        Arc::new(DefaultIndexLibrary::new()),
        SettingsHandle::new(load_settings(args)?),
    )
    .with_event_sink(Arc::new(MemoryEventSink::default()));
    Ok((registry, builder))
}

/// Show every part with the state of each defined index.
fn show_status(args: &StatusArgs, cli_args: &PartIndexArgs) -> Result<()> {
    let registry = open_table(&args.table_path)?;
    let metadata = registry.metadata();
    let disk = registry.disk();

    let mut parts = registry.data_parts();
    parts.sort_by(|a, b| a.info.cmp(&b.info));

    let mut statuses = Vec::with_capacity(parts.len());
    for part in parts {
        let mut indices = BTreeMap::new();
        for description in &metadata.vector_indices {
            let state = match part.vector_index_state(disk.as_ref(), &description.name)? {
                VectorIndexState::Built => "built",
                VectorIndexState::Decoupled => "decoupled",
                VectorIndexState::Missing => "missing",
            };
            indices.insert(description.name.clone(), state.to_string());
        }
        for name in part.vector_index_names(disk.as_ref())? {
            indices.entry(name).or_insert_with(|| "dropped".to_string());
        }
        statuses.push(PartStatus {
            merging: registry.is_merging_or_mutating(&part.name),
            name: part.name.clone(),
            rows: part.rows_count,
            indices,
        });
    }

    output_result(
        "Table status",
        &TableStatus {
            table: metadata.table.clone(),
            metadata_version: metadata.version,
            parts: statuses,
        },
        cli_args,
    )
}

/// Build missing indices until there is nothing left to do.
fn build_indices(args: &BuildArgs, cli_args: &PartIndexArgs) -> Result<()> {
    let start_time = Instant::now();
    let (registry, builder) = open_builder(&args.table_path, cli_args)?;
    builder.cleanup_scratch()?;

    let metadata = registry.metadata();
    if let Some(index) = &args.index {
        if !metadata.has_vector_index(index) {
            return Err(PartIndexError::invalid_argument(format!(
                "table '{}' has no vector index '{index}'",
                metadata.table
            )));
        }
    }

    let builder = Arc::new(builder);
    let attempts = match &args.part {
        Some(part_name) => build_on_part(&builder, &metadata, part_name, args),
        None => {
            let scheduler = BuildScheduler::new(builder.clone());
            let only = args.index.clone();
            let skip = move |_: &DataPart, description: &VectorIndexDescription| {
                only.as_ref().is_some_and(|name| name != &description.name)
            };
            let mut attempts = Vec::new();
            if args.slow {
                attempts.extend(scheduler.run_once_with(true, &skip));
            }
            let remaining = args.max_builds.saturating_sub(attempts.len());
            attempts.extend(scheduler.run_until_idle(remaining, &skip));
            attempts
        }
    };

    for attempt in &attempts {
        if let BuildOutcome::Failed(reason) = &attempt.outcome {
            warn!(
                "build of {} on {} failed: {reason}",
                attempt.index_name, attempt.part_name
            );
        }
    }
    output_result(
        "Vector index build finished",
        &BuildSummary {
            attempts: attempts.iter().map(BuildAttemptRecord::from).collect(),
            stats: builder.stats().snapshot(),
            duration_ms: start_time.elapsed().as_millis() as u64,
        },
        cli_args,
    )
}

/// Build the requested indices on one part, bypassing admission.
fn build_on_part(
    builder: &VectorIndexBuilder,
    metadata: &StorageMetadataPtr,
    part_name: &str,
    args: &BuildArgs,
) -> Vec<BuildAttempt> {
    let indices: Vec<String> = match &args.index {
        Some(index) => vec![index.clone()],
        None => metadata.vector_indices.iter().map(|d| d.name.clone()).collect(),
    };

    let mut attempts = Vec::new();
    for index in indices {
        let mode = match builder.registry().get_active_part(part_name) {
            Some(part) => builder.selector().classify(&part, &index),
            None => BuildMode::from_slow_flag(args.slow),
        };
        let outcome = match builder.build_vector_index(metadata, part_name, &index, mode.is_slow()) {
            Ok(status) => BuildOutcome::Status(status),
            Err(e) if e.is_cancelled() => BuildOutcome::Cancelled,
            Err(e) => BuildOutcome::Failed(e.to_string()),
        };
        attempts.push(BuildAttempt {
            part_name: part_name.to_string(),
            index_name: index,
            mode,
            outcome,
        });
    }
    attempts
}

/// Remove files of indices no longer defined on the table.
fn reap_indices(args: &ReapArgs, cli_args: &PartIndexArgs) -> Result<()> {
    let (_, builder) = open_builder(&args.table_path, cli_args)?;
    let report = builder.remove_dropped_vector_indices()?;
    output_result("Dropped vector indices removed", &report, cli_args)
}

/// Check files of one or all parts against their checksum manifests.
fn verify_parts(args: &VerifyArgs, cli_args: &PartIndexArgs) -> Result<()> {
    let registry = open_table(&args.table_path)?;
    let disk = registry.disk();

    let parts = match &args.part {
        Some(name) => vec![
            registry
                .get_active_part(name)
                .ok_or_else(|| PartIndexError::not_found(format!("part {name}")))?,
        ],
        None => {
            let mut parts = registry.data_parts();
            parts.sort_by(|a, b| a.info.cmp(&b.info));
            parts
        }
    };

    let mut report = VerifyReport { parts: Vec::new() };
    for part in parts {
        let manifest = part.checksums(disk.as_ref())?;
        let mismatches = manifest
            .verify(disk.as_ref(), &part.relative_path)?
            .into_iter()
            .map(|m| m.file)
            .collect();
        report.parts.push(PartVerification {
            part: part.name.clone(),
            files: manifest.files.len(),
            mismatches,
        });
    }

    output_result("Checksum verification", &report, cli_args)?;
    if report.is_ok() {
        Ok(())
    } else {
        Err(PartIndexError::storage("checksum verification failed"))
    }
}
