//! Index-building library seam.
//!
//! The builder decides when a build runs and what happens to its output; the
//! numerical work happens behind [`VectorIndexLibrary`]. A library reads the
//! part's vectors, writes its files into the scratch directory it is given,
//! and checks its [`BuildPermit`] between chunks of work so a blocked gate
//! stops it promptly.

pub mod flat;
pub mod ivf;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::error::{PartIndexError, Result};
use crate::gate::BuildPermit;
use crate::metadata::{VectorIndexDescription, VectorIndexKind};
use crate::part::VectorColumn;

pub use flat::FlatIndexLibrary;
pub use ivf::IvfIndexLibrary;

/// Rows processed between two permit checks.
pub const CANCELLATION_CHECK_ROWS: usize = 4096;

/// Shared handle to a library.
pub type VectorIndexLibraryPtr = Arc<dyn VectorIndexLibrary>;

/// Input of one build.
#[derive(Debug)]
pub struct BuildRequest<'a> {
    pub part_name: &'a str,
    pub description: &'a VectorIndexDescription,
    pub vectors: &'a VectorColumn,
    /// Directory the library writes into. It exists and is empty.
    pub scratch_dir: &'a Path,
}

/// What a successful build produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutput {
    /// Files written, relative to the scratch directory.
    pub files: Vec<String>,
    /// Number of rows covered by the index.
    pub indexed_rows: usize,
}

/// An index-building library.
pub trait VectorIndexLibrary: Send + Sync + std::fmt::Debug {
    /// Library name, recorded in the index metadata.
    fn name(&self) -> &str;

    /// Build an index over `request.vectors` into `request.scratch_dir`.
    ///
    /// Returns a cancellation error (see [`PartIndexError::is_cancelled`]) if
    /// the permit is revoked mid-build; any other error is a build failure.
    fn build(&self, request: &BuildRequest<'_>, permit: &BuildPermit) -> Result<BuildOutput>;
}

/// Dispatches to the built-in library matching the index kind.
#[derive(Debug, Default)]
pub struct DefaultIndexLibrary {
    flat: FlatIndexLibrary,
    ivf: IvfIndexLibrary,
}

impl DefaultIndexLibrary {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VectorIndexLibrary for DefaultIndexLibrary {
    fn name(&self) -> &str {
        "partindex-builtin"
    }

    fn build(&self, request: &BuildRequest<'_>, permit: &BuildPermit) -> Result<BuildOutput> {
        match request.description.kind {
            VectorIndexKind::Flat => self.flat.build(request, permit),
            VectorIndexKind::Ivf => self.ivf.build(request, permit),
        }
    }
}

/// Copy the vectors of `request`, validated and optionally normalized,
/// checking the permit every [`CANCELLATION_CHECK_ROWS`] rows.
pub(crate) fn prepare_vectors(request: &BuildRequest<'_>, permit: &BuildPermit) -> Result<Vec<f32>> {
    use rayon::prelude::*;

    permit.check()?;
    let dimension = request.description.dimension;
    if dimension == 0 {
        return Err(PartIndexError::build("index dimension is 0"));
    }
    if request.vectors.dimension() != dimension {
        return Err(PartIndexError::build(format!(
            "part {} has vectors of dimension {}, index '{}' expects {}",
            request.part_name,
            request.vectors.dimension(),
            request.description.name,
            dimension
        )));
    }
    let normalize = request
        .description
        .normalize()
        .map_err(PartIndexError::build)?;

    let mut values = request.vectors.values().to_vec();
    for (chunk_no, chunk) in values
        .chunks_mut(CANCELLATION_CHECK_ROWS * dimension)
        .enumerate()
    {
        permit.check()?;
        if let Some(pos) = chunk.iter().position(|v| !v.is_finite()) {
            let row = chunk_no * CANCELLATION_CHECK_ROWS + pos / dimension;
            return Err(PartIndexError::build(format!(
                "row {row} of part {} contains NaN or infinity",
                request.part_name
            )));
        }
        if normalize {
            chunk.par_chunks_mut(dimension).for_each(|row| {
                let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
                if norm > 0.0 {
                    row.iter_mut().for_each(|v| *v /= norm);
                }
            });
        }
    }
    Ok(values)
}

/// Write a vector block: rows `u64`, dimension `u32`, then the values.
pub(crate) fn write_vector_file(path: &Path, dimension: usize, values: &[f32]) -> Result<()> {
    let rows = if dimension == 0 { 0 } else { values.len() / dimension };
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_u64::<LittleEndian>(rows as u64)?;
    writer.write_u32::<LittleEndian>(dimension as u32)?;
    for value in values {
        writer.write_f32::<LittleEndian>(*value)?;
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::BuildGate;
    use tempfile::TempDir;

    #[test]
    fn test_default_library_dispatches_on_kind() {
        let dir = TempDir::new().unwrap();
        let vectors = VectorColumn::from_rows(2, &[vec![3.0, 4.0], vec![0.0, 1.0]]).unwrap();
        let gate = BuildGate::new();
        let permit = gate.acquire_permit().unwrap();
        let library = DefaultIndexLibrary::new();

        let flat = VectorIndexDescription::new("f", "e", 2, VectorIndexKind::Flat);
        let output = library
            .build(
                &BuildRequest {
                    part_name: "all_1_1_0",
                    description: &flat,
                    vectors: &vectors,
                    scratch_dir: dir.path(),
                },
                &permit,
            )
            .unwrap();
        assert_eq!(output.files, vec![flat::FLAT_DATA_FILE.to_string()]);
        assert_eq!(output.indexed_rows, 2);
    }

    #[test]
    fn test_prepare_vectors_normalizes_and_rejects_nan() {
        let gate = BuildGate::new();
        let permit = gate.acquire_permit().unwrap();
        let description = VectorIndexDescription::new("f", "e", 2, VectorIndexKind::Flat);
        let dir = TempDir::new().unwrap();

        let vectors = VectorColumn::from_rows(2, &[vec![3.0, 4.0]]).unwrap();
        let request = BuildRequest {
            part_name: "p",
            description: &description,
            vectors: &vectors,
            scratch_dir: dir.path(),
        };
        let values = prepare_vectors(&request, &permit).unwrap();
        assert!((values[0] - 0.6).abs() < 1e-6);
        assert!((values[1] - 0.8).abs() < 1e-6);

        let bad = VectorColumn::from_rows(2, &[vec![f32::NAN, 1.0]]).unwrap();
        let request = BuildRequest {
            vectors: &bad,
            ..request
        };
        assert!(matches!(
            prepare_vectors(&request, &permit),
            Err(PartIndexError::Build(_))
        ));
    }

    #[test]
    fn test_prepare_vectors_observes_cancellation() {
        let gate = BuildGate::new();
        let permit = gate.acquire_permit().unwrap();
        let _block = gate.request_block();
        let description = VectorIndexDescription::new("f", "e", 1, VectorIndexKind::Flat);
        let vectors = VectorColumn::from_rows(1, &[vec![1.0]]).unwrap();
        let dir = TempDir::new().unwrap();
        let request = BuildRequest {
            part_name: "p",
            description: &description,
            vectors: &vectors,
            scratch_dir: dir.path(),
        };
        assert!(prepare_vectors(&request, &permit).unwrap_err().is_cancelled());
    }
}
