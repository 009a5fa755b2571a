//! Flat vector index library for exact search.

use crate::error::Result;
use crate::gate::BuildPermit;
use crate::library::{
    BuildOutput, BuildRequest, VectorIndexLibrary, prepare_vectors, write_vector_file,
};

/// Data file of a flat index.
pub const FLAT_DATA_FILE: &str = "data.flat";

/// Builds a flat index: the validated, optionally normalized vectors in row
/// order.
#[derive(Debug, Default)]
pub struct FlatIndexLibrary;

impl FlatIndexLibrary {
    pub fn new() -> Self {
        FlatIndexLibrary
    }
}

impl VectorIndexLibrary for FlatIndexLibrary {
    fn name(&self) -> &str {
        "flat"
    }

    fn build(&self, request: &BuildRequest<'_>, permit: &BuildPermit) -> Result<BuildOutput> {
        let values = prepare_vectors(request, permit)?;
        permit.check()?;
        write_vector_file(
            &request.scratch_dir.join(FLAT_DATA_FILE),
            request.description.dimension,
            &values,
        )?;

        Ok(BuildOutput {
            files: vec![FLAT_DATA_FILE.to_string()],
            indexed_rows: request.vectors.rows(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::BuildGate;
    use crate::metadata::{VectorIndexDescription, VectorIndexKind};
    use crate::part::VectorColumn;
    use tempfile::TempDir;

    #[test]
    fn test_flat_file_layout() {
        let dir = TempDir::new().unwrap();
        let vectors = VectorColumn::from_rows(2, &[vec![1.0, 0.0], vec![0.0, 2.0]]).unwrap();
        let description = VectorIndexDescription::new("v", "e", 2, VectorIndexKind::Flat)
            .with_param("normalize", "false");
        let gate = BuildGate::new();
        let permit = gate.acquire_permit().unwrap();

        let output = FlatIndexLibrary::new()
            .build(
                &BuildRequest {
                    part_name: "all_1_1_0",
                    description: &description,
                    vectors: &vectors,
                    scratch_dir: dir.path(),
                },
                &permit,
            )
            .unwrap();

        assert_eq!(output.indexed_rows, 2);
        let bytes = std::fs::read(dir.path().join(FLAT_DATA_FILE)).unwrap();
        // rows + dimension + 4 values
        assert_eq!(bytes.len(), 8 + 4 + 4 * 4);
        assert_eq!(&bytes[0..8], &2u64.to_le_bytes());
        assert_eq!(&bytes[24..28], &2.0f32.to_le_bytes());
    }
}
