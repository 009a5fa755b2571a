//! Storage parts and the registry that owns them.
//!
//! A part is an immutable directory of column files. The builder only ever
//! adds files under `vector_index/<index name>/` and rewrites the part's
//! checksum manifest; everything else in a part is owned by the table engine.

pub mod column;
pub mod data_part;
pub mod info;
pub mod local;
pub mod mask;
pub mod registry;

pub use column::VectorColumn;
pub use data_part::{DataPart, DataPartPtr, PartId, VectorIndexState};
pub use info::PartInfo;
pub use local::LocalPartRegistry;
pub use mask::RowMask;
pub use registry::{PartRegistry, PartRegistryPtr};

/// Directory inside a part that holds one subdirectory per vector index.
pub const VECTOR_INDEX_DIR: &str = "vector_index";

/// Marker file of a complete vector index.
pub const INDEX_META_FILE: &str = "index.meta";

/// Lightweight-delete bitmap, both at part level and inside a built index.
pub const DELETED_ROWS_FILE: &str = "deleted_rows.bin";

/// Part description written by the table engine.
pub const PART_INFO_FILE: &str = "part.json";

/// Table metadata file at the table root.
pub const METADATA_FILE: &str = "metadata.json";

/// Suffix of legacy row-id mapping files left behind by merges.
pub const ROW_IDS_MAP_SUFFIX: &str = "row_ids_map.bin";

/// Extension of vector column files.
pub const COLUMN_FILE_EXTENSION: &str = "vec";
