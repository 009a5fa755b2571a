//! Table metadata: columns and vector index definitions.
//!
//! Metadata is immutable once published. Schema changes produce a new
//! [`TableMetadata`] with a higher `version`, and builders hold on to the
//! snapshot they were scheduled with ([`StorageMetadataPtr`]).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Shared, immutable metadata snapshot.
pub type StorageMetadataPtr = Arc<TableMetadata>;

/// Kind of a table column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ColumnKind {
    /// Fixed-dimension `f32` vectors.
    Vector { dimension: usize },
    /// Any non-vector column.
    Scalar,
}

/// A column of the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescription {
    pub name: String,
    #[serde(flatten)]
    pub kind: ColumnKind,
}

impl ColumnDescription {
    pub fn vector(name: impl Into<String>, dimension: usize) -> Self {
        ColumnDescription {
            name: name.into(),
            kind: ColumnKind::Vector { dimension },
        }
    }

    pub fn scalar(name: impl Into<String>) -> Self {
        ColumnDescription {
            name: name.into(),
            kind: ColumnKind::Scalar,
        }
    }
}

/// Algorithm used for a vector index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorIndexKind {
    /// Exact search over a normalized copy of the vectors.
    Flat,
    /// Inverted file index over k-means clusters.
    Ivf,
}

impl VectorIndexKind {
    /// Parameter names accepted by this kind.
    pub fn allowed_params(&self) -> &'static [&'static str] {
        match self {
            VectorIndexKind::Flat => &["normalize"],
            VectorIndexKind::Ivf => &["normalize", "nlist", "iterations"],
        }
    }
}

impl fmt::Display for VectorIndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VectorIndexKind::Flat => write!(f, "flat"),
            VectorIndexKind::Ivf => write!(f, "ivf"),
        }
    }
}

/// Definition of a vector index on a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorIndexDescription {
    pub name: String,
    pub column: String,
    pub dimension: usize,
    pub kind: VectorIndexKind,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl VectorIndexDescription {
    pub fn new(
        name: impl Into<String>,
        column: impl Into<String>,
        dimension: usize,
        kind: VectorIndexKind,
    ) -> Self {
        VectorIndexDescription {
            name: name.into(),
            column: column.into(),
            dimension,
            kind,
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Parse a numeric parameter, `None` if unset.
    pub fn usize_param(&self, key: &str) -> Result<Option<usize>, String> {
        match self.params.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<usize>()
                .map(Some)
                .map_err(|_| format!("parameter '{key}' is not a number: {raw:?}")),
        }
    }

    /// Whether vectors are normalized before indexing. Defaults to true.
    pub fn normalize(&self) -> Result<bool, String> {
        match self.params.get("normalize").map(String::as_str) {
            None | Some("true") | Some("1") => Ok(true),
            Some("false") | Some("0") => Ok(false),
            Some(other) => Err(format!("parameter 'normalize' is not a boolean: {other:?}")),
        }
    }
}

/// Why an index definition cannot be built against a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexDefinitionError {
    /// The metadata itself does not know the index (it was dropped or the
    /// snapshot is stale).
    Inconsistent(String),
    /// The definition exists but is invalid for this table.
    Misconfigured(String),
}

impl fmt::Display for IndexDefinitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexDefinitionError::Inconsistent(msg) => write!(f, "inconsistent metadata: {msg}"),
            IndexDefinitionError::Misconfigured(msg) => write!(f, "misconfigured index: {msg}"),
        }
    }
}

/// Table-level metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    /// Bumped on every schema change.
    #[serde(default)]
    pub version: u64,
    pub table: String,
    pub columns: Vec<ColumnDescription>,
    #[serde(default)]
    pub vector_indices: Vec<VectorIndexDescription>,
}

impl TableMetadata {
    pub fn new(table: impl Into<String>, columns: Vec<ColumnDescription>) -> Self {
        TableMetadata {
            version: 0,
            table: table.into(),
            columns,
            vector_indices: Vec::new(),
        }
    }

    pub fn with_vector_index(mut self, description: VectorIndexDescription) -> Self {
        self.vector_indices.push(description);
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescription> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn vector_index(&self, name: &str) -> Option<&VectorIndexDescription> {
        self.vector_indices.iter().find(|d| d.name == name)
    }

    pub fn has_vector_index(&self, name: &str) -> bool {
        self.vector_index(name).is_some()
    }

    /// Resolve `index_name` in this snapshot and check that it is buildable.
    pub fn resolve_vector_index(
        &self,
        index_name: &str,
    ) -> Result<&VectorIndexDescription, IndexDefinitionError> {
        let description = self.vector_index(index_name).ok_or_else(|| {
            IndexDefinitionError::Inconsistent(format!(
                "vector index '{index_name}' is not defined on table '{}'",
                self.table
            ))
        })?;
        self.validate_vector_index(description)
            .map_err(IndexDefinitionError::Misconfigured)?;
        Ok(description)
    }

    /// Check an index definition against the columns of this table.
    pub fn validate_vector_index(&self, description: &VectorIndexDescription) -> Result<(), String> {
        validate_index_name(&description.name)?;

        if description.dimension == 0 {
            return Err(format!("index '{}' has dimension 0", description.name));
        }

        match self.column(&description.column).map(|c| &c.kind) {
            None => {
                return Err(format!(
                    "column '{}' of index '{}' does not exist",
                    description.column, description.name
                ));
            }
            Some(ColumnKind::Scalar) => {
                return Err(format!(
                    "column '{}' of index '{}' is not a vector column",
                    description.column, description.name
                ));
            }
            Some(ColumnKind::Vector { dimension }) if *dimension != description.dimension => {
                return Err(format!(
                    "index '{}' expects dimension {}, column '{}' has {}",
                    description.name, description.dimension, description.column, dimension
                ));
            }
            Some(ColumnKind::Vector { .. }) => {}
        }

        let allowed = description.kind.allowed_params();
        if let Some(unknown) = description
            .params
            .keys()
            .find(|k| !allowed.contains(&k.as_str()))
        {
            return Err(format!(
                "unknown parameter '{unknown}' for {} index '{}'",
                description.kind, description.name
            ));
        }
        description.normalize()?;
        if description.kind == VectorIndexKind::Ivf {
            if description.usize_param("nlist")? == Some(0) {
                return Err(format!("index '{}' has nlist = 0", description.name));
            }
            description.usize_param("iterations")?;
        }
        Ok(())
    }
}

/// Index names become directory names inside parts.
pub fn validate_index_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("index name is empty".to_string());
    }
    if name.starts_with('.') || name.contains('/') || name.contains('\\') {
        return Err(format!("index name {name:?} is not a valid directory name"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> TableMetadata {
        TableMetadata::new(
            "items",
            vec![
                ColumnDescription::scalar("id"),
                ColumnDescription::vector("embedding", 4),
            ],
        )
        .with_vector_index(VectorIndexDescription::new(
            "v1",
            "embedding",
            4,
            VectorIndexKind::Flat,
        ))
    }

    #[test]
    fn test_resolve_valid_index() {
        let meta = metadata();
        let desc = meta.resolve_vector_index("v1").unwrap();
        assert_eq!(desc.column, "embedding");
    }

    #[test]
    fn test_unknown_index_is_inconsistent() {
        let meta = metadata();
        assert!(matches!(
            meta.resolve_vector_index("v2"),
            Err(IndexDefinitionError::Inconsistent(_))
        ));
    }

    #[test]
    fn test_misconfigured_definitions() {
        let base = metadata();

        let mut meta = base.clone();
        meta.vector_indices[0].dimension = 8;
        assert!(matches!(
            meta.resolve_vector_index("v1"),
            Err(IndexDefinitionError::Misconfigured(_))
        ));

        let mut meta = base.clone();
        meta.vector_indices[0].column = "id".to_string();
        assert!(matches!(
            meta.resolve_vector_index("v1"),
            Err(IndexDefinitionError::Misconfigured(_))
        ));

        let mut meta = base.clone();
        meta.vector_indices[0] = meta.vector_indices[0].clone().with_param("nlist", "4");
        assert!(matches!(
            meta.resolve_vector_index("v1"),
            Err(IndexDefinitionError::Misconfigured(_))
        ));

        let mut meta = base;
        meta.vector_indices[0].name = "../escape".to_string();
        assert!(matches!(
            meta.resolve_vector_index("../escape"),
            Err(IndexDefinitionError::Misconfigured(_))
        ));
    }

    #[test]
    fn test_ivf_params() {
        let meta = TableMetadata::new("t", vec![ColumnDescription::vector("e", 2)])
            .with_vector_index(
                VectorIndexDescription::new("ivf", "e", 2, VectorIndexKind::Ivf)
                    .with_param("nlist", "0"),
            );
        assert!(meta.resolve_vector_index("ivf").is_err());
    }

    #[test]
    fn test_json_round_trip_shape() {
        let json = r#"{
            "table": "t",
            "columns": [{"name": "e", "type": "vector", "dimension": 3}],
            "vector_indices": [{"name": "v", "column": "e", "dimension": 3, "kind": "ivf"}]
        }"#;
        let meta: TableMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.version, 0);
        assert_eq!(meta.vector_indices[0].kind, VectorIndexKind::Ivf);
        assert!(meta.resolve_vector_index("v").is_ok());
    }
}
