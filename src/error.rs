//! Error types for partindex.
//!
//! All fallible operations return [`Result`], whose error side is the
//! [`PartIndexError`] enum. Expected terminal states of a build (a vanished
//! part, a skipped build, a superseded destination) are not errors; they are
//! reported through [`crate::status::BuildStatus`]. Errors are reserved for
//! cancellation, storage failures and genuine defects.
//!
//! # Examples
//!
//! ```
//! use partindex::error::{PartIndexError, Result};
//!
//! fn example_operation() -> Result<()> {
//!     Err(PartIndexError::invalid_argument("Invalid input"))
//! }
//!
//! match example_operation() {
//!     Ok(_) => println!("Success"),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//!
//! // A part that vanished mid-build is a status, not an error.
//! use partindex::status::BuildStatus;
//! let vanished: Result<BuildStatus> = Ok(BuildStatus::NoDataPart);
//! assert!(vanished.is_ok());
//! ```

use std::io;

use thiserror::Error;

/// The main error type for partindex operations.
#[derive(Error, Debug)]
pub enum PartIndexError {
    /// I/O errors (file operations, renames, fsync).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Storage-layer errors that are not plain I/O errors.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Table metadata errors (unknown index, inconsistent snapshot).
    #[error("Metadata error: {0}")]
    Metadata(String),

    /// Data part errors (malformed part name, corrupt column file).
    #[error("Part error: {0}")]
    Part(String),

    /// Errors raised by the index-building library.
    #[error("Build error: {0}")]
    Build(String),

    /// Configuration errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation cancelled through the build gate.
    #[error("Operation cancelled: {0}")]
    OperationCancelled(String),

    /// Invalid operation
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with PartIndexError.
pub type Result<T> = std::result::Result<T, PartIndexError>;

impl PartIndexError {
    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        PartIndexError::Storage(msg.into())
    }

    /// Create a new metadata error.
    pub fn metadata<S: Into<String>>(msg: S) -> Self {
        PartIndexError::Metadata(msg.into())
    }

    /// Create a new part error.
    pub fn part<S: Into<String>>(msg: S) -> Self {
        PartIndexError::Part(msg.into())
    }

    /// Create a new build error.
    pub fn build<S: Into<String>>(msg: S) -> Self {
        PartIndexError::Build(msg.into())
    }

    /// Create a new invalid config error.
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        PartIndexError::Config(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        PartIndexError::Other(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        PartIndexError::Other(format!("Invalid argument: {}", msg.into()))
    }

    /// Create a new internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        PartIndexError::Other(format!("Internal error: {}", msg.into()))
    }

    /// Create a new not found error.
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        PartIndexError::Other(format!("Not found: {}", msg.into()))
    }

    /// Create a new cancelled error.
    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        PartIndexError::OperationCancelled(msg.into())
    }

    /// True if this error is the cancellation outcome of a blocked gate.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PartIndexError::OperationCancelled(_))
    }

    /// True if this error is an I/O `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, PartIndexError::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = PartIndexError::storage("Test storage error");
        assert_eq!(error.to_string(), "Storage error: Test storage error");

        let error = PartIndexError::metadata("Test metadata error");
        assert_eq!(error.to_string(), "Metadata error: Test metadata error");

        let error = PartIndexError::cancelled("builds blocked");
        assert_eq!(error.to_string(), "Operation cancelled: builds blocked");
        assert!(error.is_cancelled());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let error = PartIndexError::from(io_error);

        match &error {
            PartIndexError::Io(_) => {}
            _ => panic!("Expected IO error variant"),
        }
        assert!(error.is_not_found());
        assert!(!error.is_cancelled());
    }
}
