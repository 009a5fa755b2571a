//! # partindex
//!
//! Background builder of vector indices for the immutable parts of a
//! merge-based table.
//!
//! ## Components
//!
//! - [`admission`]: slow-mode and fast-mode build budgets
//! - [`selector`]: picks the next (part, index) pair lacking an index
//! - [`builder`]: runs a build and classifies its [`status::BuildStatus`]
//! - [`installer`]: moves build output into a part and updates its checksums
//! - [`gate`]: reference-counted cancellation of builds
//! - [`reaper`]: removes files of dropped indices
//! - [`scheduler`]: background worker threads driving the builder

#![deny(rustdoc::broken_intra_doc_links)]

pub mod admission;
pub mod builder;
pub mod checksums;
pub mod claims;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod gate;
pub mod installer;
pub mod library;
pub mod metadata;
pub mod part;
pub mod reaper;
pub mod scheduler;
pub mod selector;
pub mod status;
pub mod storage;

pub mod prelude {
    pub use crate::builder::VectorIndexBuilder;
    pub use crate::config::{BuilderSettings, SettingsHandle};
    pub use crate::error::{PartIndexError, Result};
    pub use crate::library::{DefaultIndexLibrary, VectorIndexLibrary};
    pub use crate::metadata::{ColumnDescription, TableMetadata, VectorIndexDescription, VectorIndexKind};
    pub use crate::part::{LocalPartRegistry, PartRegistry, VectorColumn};
    pub use crate::scheduler::BuildScheduler;
    pub use crate::status::BuildStatus;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
