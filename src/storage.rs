//! Storage abstraction layer.
//!
//! Every file the builder touches goes through the [`Disk`] trait, addressed by
//! `/`-separated paths relative to the disk root (the table directory). The
//! local file-system backend is [`file::LocalDisk`].
//!
//! # Example
//!
//! ```
//! use partindex::storage::{Disk, DiskConfig};
//! use partindex::storage::file::LocalDisk;
//!
//! # fn main() -> partindex::error::Result<()> {
//! let dir = std::env::temp_dir().join("partindex_storage_doc");
//! let disk = LocalDisk::new(&dir, DiskConfig::default())?;
//! disk.create_directories("all_1_1_0")?;
//! disk.write_file_atomic("all_1_1_0/part.json", b"{}")?;
//! assert!(disk.exists("all_1_1_0/part.json"));
//! # disk.remove_recursive("all_1_1_0")?;
//! # Ok(())
//! # }
//! ```

pub mod file;
pub mod traits;

pub use traits::{Disk, DiskPtr, join_path};

/// Configuration for disk backends.
#[derive(Debug, Clone)]
pub struct DiskConfig {
    /// Whether to fsync files and directories after writes.
    pub sync_writes: bool,

    /// Buffer size for file I/O.
    pub buffer_size: usize,
}

impl Default for DiskConfig {
    fn default() -> Self {
        DiskConfig {
            sync_writes: true,
            buffer_size: 65536,
        }
    }
}
