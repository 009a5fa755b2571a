//! The part registry seam.
//!
//! The builder does not own parts. It sees them through this trait, which a
//! table engine implements; [`crate::part::LocalPartRegistry`] is the
//! directory-backed implementation shipped with the crate.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::Result;
use crate::metadata::StorageMetadataPtr;
use crate::part::data_part::{DataPart, DataPartPtr};
use crate::part::mask::RowMask;
use crate::storage::DiskPtr;

/// Shared handle to a registry.
pub type PartRegistryPtr = Arc<dyn PartRegistry>;

/// View of a table's parts and metadata.
pub trait PartRegistry: Send + Sync + std::fmt::Debug {
    /// Disk holding the table.
    fn disk(&self) -> DiskPtr;

    /// Current table metadata.
    fn metadata(&self) -> StorageMetadataPtr;

    /// Active parts, in no particular order.
    fn data_parts(&self) -> Vec<DataPartPtr>;

    /// The active part named `name`.
    fn get_active_part(&self, name: &str) -> Option<DataPartPtr>;

    /// Names of parts that take part in a running merge or mutation.
    fn currently_merging_mutating_parts(&self) -> BTreeSet<String>;

    /// True if the part takes part in a running merge or mutation.
    fn is_merging_or_mutating(&self, part_name: &str) -> bool {
        self.currently_merging_mutating_parts().contains(part_name)
    }

    /// True while this exact part object (by id) is active.
    fn is_active(&self, part: &DataPart) -> bool;

    /// The active part that replaced `part`, if any.
    fn covering_part(&self, part: &DataPart) -> Option<DataPartPtr>;

    /// Rows of `part` removed by lightweight deletes, `None` if there are none.
    fn deleted_rows(&self, part: &DataPart) -> Result<Option<RowMask>>;

    /// Run `f` while `part` is guaranteed to stay active and with the part's
    /// file lock held. Returns `Ok(false)` without calling `f` if the part is
    /// no longer active.
    ///
    /// If a merge or mutation of the part is running, this waits until it
    /// commits (then `Ok(false)`) or is cancelled. Only the part is held in
    /// place; other parts can be inserted, merged and dropped while `f` runs.
    fn with_active_part(&self, part: &DataPart, f: &mut dyn FnMut() -> Result<()>) -> Result<bool>;
}
