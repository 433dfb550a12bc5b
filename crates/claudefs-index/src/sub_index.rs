//! The single-level index interface consumed by the master index.
//!
//! A sparse+dense master index owns two sub-indices behind this trait and
//! routes each operation to one or both of them. Implementations must make
//! every individual call memory-safe under concurrent use; multi-call
//! atomicity for the sampled path is supplied by the master index's zone
//! locks.

use serde::{Deserialize, Serialize};

use crate::buffered::{BufferedReader, BufferedWriter};
use crate::config::IndexConfig;
use crate::delta_list::DeltaListSaveInfo;
use crate::error::IndexResult;
use crate::name::ChunkName;

/// Maximum number of zones an index may be divided into.
pub const MAX_ZONES: u32 = 16;

/// Counters reported by a sub-index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IndexStats {
    /// Bytes attributed to the index contents
    pub memory_allocated: u64,
    /// Entries currently stored, including collisions
    pub record_count: u64,
    /// Entries that carry a full chunk name
    pub collision_count: u64,
    /// Entries dropped because their chapter left the window
    pub discard_count: u64,
    /// Number of delta lists
    pub num_lists: u32,
}

/// Where a name stands in a sub-index, as returned by `get_record`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubRecord {
    /// The name that was looked up
    pub name: ChunkName,
    /// Zone owning the name
    pub zone: u32,
    /// True if an entry matched the name
    pub is_found: bool,
    /// True if the matching entry carries the full name
    pub is_collision: bool,
    /// Chapter of the matching entry, zero when not found
    pub virtual_chapter: u64,
}

/// Operations every sub-index provides.
pub trait SubIndex: Send + Sync {
    /// Set the single-byte tag that marks this sub-index's saved delta lists.
    fn set_tag(&self, tag: u8);

    /// The current tag.
    fn tag(&self) -> u8;

    /// Number of zones the sub-index is divided into.
    fn num_zones(&self) -> u32;

    /// Zone owning a name. Pure function of the name and configuration.
    fn zone_for_name(&self, name: &ChunkName) -> u32;

    /// Read-only lookup: the chapter of the name if it is in the live window.
    fn lookup_name(&self, name: &ChunkName) -> IndexResult<Option<u64>>;

    /// Find the entry for a name. May discard expired entries as a side effect.
    fn get_record(&self, name: &ChunkName) -> IndexResult<SubRecord>;

    /// Insert an entry for the record's name in the given chapter.
    fn put_record(&self, record: &SubRecord, virtual_chapter: u64) -> IndexResult<()>;

    /// Move a found record to another chapter.
    fn set_record_chapter(&self, record: &SubRecord, virtual_chapter: u64) -> IndexResult<()>;

    /// Remove a found record.
    fn remove_record(&self, record: &SubRecord) -> IndexResult<()>;

    /// Advance the open chapter of one zone.
    fn set_zone_open_chapter(&self, zone: u32, virtual_chapter: u64) -> IndexResult<()>;

    /// The open chapter of one zone.
    fn zone_open_chapter(&self, zone: u32) -> IndexResult<u64>;

    /// Write the zone header and capture the zone's delta lists for saving.
    fn start_saving(&self, zone: u32, writer: &BufferedWriter) -> IndexResult<()>;

    /// True once every captured delta list has been written.
    fn is_saving_done(&self, zone: u32) -> bool;

    /// Write the remaining delta lists of a zone and flush.
    fn finish_saving(&self, zone: u32) -> IndexResult<()>;

    /// Drop an in-progress save of a zone.
    fn abort_saving(&self, zone: u32) -> IndexResult<()>;

    /// Read one zone header from each reader and prepare to accept delta lists.
    fn start_restoring(&self, readers: &mut [BufferedReader]) -> IndexResult<()>;

    /// True once every delta list announced by the headers has been restored.
    fn is_restoring_done(&self) -> bool;

    /// Restore one saved delta list. Lists tagged for another index are rejected.
    fn restore_delta_list(&self, info: &DeltaListSaveInfo, data: &[u8]) -> IndexResult<()>;

    /// Abandon a restore, leaving the sub-index empty.
    fn abort_restoring(&self);

    /// Bytes attributed to the index contents.
    fn memory_used(&self) -> u64;

    /// Current counters.
    fn stats(&self) -> IndexStats;
}

/// Builds sub-indices and sizes their saved images.
pub trait SubIndexFactory: Send + Sync {
    /// Construct a sub-index for the given configuration.
    fn build(
        &self,
        config: &IndexConfig,
        num_zones: u32,
        volume_nonce: u64,
    ) -> IndexResult<Box<dyn SubIndex>>;

    /// Upper bound on the bytes needed to save every zone of a sub-index.
    fn compute_save_bytes(&self, config: &IndexConfig) -> IndexResult<u64>;
}
