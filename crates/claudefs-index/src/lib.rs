#![warn(missing_docs)]

//! ClaudeFS index subsystem: sparse+dense dedupe master index
//!
//! This crate maps chunk names to the chapters that hold them. A small,
//! deterministic sample of names (hooks) is indexed across every chapter
//! of the volume, while all other names are indexed only for the recent
//! dense chapters. The index is divided into zones, each owned by one
//! worker thread, with per-zone locks letting a dispatcher thread triage
//! sampled names concurrently. Zones are saved to and restored from
//! byte streams, and a saved index can be restored with a different
//! number of zones.

pub mod buffered;
pub mod config;
pub mod delta_index;
pub mod delta_list;
pub mod error;
pub mod master_index;
pub mod name;
pub mod sub_index;
pub mod zone;

pub use buffered::{BufferedReader, BufferedWriter, SharedBuffer};
pub use config::{Geometry, IndexConfig, SplitConfig};
pub use delta_index::{DeltaIndex, DeltaIndexFactory};
pub use delta_list::{read_saved_delta_list, write_guard_delta_list, DeltaListSaveInfo};
pub use error::{IndexError, IndexResult};
pub use master_index::{
    MasterIndex, MasterIndexRecord, MasterIndexStats, MasterIndexTriage, DENSE_TAG,
    MASTER_INDEX_HEADER_SIZE, MASTER_INDEX_MAGIC, SPARSE_TAG,
};
pub use name::{ChunkName, CHUNK_NAME_SIZE};
pub use sub_index::{IndexStats, SubIndex, SubIndexFactory, SubRecord, MAX_ZONES};
pub use zone::{ZoneGuard, ZoneTable};
