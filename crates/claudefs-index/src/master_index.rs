//! Sparse+dense master index.
//!
//! The master index wraps two sub-indices, one for dense chapters (the
//! non-hook index) and one for sampled names across every chapter (the
//! hook index). Each operation is routed to one or the other, or both,
//! depending on the operation and the name.
//!
//! The index is divided into zones, and in normal operation one thread
//! works on each zone. The only operation that may run on another thread
//! is [`MasterIndex::lookup_name`], which the dispatching thread uses to
//! triage sampled names before handing them to a zone. The zone locks make
//! that lookup safe; they cover the hook index only. The non-hook index is
//! touched by its zone's thread alone and is never locked here.
//!
//! Saved zone stream layout:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       8     Magic ("MI6-0001")
//! 8       4     Sparse sample rate (LE)
//! 12      ...   Non-hook zone header, hook zone header,
//!               non-hook delta lists, hook delta lists, guard
//! ```

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::buffered::{BufferedReader, BufferedWriter};
use crate::config::{IndexConfig, SplitConfig};
use crate::delta_index::DeltaIndexFactory;
use crate::delta_list::{read_saved_delta_list, write_guard_delta_list, DeltaListSaveInfo};
use crate::error::{IndexError, IndexResult};
use crate::name::ChunkName;
use crate::sub_index::{IndexStats, SubIndex, SubIndexFactory, SubRecord, MAX_ZONES};
use crate::zone::{ZoneGuard, ZoneTable};

/// Magic tag of a saved master index zone stream. The suffix is bumped when
/// the format changes.
pub const MASTER_INDEX_MAGIC: [u8; 8] = *b"MI6-0001";
/// Size of the saved master index header.
pub const MASTER_INDEX_HEADER_SIZE: usize = 12;

/// Tag of the non-hook (dense) sub-index.
pub const DENSE_TAG: u8 = b'd';
/// Tag of the hook (sparse) sub-index.
pub const SPARSE_TAG: u8 = b's';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MasterIndexHeader {
    magic: [u8; 8],
    sparse_sample_rate: u32,
}

impl MasterIndexHeader {
    fn encode(&self) -> IndexResult<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(MASTER_INDEX_HEADER_SIZE);
        buf.put_slice(&self.magic);
        buf.put_u32_le(self.sparse_sample_rate);
        if buf.len() != MASTER_INDEX_HEADER_SIZE {
            return Err(IndexError::BadState(format!(
                "{} bytes of master index header written, of {} expected",
                buf.len(),
                MASTER_INDEX_HEADER_SIZE
            )));
        }
        Ok(buf.to_vec())
    }

    fn decode(raw: &[u8]) -> IndexResult<Self> {
        if raw.len() != MASTER_INDEX_HEADER_SIZE {
            return Err(IndexError::CorruptComponent(format!(
                "master index header is {} bytes, expected {}",
                raw.len(),
                MASTER_INDEX_HEADER_SIZE
            )));
        }
        let mut buf = raw;
        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        let sparse_sample_rate = buf.get_u32_le();
        Ok(Self {
            magic,
            sparse_sample_rate,
        })
    }
}

/// Result of a triage lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterIndexTriage {
    /// The name is a sample (hook)
    pub is_sample: bool,
    /// The name was found in a chapter indexed by the hook index
    pub in_sampled_chapter: bool,
    /// Zone owning the name
    pub zone: u32,
    /// Chapter of the hook entry, when found
    pub virtual_chapter: Option<u64>,
}

/// Statistics for both halves of the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MasterIndexStats {
    /// Non-hook (dense) sub-index
    pub dense: IndexStats,
    /// Hook (sparse) sub-index
    pub sparse: IndexStats,
}

/// A record returned by [`MasterIndex::get_record`].
///
/// For a sampled name the record holds its zone's lock until it is
/// consumed by [`put`](Self::put), [`set_chapter`](Self::set_chapter),
/// [`remove`](Self::remove) or [`release`](Self::release), or dropped.
/// While holding one, the caller must not call any master index operation
/// that locks the same zone; doing so fails with `ZoneLockReentered`.
pub struct MasterIndexRecord<'a> {
    sub_index: &'a dyn SubIndex,
    record: SubRecord,
    is_sample: bool,
    zone_guard: Option<ZoneGuard<'a>>,
}

impl MasterIndexRecord<'_> {
    /// The name that was looked up.
    pub fn name(&self) -> &ChunkName {
        &self.record.name
    }

    /// Zone owning the name.
    pub fn zone(&self) -> u32 {
        self.record.zone
    }

    /// True if an entry matched the name.
    pub fn is_found(&self) -> bool {
        self.record.is_found
    }

    /// True if the matching entry carries the full name.
    pub fn is_collision(&self) -> bool {
        self.record.is_collision
    }

    /// Chapter of the matching entry.
    pub fn virtual_chapter(&self) -> u64 {
        self.record.virtual_chapter
    }

    /// True if the name is a sample and lives in the hook index.
    pub fn is_sample(&self) -> bool {
        self.is_sample
    }

    /// True while the record holds its zone's lock.
    pub fn holds_zone_lock(&self) -> bool {
        self.zone_guard
            .as_ref()
            .is_some_and(|guard| guard.is_held_by_current_thread())
    }

    /// Insert the name in `virtual_chapter`. Adds a collision entry if the
    /// record was found.
    pub fn put(self, virtual_chapter: u64) -> IndexResult<()> {
        self.sub_index.put_record(&self.record, virtual_chapter)
    }

    /// Move the found entry to `virtual_chapter`.
    pub fn set_chapter(self, virtual_chapter: u64) -> IndexResult<()> {
        self.sub_index
            .set_record_chapter(&self.record, virtual_chapter)
    }

    /// Remove the found entry.
    pub fn remove(self) -> IndexResult<()> {
        self.sub_index.remove_record(&self.record)
    }

    /// Give up the record without changing the index.
    pub fn release(self) {}
}

impl std::fmt::Debug for MasterIndexRecord<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterIndexRecord")
            .field("record", &self.record)
            .field("is_sample", &self.is_sample)
            .field("holds_zone_lock", &self.zone_guard.is_some())
            .finish()
    }
}

/// Sparse+dense master index.
pub struct MasterIndex {
    // Field order is drop order: zone locks, then non-hook, then hook.
    zones: ZoneTable,
    dense: Box<dyn SubIndex>,
    sparse: Box<dyn SubIndex>,
    sparse_sample_rate: u32,
    num_zones: u32,
}

impl MasterIndex {
    /// Build a master index backed by [`DeltaIndex`](crate::DeltaIndex) sub-indices.
    pub fn new(config: &IndexConfig, num_zones: u32, volume_nonce: u64) -> IndexResult<Self> {
        Self::with_factory(&DeltaIndexFactory, config, num_zones, volume_nonce)
    }

    /// Build a master index with sub-indices from `factory`.
    pub fn with_factory(
        factory: &dyn SubIndexFactory,
        config: &IndexConfig,
        num_zones: u32,
        volume_nonce: u64,
    ) -> IndexResult<Self> {
        let split = SplitConfig::split(config)?;
        config.validate()?;
        if num_zones == 0 || num_zones > MAX_ZONES {
            return Err(IndexError::InvalidArgument(format!(
                "zone count {} must be between 1 and {}",
                num_zones, MAX_ZONES
            )));
        }

        let zones = ZoneTable::new(num_zones);

        let dense = factory
            .build(&split.non_hook, num_zones, volume_nonce)
            .inspect_err(|e| error!(error = %e, "Error creating non hook master index"))?;
        dense.set_tag(DENSE_TAG);

        let sparse = factory
            .build(&split.hook, num_zones, volume_nonce)
            .inspect_err(|e| error!(error = %e, "Error creating hook master index"))?;
        sparse.set_tag(SPARSE_TAG);

        info!(
            num_zones,
            sample_rate = config.sparse_sample_rate,
            dense_chapters = split.non_hook.geometry.chapters_per_volume,
            sparse_chapters = config.geometry.sparse_chapters_per_volume,
            "created sparse+dense master index"
        );

        Ok(Self {
            zones,
            dense,
            sparse,
            sparse_sample_rate: config.sparse_sample_rate,
            num_zones,
        })
    }

    /// Bytes needed to save a master index with the default sub-indices.
    pub fn compute_save_bytes(config: &IndexConfig) -> IndexResult<u64> {
        Self::compute_save_bytes_with(&DeltaIndexFactory, config)
    }

    /// Bytes needed to save a master index with sub-indices from `factory`.
    pub fn compute_save_bytes_with(
        factory: &dyn SubIndexFactory,
        config: &IndexConfig,
    ) -> IndexResult<u64> {
        let split = SplitConfig::split(config)?;
        let hook_bytes = factory.compute_save_bytes(&split.hook)?;
        let non_hook_bytes = factory.compute_save_bytes(&split.non_hook)?;
        Ok(MASTER_INDEX_HEADER_SIZE as u64 + hook_bytes + non_hook_bytes)
    }

    /// One name in this many is a sample.
    pub fn sparse_sample_rate(&self) -> u32 {
        self.sparse_sample_rate
    }

    /// Number of zones.
    pub fn num_zones(&self) -> u32 {
        self.num_zones
    }

    /// True if the name is a sample (hook).
    pub fn is_sample(&self, name: &ChunkName) -> bool {
        name.is_sample(self.sparse_sample_rate)
    }

    fn sub_index(&self, name: &ChunkName) -> &dyn SubIndex {
        if self.is_sample(name) {
            self.sparse.as_ref()
        } else {
            self.dense.as_ref()
        }
    }

    /// Zone owning the name. Takes no lock.
    pub fn get_zone(&self, name: &ChunkName) -> u32 {
        self.sub_index(name).zone_for_name(name)
    }

    /// Triage a name: classify it, find its zone and, for samples, look up
    /// the hook index under the zone lock. Safe to call from any thread.
    pub fn lookup_name(&self, name: &ChunkName) -> IndexResult<MasterIndexTriage> {
        let is_sample = self.is_sample(name);
        let zone = self.get_zone(name);
        let mut triage = MasterIndexTriage {
            is_sample,
            in_sampled_chapter: false,
            zone,
            virtual_chapter: None,
        };
        if is_sample {
            let _guard = self.zones.lock(zone)?;
            if let Some(chapter) = self.sparse.lookup_name(name)? {
                triage.in_sampled_chapter = true;
                triage.virtual_chapter = Some(chapter);
            }
        }
        Ok(triage)
    }

    /// Not supported here: sampled names are looked up through
    /// [`lookup_name`](Self::lookup_name).
    pub fn lookup_sampled_name(&self, name: &ChunkName) -> IndexResult<MasterIndexTriage> {
        error!(%name, "lookup_sampled_name called on sparse+dense master index");
        Err(IndexError::BadState(
            "lookup_sampled_name should not be called on a sparse+dense master index".to_string(),
        ))
    }

    /// Find the record for a name.
    ///
    /// For a sampled name the hook index lookup can discard expired entries,
    /// so it is not read-only; the zone lock is taken and kept in the
    /// returned record until the record is consumed.
    pub fn get_record(&self, name: &ChunkName) -> IndexResult<MasterIndexRecord<'_>> {
        if self.is_sample(name) {
            let zone = self.sparse.zone_for_name(name);
            let guard = self.zones.lock(zone)?;
            let record = self.sparse.get_record(name)?;
            Ok(MasterIndexRecord {
                sub_index: self.sparse.as_ref(),
                record,
                is_sample: true,
                zone_guard: Some(guard),
            })
        } else {
            let record = self.dense.get_record(name)?;
            Ok(MasterIndexRecord {
                sub_index: self.dense.as_ref(),
                record,
                is_sample: false,
                zone_guard: None,
            })
        }
    }

    /// Advance the open chapter of every zone, one zone at a time.
    pub fn set_open_chapter(&self, virtual_chapter: u64) -> IndexResult<()> {
        for zone in 0..self.num_zones {
            self.set_zone_open_chapter(zone, virtual_chapter)?;
        }
        Ok(())
    }

    /// Advance the open chapter of one zone.
    pub fn set_zone_open_chapter(&self, zone: u32, virtual_chapter: u64) -> IndexResult<()> {
        self.dense.set_zone_open_chapter(zone, virtual_chapter)?;

        // Keep a triage lookup from seeing a half-moved chapter window.
        let _guard = self.zones.lock(zone)?;
        self.sparse.set_zone_open_chapter(zone, virtual_chapter)
    }

    /// Open chapter of one zone, as seen by the hook index.
    pub fn zone_open_chapter(&self, zone: u32) -> IndexResult<u64> {
        let _guard = self.zones.lock(zone)?;
        self.sparse.zone_open_chapter(zone)
    }

    /// Bytes used by both sub-indices. Approximate; takes no lock.
    pub fn memory_used(&self) -> u64 {
        self.dense.memory_used() + self.sparse.memory_used()
    }

    /// Counters of both sub-indices. Advisory; takes no lock.
    pub fn stats(&self) -> MasterIndexStats {
        MasterIndexStats {
            dense: self.dense.stats(),
            sparse: self.sparse.stats(),
        }
    }

    /// Write the master index header and both sub-index zone headers, and
    /// capture the zone's contents for saving.
    pub fn start_saving(&self, zone: u32, writer: &BufferedWriter) -> IndexResult<()> {
        let header = MasterIndexHeader {
            magic: MASTER_INDEX_MAGIC,
            sparse_sample_rate: self.sparse_sample_rate,
        };
        writer
            .write_all(&header.encode()?)
            .inspect_err(|e| warn!(zone, error = %e, "failed to write master index header"))?;

        self.dense.start_saving(zone, writer)?;
        let _guard = self.zones.lock(zone)?;
        self.sparse.start_saving(zone, writer)
    }

    /// True once both sub-indices have written everything for the zone.
    pub fn is_saving_done(&self, zone: u32) -> bool {
        self.dense.is_saving_done(zone) && self.sparse.is_saving_done(zone)
    }

    /// Write the rest of the zone. Stops at the first failing sub-index.
    pub fn finish_saving(&self, zone: u32) -> IndexResult<()> {
        self.dense.finish_saving(zone)?;
        self.sparse.finish_saving(zone)
    }

    /// Abandon saving the zone in both sub-indices. Returns the first error.
    pub fn abort_saving(&self, zone: u32) -> IndexResult<()> {
        let dense = self.dense.abort_saving(zone);
        let sparse = self.sparse.abort_saving(zone);
        dense.and(sparse)
    }

    /// Save one zone completely: start, finish and the closing guard.
    pub fn save_zone(&self, zone: u32, writer: &BufferedWriter) -> IndexResult<()> {
        if let Err(e) = self
            .start_saving(zone, writer)
            .and_then(|_| self.finish_saving(zone))
        {
            if let Err(abort) = self.abort_saving(zone) {
                warn!(zone, error = %abort, "failed to abort master index save");
            }
            return Err(e);
        }
        write_guard_delta_list(writer)?;
        writer.flush()?;
        debug!(zone, "saved master index zone");
        Ok(())
    }

    /// Validate the master index header of every reader, then start both
    /// sub-index restores.
    ///
    /// The first reader's sample rate is adopted; every other reader must
    /// carry the same rate.
    pub fn start_restoring(&mut self, readers: &mut [BufferedReader]) -> IndexResult<()> {
        if readers.is_empty() {
            return Err(IndexError::InvalidArgument(
                "cannot restore master index from zero readers".to_string(),
            ));
        }

        let mut sample_rate: Option<u32> = None;
        for (i, reader) in readers.iter_mut().enumerate() {
            let mut raw = [0u8; MASTER_INDEX_HEADER_SIZE];
            reader
                .read_exact(&mut raw)
                .inspect_err(|e| warn!(reader = i, error = %e, "failed to read master index header"))?;
            let header = MasterIndexHeader::decode(&raw)?;
            if header.magic != MASTER_INDEX_MAGIC {
                warn!(reader = i, "master index file had bad magic number");
                return Err(IndexError::CorruptComponent(
                    "master index file had bad magic number".to_string(),
                ));
            }
            match sample_rate {
                None => sample_rate = Some(header.sparse_sample_rate),
                Some(rate) if rate != header.sparse_sample_rate => {
                    warn!(
                        first = rate,
                        found = header.sparse_sample_rate,
                        reader = i,
                        "inconsistent sparse sample rate in master index zone files"
                    );
                    return Err(IndexError::CorruptComponent(format!(
                        "inconsistent sparse sample rate in master index zone files: {} vs. {}",
                        rate, header.sparse_sample_rate
                    )));
                }
                Some(_) => {}
            }
        }

        match sample_rate {
            Some(rate) if rate != 0 => self.sparse_sample_rate = rate,
            _ => {
                return Err(IndexError::CorruptComponent(
                    "master index file has a sparse sample rate of 0".to_string(),
                ))
            }
        }

        self.dense.start_restoring(readers)?;
        self.sparse.start_restoring(readers)
    }

    /// True once both sub-indices have received all their delta lists.
    pub fn is_restoring_done(&self) -> bool {
        self.dense.is_restoring_done() && self.sparse.is_restoring_done()
    }

    /// Restore one saved delta list into whichever sub-index accepts it,
    /// trying the non-hook index first.
    pub fn restore_delta_list(
        &mut self,
        info: &DeltaListSaveInfo,
        data: &[u8],
    ) -> IndexResult<()> {
        match self.dense.restore_delta_list(info, data) {
            Ok(()) => Ok(()),
            Err(_) => self.sparse.restore_delta_list(info, data),
        }
    }

    /// Abandon a restore in both sub-indices.
    pub fn abort_restoring(&mut self) {
        self.dense.abort_restoring();
        self.sparse.abort_restoring();
    }

    /// Restore completely from one stream per saved zone. On failure the
    /// restore is aborted and the index must be restored again before use.
    pub fn restore(&mut self, readers: &mut [BufferedReader]) -> IndexResult<()> {
        let result = self.replay(readers);
        if let Err(e) = &result {
            warn!(error = %e, "master index restore failed");
            self.abort_restoring();
        }
        result
    }

    fn replay(&mut self, readers: &mut [BufferedReader]) -> IndexResult<()> {
        self.start_restoring(readers)?;
        for reader in readers.iter_mut() {
            while let Some((info, data)) = read_saved_delta_list(reader)? {
                self.restore_delta_list(&info, &data)?;
            }
        }
        if !self.is_restoring_done() {
            return Err(IndexError::CorruptComponent(
                "saved master index is missing delta lists".to_string(),
            ));
        }
        info!(
            readers = readers.len(),
            sample_rate = self.sparse_sample_rate,
            memory_used = self.memory_used(),
            "restored master index"
        );
        Ok(())
    }
}

impl std::fmt::Debug for MasterIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterIndex")
            .field("num_zones", &self.num_zones)
            .field("sparse_sample_rate", &self.sparse_sample_rate)
            .field("dense_tag", &(self.dense.tag() as char))
            .field("sparse_tag", &(self.sparse.tag() as char))
            .finish()
    }
}
