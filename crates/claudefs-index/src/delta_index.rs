//! In-memory delta-list sub-index.
//!
//! Names are hashed onto a fixed number of delta lists, and the lists are
//! split contiguously across zones. Within a list, entries are kept sorted
//! by address; an address group starts with a plain entry and may be
//! followed by collision entries carrying the full name.
//!
//! Each zone indexes a window of chapters ending at its open chapter.
//! Entries that fall out of the window are discarded lazily the next time
//! their list is fetched through `get_record`, and eagerly when a zone is
//! saved.

use std::sync::atomic::{AtomicU8, Ordering};

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::buffered::{BufferedReader, BufferedWriter};
use crate::config::{Geometry, IndexConfig};
use crate::delta_list::{
    decode_entries, encode_entries, write_delta_list, DeltaEntry, DeltaListSaveInfo,
    MAX_ENTRY_SIZE, SAVE_INFO_SIZE,
};
use crate::error::{IndexError, IndexResult};
use crate::name::ChunkName;
use crate::sub_index::{IndexStats, SubIndex, SubIndexFactory, SubRecord, MAX_ZONES};

/// Magic tag of a saved delta index zone header.
pub const DELTA_INDEX_MAGIC: [u8; 8] = *b"DXI-0001";
/// Size of a saved delta index zone header.
pub const DELTA_INDEX_HEADER_SIZE: usize = 56;

/// Mean number of records per delta list.
const RECORDS_PER_DELTA_LIST: u64 = 1024;

const LIST_OVERHEAD_BYTES: u64 = 16;
const BYTES_PER_RECORD: u64 = 8;
const BYTES_PER_COLLISION: u64 = 16;

/// Number of delta lists for a geometry. Independent of the zone count so
/// that saved lists can be redistributed to a different number of zones.
pub fn delta_lists_for_geometry(geometry: &Geometry) -> u32 {
    let lists = geometry.records_per_volume() / RECORDS_PER_DELTA_LIST;
    lists.clamp(MAX_ZONES as u64, u32::MAX as u64) as u32
}

/// Saved header of one zone of a delta index.
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       8     Magic ("DXI-0001")
/// 8       1     Tag
/// 9       3     Reserved (zero)
/// 12      8     Volume nonce
/// 20      8     Open chapter
/// 28      4     Zone number
/// 32      4     Zone count
/// 36      4     First list of the zone
/// 40      4     Lists in the zone
/// 44      4     Total lists in the index
/// 48      8     Entries the zone has discarded
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ZoneHeader {
    magic: [u8; 8],
    tag: u8,
    volume_nonce: u64,
    open_chapter: u64,
    zone: u32,
    num_zones: u32,
    first_list: u32,
    num_lists: u32,
    total_lists: u32,
    discard_count: u64,
}

impl ZoneHeader {
    fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(DELTA_INDEX_HEADER_SIZE);
        buf.put_slice(&self.magic);
        buf.put_u8(self.tag);
        buf.put_bytes(0, 3);
        buf.put_u64_le(self.volume_nonce);
        buf.put_u64_le(self.open_chapter);
        buf.put_u32_le(self.zone);
        buf.put_u32_le(self.num_zones);
        buf.put_u32_le(self.first_list);
        buf.put_u32_le(self.num_lists);
        buf.put_u32_le(self.total_lists);
        buf.put_u64_le(self.discard_count);
        buf.to_vec()
    }

    fn decode(raw: &[u8; DELTA_INDEX_HEADER_SIZE]) -> Self {
        let mut buf = &raw[..];
        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        let tag = buf.get_u8();
        buf.advance(3);
        Self {
            magic,
            tag,
            volume_nonce: buf.get_u64_le(),
            open_chapter: buf.get_u64_le(),
            zone: buf.get_u32_le(),
            num_zones: buf.get_u32_le(),
            first_list: buf.get_u32_le(),
            num_lists: buf.get_u32_le(),
            total_lists: buf.get_u32_le(),
            discard_count: buf.get_u64_le(),
        }
    }
}

struct PendingSave {
    writer: BufferedWriter,
    lists: Vec<(u32, Vec<u8>)>,
}

struct DeltaZone {
    first_list: u32,
    lists: Vec<Vec<DeltaEntry>>,
    open_chapter: u64,
    record_count: u64,
    collision_count: u64,
    discard_count: u64,
    save: Option<PendingSave>,
}

impl DeltaZone {
    fn new(first_list: u32, num_lists: u32) -> Self {
        Self {
            first_list,
            lists: vec![Vec::new(); num_lists as usize],
            open_chapter: 0,
            record_count: 0,
            collision_count: 0,
            discard_count: 0,
            save: None,
        }
    }

    fn clear(&mut self) {
        for list in &mut self.lists {
            list.clear();
        }
        self.record_count = 0;
        self.collision_count = 0;
        self.discard_count = 0;
        self.save = None;
    }

    /// Apply `f` to one list, keeping the zone counters in step.
    fn with_list<T>(&mut self, list: u32, f: impl FnOnce(&mut Vec<DeltaEntry>) -> T) -> T {
        let entries = &mut self.lists[(list - self.first_list) as usize];
        let (records, collisions) = count_entries(entries);
        let result = f(entries);
        normalize_groups(entries);
        let (new_records, new_collisions) = count_entries(entries);
        self.record_count = self.record_count - records + new_records;
        self.collision_count = self.collision_count - collisions + new_collisions;
        result
    }

    fn list(&self, list: u32) -> &[DeltaEntry] {
        &self.lists[(list - self.first_list) as usize]
    }

    /// Drop entries of one list whose chapter is below `low_chapter`.
    fn prune_list(&mut self, list: u32, low_chapter: u64) {
        let discarded = self.with_list(list, |entries| {
            let before = entries.len();
            entries.retain(|e| e.virtual_chapter >= low_chapter);
            (before - entries.len()) as u64
        });
        self.discard_count += discarded;
    }
}

fn count_entries(entries: &[DeltaEntry]) -> (u64, u64) {
    let collisions = entries.iter().filter(|e| e.is_collision()).count() as u64;
    (entries.len() as u64, collisions)
}

/// Every address group must start with a plain entry. A group that lost its
/// plain entry promotes its first collision.
fn normalize_groups(entries: &mut [DeltaEntry]) {
    let mut previous: Option<u32> = None;
    for entry in entries.iter_mut() {
        if previous != Some(entry.address) {
            entry.collision = None;
            previous = Some(entry.address);
        }
    }
}

/// Position of the entry matching `name`: a collision carrying the name if
/// there is one, else the plain entry at the address.
fn find_entry(entries: &[DeltaEntry], address: u32, name: &ChunkName) -> Option<usize> {
    let start = entries.partition_point(|e| e.address < address);
    let end = start + entries[start..].partition_point(|e| e.address == address);
    if start == end {
        return None;
    }
    entries[start..end]
        .iter()
        .position(|e| e.collision.as_ref() == Some(name))
        .map(|offset| start + offset)
        .or(Some(start))
}

struct RestoreProgress {
    restored: Vec<bool>,
    remaining: u32,
}

/// A zoned, in-memory delta-list index over one chapter window.
pub struct DeltaIndex {
    tag: AtomicU8,
    volume_nonce: u64,
    num_zones: u32,
    num_lists: u32,
    lists_per_zone: u32,
    chapters_per_volume: u32,
    zones: Vec<Mutex<DeltaZone>>,
    restore: Mutex<Option<RestoreProgress>>,
}

impl DeltaIndex {
    /// Create an empty index for the given configuration.
    pub fn new(config: &IndexConfig, num_zones: u32, volume_nonce: u64) -> IndexResult<Self> {
        if num_zones == 0 || num_zones > MAX_ZONES {
            return Err(IndexError::InvalidArgument(format!(
                "zone count {} must be between 1 and {}",
                num_zones, MAX_ZONES
            )));
        }
        if config.geometry.chapters_per_volume == 0 {
            return Err(IndexError::InvalidArgument(
                "delta index needs at least one chapter".to_string(),
            ));
        }

        let num_lists = delta_lists_for_geometry(&config.geometry);
        let lists_per_zone = num_lists / num_zones;
        let zones = (0..num_zones)
            .map(|zone| {
                let first = zone * lists_per_zone;
                let end = if zone + 1 == num_zones {
                    num_lists
                } else {
                    first + lists_per_zone
                };
                Mutex::new(DeltaZone::new(first, end - first))
            })
            .collect();

        debug!(
            num_zones,
            num_lists,
            chapters = config.geometry.chapters_per_volume,
            records_per_chapter = config.geometry.records_per_chapter,
            "created delta index"
        );

        Ok(Self {
            tag: AtomicU8::new(b'?'),
            volume_nonce,
            num_zones,
            num_lists,
            lists_per_zone,
            chapters_per_volume: config.geometry.chapters_per_volume,
            zones,
            restore: Mutex::new(None),
        })
    }

    /// Number of delta lists.
    pub fn num_lists(&self) -> u32 {
        self.num_lists
    }

    fn list_for_name(&self, name: &ChunkName) -> u32 {
        (name.master_index_bytes() % self.num_lists as u64) as u32
    }

    fn address_for_name(&self, name: &ChunkName) -> u32 {
        (name.master_index_bytes() / self.num_lists as u64) as u32
    }

    fn zone_for_list(&self, list: u32) -> u32 {
        (list / self.lists_per_zone).min(self.num_zones - 1)
    }

    fn zone(&self, zone: u32) -> IndexResult<&Mutex<DeltaZone>> {
        self.zones.get(zone as usize).ok_or(IndexError::ZoneOutOfRange {
            zone,
            num_zones: self.num_zones,
        })
    }

    fn low_chapter(&self, open_chapter: u64) -> u64 {
        open_chapter.saturating_sub(self.chapters_per_volume as u64 - 1)
    }

    fn check_chapter(&self, zone: &DeltaZone, virtual_chapter: u64) -> IndexResult<()> {
        let low = self.low_chapter(zone.open_chapter);
        if virtual_chapter < low || virtual_chapter > zone.open_chapter {
            return Err(IndexError::InvalidArgument(format!(
                "chapter {} is outside the indexed window {}..={}",
                virtual_chapter, low, zone.open_chapter
            )));
        }
        Ok(())
    }

    fn require_found(record: &SubRecord) -> IndexResult<()> {
        if !record.is_found {
            return Err(IndexError::BadState(format!(
                "no entry for {} to modify",
                record.name
            )));
        }
        Ok(())
    }
}

impl SubIndex for DeltaIndex {
    fn set_tag(&self, tag: u8) {
        self.tag.store(tag, Ordering::Relaxed);
    }

    fn tag(&self) -> u8 {
        self.tag.load(Ordering::Relaxed)
    }

    fn num_zones(&self) -> u32 {
        self.num_zones
    }

    fn zone_for_name(&self, name: &ChunkName) -> u32 {
        self.zone_for_list(self.list_for_name(name))
    }

    fn lookup_name(&self, name: &ChunkName) -> IndexResult<Option<u64>> {
        let list = self.list_for_name(name);
        let address = self.address_for_name(name);
        let zone = self.zone(self.zone_for_list(list))?.lock();
        let low = self.low_chapter(zone.open_chapter);
        let entries = zone.list(list);
        Ok(find_entry(entries, address, name)
            .map(|i| entries[i].virtual_chapter)
            .filter(|chapter| *chapter >= low))
    }

    fn get_record(&self, name: &ChunkName) -> IndexResult<SubRecord> {
        let list = self.list_for_name(name);
        let address = self.address_for_name(name);
        let zone_number = self.zone_for_list(list);
        let mut zone = self.zone(zone_number)?.lock();
        let low = self.low_chapter(zone.open_chapter);
        zone.prune_list(list, low);

        let entries = zone.list(list);
        let found = find_entry(entries, address, name).map(|i| entries[i]);
        Ok(SubRecord {
            name: *name,
            zone: zone_number,
            is_found: found.is_some(),
            is_collision: found.is_some_and(|e| e.is_collision()),
            virtual_chapter: found.map_or(0, |e| e.virtual_chapter),
        })
    }

    fn put_record(&self, record: &SubRecord, virtual_chapter: u64) -> IndexResult<()> {
        let list = self.list_for_name(&record.name);
        let address = self.address_for_name(&record.name);
        let mut zone = self.zone(self.zone_for_list(list))?.lock();
        self.check_chapter(&zone, virtual_chapter)?;
        let low = self.low_chapter(zone.open_chapter);
        zone.prune_list(list, low);

        zone.with_list(list, |entries| {
            let start = entries.partition_point(|e| e.address < address);
            let end = start + entries[start..].partition_point(|e| e.address == address);
            if entries[start..end]
                .iter()
                .any(|e| e.collision == Some(record.name))
            {
                return Err(IndexError::BadState(format!(
                    "{} is already indexed",
                    record.name
                )));
            }
            let collision = (start != end).then_some(record.name);
            entries.insert(
                end,
                DeltaEntry {
                    address,
                    virtual_chapter,
                    collision,
                },
            );
            Ok(())
        })
    }

    fn set_record_chapter(&self, record: &SubRecord, virtual_chapter: u64) -> IndexResult<()> {
        Self::require_found(record)?;
        let list = self.list_for_name(&record.name);
        let address = self.address_for_name(&record.name);
        let mut zone = self.zone(self.zone_for_list(list))?.lock();
        self.check_chapter(&zone, virtual_chapter)?;

        zone.with_list(list, |entries| match find_entry(entries, address, &record.name) {
            Some(i) => {
                entries[i].virtual_chapter = virtual_chapter;
                Ok(())
            }
            None => Err(IndexError::BadState(format!(
                "entry for {} is no longer present",
                record.name
            ))),
        })
    }

    fn remove_record(&self, record: &SubRecord) -> IndexResult<()> {
        Self::require_found(record)?;
        let list = self.list_for_name(&record.name);
        let address = self.address_for_name(&record.name);
        let mut zone = self.zone(self.zone_for_list(list))?.lock();

        zone.with_list(list, |entries| match find_entry(entries, address, &record.name) {
            Some(i) => {
                entries.remove(i);
                Ok(())
            }
            None => Err(IndexError::BadState(format!(
                "entry for {} is no longer present",
                record.name
            ))),
        })
    }

    fn set_zone_open_chapter(&self, zone: u32, virtual_chapter: u64) -> IndexResult<()> {
        let mut state = self.zone(zone)?.lock();
        state.open_chapter = virtual_chapter;
        debug!(
            tag = %(self.tag() as char),
            zone,
            virtual_chapter,
            "set zone open chapter"
        );
        Ok(())
    }

    fn zone_open_chapter(&self, zone: u32) -> IndexResult<u64> {
        Ok(self.zone(zone)?.lock().open_chapter)
    }

    fn start_saving(&self, zone: u32, writer: &BufferedWriter) -> IndexResult<()> {
        let mut state = self.zone(zone)?.lock();
        if state.save.is_some() {
            return Err(IndexError::BadState(format!(
                "zone {} is already being saved",
                zone
            )));
        }

        let low = self.low_chapter(state.open_chapter);
        let first_list = state.first_list;
        let num_lists = state.lists.len() as u32;
        for list in first_list..first_list + num_lists {
            state.prune_list(list, low);
        }

        let header = ZoneHeader {
            magic: DELTA_INDEX_MAGIC,
            tag: self.tag(),
            volume_nonce: self.volume_nonce,
            open_chapter: state.open_chapter,
            zone,
            num_zones: self.num_zones,
            first_list,
            num_lists,
            total_lists: self.num_lists,
            discard_count: state.discard_count,
        };
        writer.write_all(&header.encode())?;

        let lists = state
            .lists
            .iter()
            .enumerate()
            .map(|(i, entries)| (first_list + i as u32, encode_entries(entries)))
            .collect();
        state.save = Some(PendingSave {
            writer: writer.clone(),
            lists,
        });
        Ok(())
    }

    fn is_saving_done(&self, zone: u32) -> bool {
        match self.zone(zone) {
            Ok(state) => state
                .lock()
                .save
                .as_ref()
                .is_none_or(|save| save.lists.is_empty()),
            Err(_) => true,
        }
    }

    fn finish_saving(&self, zone: u32) -> IndexResult<()> {
        let pending = self.zone(zone)?.lock().save.take();
        let Some(pending) = pending else {
            return Ok(());
        };
        let tag = self.tag();
        for (index, data) in &pending.lists {
            write_delta_list(&pending.writer, &DeltaListSaveInfo { tag, index: *index }, data)?;
        }
        pending.writer.flush()?;
        debug!(
            tag = %(tag as char),
            zone,
            lists = pending.lists.len(),
            "saved delta index zone"
        );
        Ok(())
    }

    fn abort_saving(&self, zone: u32) -> IndexResult<()> {
        self.zone(zone)?.lock().save = None;
        Ok(())
    }

    fn start_restoring(&self, readers: &mut [BufferedReader]) -> IndexResult<()> {
        let tag = self.tag();
        let mut covered = vec![false; self.num_lists as usize];
        let mut open_chapter = 0u64;
        let mut discard_count = 0u64;

        for (i, reader) in readers.iter_mut().enumerate() {
            let mut raw = [0u8; DELTA_INDEX_HEADER_SIZE];
            reader.read_exact(&mut raw)?;
            let header = ZoneHeader::decode(&raw);

            if header.magic != DELTA_INDEX_MAGIC {
                warn!(reader = i, "delta index zone file had bad magic number");
                return Err(IndexError::CorruptComponent(
                    "delta index zone file had bad magic number".to_string(),
                ));
            }
            if header.tag != tag {
                return Err(IndexError::CorruptComponent(format!(
                    "delta index zone file is tagged {:?}, expected {:?}",
                    header.tag as char, tag as char
                )));
            }
            if header.volume_nonce != self.volume_nonce {
                return Err(IndexError::CorruptComponent(format!(
                    "delta index zone file has nonce {:#x}, expected {:#x}",
                    header.volume_nonce, self.volume_nonce
                )));
            }
            if header.total_lists != self.num_lists {
                return Err(IndexError::CorruptComponent(format!(
                    "delta index zone file has {} lists, expected {}",
                    header.total_lists, self.num_lists
                )));
            }
            let end = header.first_list as u64 + header.num_lists as u64;
            if end > self.num_lists as u64 {
                return Err(IndexError::CorruptComponent(format!(
                    "delta index zone {} lists {}..{} exceed {}",
                    header.zone, header.first_list, end, self.num_lists
                )));
            }
            for list in header.first_list..end as u32 {
                if std::mem::replace(&mut covered[list as usize], true) {
                    return Err(IndexError::CorruptComponent(format!(
                        "delta list {} appears in more than one zone file",
                        list
                    )));
                }
            }
            open_chapter = open_chapter.max(header.open_chapter);
            discard_count += header.discard_count;
        }

        if let Some(missing) = covered.iter().position(|c| !c) {
            return Err(IndexError::CorruptComponent(format!(
                "no zone file covers delta list {}",
                missing
            )));
        }

        let mut progress = self.restore.lock();
        for zone in &self.zones {
            let mut zone = zone.lock();
            zone.clear();
            zone.open_chapter = open_chapter;
        }
        // Saved discards are not tied to lists; zone 0 carries the total.
        if let Some(first) = self.zones.first() {
            first.lock().discard_count = discard_count;
        }
        *progress = Some(RestoreProgress {
            restored: vec![false; self.num_lists as usize],
            remaining: self.num_lists,
        });
        debug!(
            tag = %(tag as char),
            readers = readers.len(),
            open_chapter,
            "started restoring delta index"
        );
        Ok(())
    }

    fn is_restoring_done(&self) -> bool {
        self.restore
            .lock()
            .as_ref()
            .is_none_or(|progress| progress.remaining == 0)
    }

    fn restore_delta_list(&self, info: &DeltaListSaveInfo, data: &[u8]) -> IndexResult<()> {
        let tag = self.tag();
        if info.tag != tag {
            return Err(IndexError::CorruptComponent(format!(
                "delta list tagged {:?} does not belong to index tagged {:?}",
                info.tag as char, tag as char
            )));
        }

        let mut guard = self.restore.lock();
        let progress = guard
            .as_mut()
            .ok_or_else(|| IndexError::BadState("no delta index restore in progress".to_string()))?;
        if info.index >= self.num_lists {
            return Err(IndexError::CorruptComponent(format!(
                "delta list index {} exceeds {}",
                info.index, self.num_lists
            )));
        }
        if progress.restored[info.index as usize] {
            return Err(IndexError::CorruptComponent(format!(
                "delta list {} restored twice",
                info.index
            )));
        }

        let entries = decode_entries(data)?;
        if entries.windows(2).any(|w| w[0].address > w[1].address) {
            return Err(IndexError::CorruptComponent(format!(
                "delta list {} is not sorted",
                info.index
            )));
        }
        let mut zone = self.zone(self.zone_for_list(info.index))?.lock();
        zone.with_list(info.index, |list| *list = entries);

        progress.restored[info.index as usize] = true;
        progress.remaining -= 1;
        if progress.remaining == 0 {
            *guard = None;
            info!(tag = %(tag as char), lists = self.num_lists, "restored delta index");
        }
        Ok(())
    }

    fn abort_restoring(&self) {
        let mut progress = self.restore.lock();
        *progress = None;
        for zone in &self.zones {
            zone.lock().clear();
        }
    }

    fn memory_used(&self) -> u64 {
        self.stats().memory_allocated
    }

    fn stats(&self) -> IndexStats {
        let mut stats = IndexStats {
            num_lists: self.num_lists,
            ..IndexStats::default()
        };
        for zone in &self.zones {
            let zone = zone.lock();
            stats.record_count += zone.record_count;
            stats.collision_count += zone.collision_count;
            stats.discard_count += zone.discard_count;
        }
        stats.memory_allocated = self.num_lists as u64 * LIST_OVERHEAD_BYTES
            + stats.record_count * BYTES_PER_RECORD
            + stats.collision_count * BYTES_PER_COLLISION;
        stats
    }
}

/// Builds [`DeltaIndex`] sub-indices.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaIndexFactory;

impl SubIndexFactory for DeltaIndexFactory {
    fn build(
        &self,
        config: &IndexConfig,
        num_zones: u32,
        volume_nonce: u64,
    ) -> IndexResult<Box<dyn SubIndex>> {
        Ok(Box::new(DeltaIndex::new(config, num_zones, volume_nonce)?))
    }

    fn compute_save_bytes(&self, config: &IndexConfig) -> IndexResult<u64> {
        let lists = delta_lists_for_geometry(&config.geometry) as u64;
        Ok(MAX_ZONES as u64 * DELTA_INDEX_HEADER_SIZE as u64
            + lists * SAVE_INFO_SIZE as u64
            + config.geometry.records_per_volume() * MAX_ENTRY_SIZE as u64)
    }
}
