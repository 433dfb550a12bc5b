//! Saved delta lists: the unit in which sub-index contents are persisted
//! and redistributed across zones on restore.
//!
//! Each list is preceded by a 12-byte save info:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       1     Tag of the owning sub-index ('z' marks the guard)
//! 1       3     Reserved (zero)
//! 4       4     List index (LE)
//! 8       4     Byte count of the list data (LE)
//! ```

use bytes::{Buf, BufMut, BytesMut};

use crate::buffered::{BufferedReader, BufferedWriter};
use crate::error::{IndexError, IndexResult};
use crate::name::{ChunkName, CHUNK_NAME_SIZE};

/// Size of an encoded save info.
pub const SAVE_INFO_SIZE: usize = 12;
/// Tag of the guard that ends a zone stream.
pub const GUARD_TAG: u8 = b'z';
/// Largest delta list accepted on restore.
pub const DELTA_LIST_MAX_BYTE_COUNT: usize = 1 << 24;

const BASE_ENTRY_SIZE: usize = 13;
/// Largest encoded entry.
pub const MAX_ENTRY_SIZE: usize = BASE_ENTRY_SIZE + CHUNK_NAME_SIZE;

const KIND_BASE: u8 = 0;
const KIND_COLLISION: u8 = 1;

/// Describes one saved delta list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaListSaveInfo {
    /// Tag of the sub-index the list belongs to
    pub tag: u8,
    /// Index of the list within its sub-index
    pub index: u32,
}

impl DeltaListSaveInfo {
    fn encode(&self, byte_count: u32) -> [u8; SAVE_INFO_SIZE] {
        let mut buf = BytesMut::with_capacity(SAVE_INFO_SIZE);
        buf.put_u8(self.tag);
        buf.put_bytes(0, 3);
        buf.put_u32_le(self.index);
        buf.put_u32_le(byte_count);
        let mut raw = [0u8; SAVE_INFO_SIZE];
        raw.copy_from_slice(&buf);
        raw
    }

    fn decode(raw: &[u8; SAVE_INFO_SIZE]) -> (Self, u32) {
        let mut buf = &raw[..];
        let tag = buf.get_u8();
        buf.advance(3);
        let index = buf.get_u32_le();
        let byte_count = buf.get_u32_le();
        (Self { tag, index }, byte_count)
    }
}

/// One entry of a delta list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaEntry {
    /// Address of the name within its list
    pub address: u32,
    /// Chapter holding the record
    pub virtual_chapter: u64,
    /// Full name, present only for collision entries
    pub collision: Option<ChunkName>,
}

impl DeltaEntry {
    /// True if this entry carries a full name.
    pub fn is_collision(&self) -> bool {
        self.collision.is_some()
    }

    fn encoded_len(&self) -> usize {
        if self.is_collision() {
            MAX_ENTRY_SIZE
        } else {
            BASE_ENTRY_SIZE
        }
    }
}

/// Encode the entries of one list.
pub fn encode_entries(entries: &[DeltaEntry]) -> Vec<u8> {
    let len = entries.iter().map(DeltaEntry::encoded_len).sum();
    let mut buf = BytesMut::with_capacity(len);
    for entry in entries {
        buf.put_u32_le(entry.address);
        buf.put_u64_le(entry.virtual_chapter);
        match entry.collision {
            Some(name) => {
                buf.put_u8(KIND_COLLISION);
                buf.put_slice(name.as_bytes());
            }
            None => buf.put_u8(KIND_BASE),
        }
    }
    buf.to_vec()
}

/// Decode the entries of one list.
pub fn decode_entries(data: &[u8]) -> IndexResult<Vec<DeltaEntry>> {
    let mut buf = data;
    let mut entries = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < BASE_ENTRY_SIZE {
            return Err(IndexError::CorruptComponent(format!(
                "truncated delta list entry: {} bytes left",
                buf.remaining()
            )));
        }
        let address = buf.get_u32_le();
        let virtual_chapter = buf.get_u64_le();
        let collision = match buf.get_u8() {
            KIND_BASE => None,
            KIND_COLLISION => {
                if buf.remaining() < CHUNK_NAME_SIZE {
                    return Err(IndexError::CorruptComponent(
                        "truncated collision name in delta list".to_string(),
                    ));
                }
                let mut name = [0u8; CHUNK_NAME_SIZE];
                buf.copy_to_slice(&mut name);
                Some(ChunkName(name))
            }
            kind => {
                return Err(IndexError::CorruptComponent(format!(
                    "unknown delta list entry kind {}",
                    kind
                )))
            }
        };
        entries.push(DeltaEntry {
            address,
            virtual_chapter,
            collision,
        });
    }
    Ok(entries)
}

/// Write one delta list preceded by its save info.
pub fn write_delta_list(
    writer: &BufferedWriter,
    info: &DeltaListSaveInfo,
    data: &[u8],
) -> IndexResult<()> {
    if data.len() > DELTA_LIST_MAX_BYTE_COUNT {
        return Err(IndexError::InvalidArgument(format!(
            "delta list {} is {} bytes, limit is {}",
            info.index,
            data.len(),
            DELTA_LIST_MAX_BYTE_COUNT
        )));
    }
    writer.write_all(&info.encode(data.len() as u32))?;
    writer.write_all(data)
}

/// Write the guard that ends the delta lists of a zone stream.
pub fn write_guard_delta_list(writer: &BufferedWriter) -> IndexResult<()> {
    let guard = DeltaListSaveInfo {
        tag: GUARD_TAG,
        index: 0,
    };
    writer.write_all(&guard.encode(0))
}

/// Read the next delta list from a zone stream. Returns `None` at the guard.
pub fn read_saved_delta_list(
    reader: &mut BufferedReader,
) -> IndexResult<Option<(DeltaListSaveInfo, Vec<u8>)>> {
    let mut raw = [0u8; SAVE_INFO_SIZE];
    reader.read_exact(&mut raw)?;
    let (info, byte_count) = DeltaListSaveInfo::decode(&raw);
    if info.tag == GUARD_TAG {
        return Ok(None);
    }
    let byte_count = byte_count as usize;
    if byte_count > DELTA_LIST_MAX_BYTE_COUNT {
        return Err(IndexError::CorruptComponent(format!(
            "delta list {} claims {} bytes, limit is {}",
            info.index, byte_count, DELTA_LIST_MAX_BYTE_COUNT
        )));
    }
    let mut data = vec![0u8; byte_count];
    reader.read_exact(&mut data)?;
    Ok(Some((info, data)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffered::SharedBuffer;
    use std::io::Cursor;

    fn sample_entries() -> Vec<DeltaEntry> {
        vec![
            DeltaEntry {
                address: 7,
                virtual_chapter: 3,
                collision: None,
            },
            DeltaEntry {
                address: 7,
                virtual_chapter: 4,
                collision: Some(ChunkName([9u8; CHUNK_NAME_SIZE])),
            },
            DeltaEntry {
                address: 12,
                virtual_chapter: 4,
                collision: None,
            },
        ]
    }

    #[test]
    fn test_entries_survive_encoding() {
        let entries = sample_entries();
        let data = encode_entries(&entries);
        assert_eq!(data.len(), 2 * BASE_ENTRY_SIZE + MAX_ENTRY_SIZE);
        assert_eq!(decode_entries(&data).unwrap(), entries);
    }

    #[test]
    fn test_truncated_entry_is_corrupt() {
        let data = encode_entries(&sample_entries());
        let err = decode_entries(&data[..data.len() - 2]).unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_unknown_entry_kind_is_corrupt() {
        let mut data = encode_entries(&sample_entries()[..1]);
        data[12] = 9;
        assert!(decode_entries(&data).unwrap_err().is_corrupt());
    }

    #[test]
    fn test_save_info_layout() {
        let info = DeltaListSaveInfo {
            tag: b'd',
            index: 0x01020304,
        };
        let raw = info.encode(0x0a0b);
        assert_eq!(raw, [b'd', 0, 0, 0, 4, 3, 2, 1, 0x0b, 0x0a, 0, 0]);
    }

    #[test]
    fn test_stream_of_lists_ends_at_guard() {
        let sink = SharedBuffer::new();
        let writer = BufferedWriter::new(sink.clone());
        let data = encode_entries(&sample_entries());
        write_delta_list(&writer, &DeltaListSaveInfo { tag: b's', index: 5 }, &data).unwrap();
        write_guard_delta_list(&writer).unwrap();
        writer.flush().unwrap();

        let mut reader = BufferedReader::new(Cursor::new(sink.contents()));
        let (info, restored) = read_saved_delta_list(&mut reader).unwrap().unwrap();
        assert_eq!(info, DeltaListSaveInfo { tag: b's', index: 5 });
        assert_eq!(restored, data);
        assert!(read_saved_delta_list(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_oversized_list_is_not_written() {
        let sink = SharedBuffer::new();
        let writer = BufferedWriter::new(sink.clone());
        let data = vec![0u8; DELTA_LIST_MAX_BYTE_COUNT + 1];
        let err = write_delta_list(&writer, &DeltaListSaveInfo { tag: b'd', index: 1 }, &data)
            .unwrap_err();
        assert!(matches!(err, IndexError::InvalidArgument(_)));
        writer.flush().unwrap();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_oversized_byte_count_is_corrupt() {
        let info = DeltaListSaveInfo { tag: b's', index: 2 };
        let mut raw = info.encode((DELTA_LIST_MAX_BYTE_COUNT + 1) as u32).to_vec();
        raw.extend_from_slice(&[1, 2, 3, 4]);
        let mut reader = BufferedReader::new(Cursor::new(raw));
        assert!(read_saved_delta_list(&mut reader).unwrap_err().is_corrupt());

        // The body was never read.
        let mut rest = [0u8; 4];
        reader.read_exact(&mut rest).unwrap();
        assert_eq!(rest, [1, 2, 3, 4]);
    }

    #[test]
    fn test_missing_guard_is_corrupt() {
        let mut reader = BufferedReader::new(Cursor::new(Vec::new()));
        assert!(read_saved_delta_list(&mut reader).unwrap_err().is_corrupt());
    }
}
