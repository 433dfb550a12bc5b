//! Chunk names: fixed-size content fingerprints used as index keys.

use serde::{Deserialize, Serialize};

/// Size of a chunk name in bytes.
pub const CHUNK_NAME_SIZE: usize = 16;

const MASTER_INDEX_BYTES_OFFSET: usize = 0;
const SAMPLING_BYTES_OFFSET: usize = 14;

/// A 16-byte content fingerprint identifying a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkName(pub [u8; CHUNK_NAME_SIZE]);

impl ChunkName {
    /// Derive a chunk name from content: the leading bytes of its BLAKE3 hash.
    pub fn from_data(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        let mut name = [0u8; CHUNK_NAME_SIZE];
        name.copy_from_slice(&hash.as_bytes()[..CHUNK_NAME_SIZE]);
        ChunkName(name)
    }

    /// Return the raw bytes
    pub fn as_bytes(&self) -> &[u8; CHUNK_NAME_SIZE] {
        &self.0
    }

    /// Return the name as a lowercase hex string
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Bytes used to place the name within a delta list and zone.
    pub fn master_index_bytes(&self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.0[MASTER_INDEX_BYTES_OFFSET..MASTER_INDEX_BYTES_OFFSET + 8]);
        u64::from_be_bytes(raw)
    }

    /// Bytes used to decide whether the name is a sample.
    pub fn sampling_bytes(&self) -> u32 {
        u16::from_be_bytes([
            self.0[SAMPLING_BYTES_OFFSET],
            self.0[SAMPLING_BYTES_OFFSET + 1],
        ]) as u32
    }

    /// True if this name is sampled at the given rate.
    ///
    /// A zero rate is rejected when the index is configured, so it never
    /// reaches this point.
    pub fn is_sample(&self, sample_rate: u32) -> bool {
        self.sampling_bytes() % sample_rate == 0
    }
}

impl From<[u8; CHUNK_NAME_SIZE]> for ChunkName {
    fn from(bytes: [u8; CHUNK_NAME_SIZE]) -> Self {
        ChunkName(bytes)
    }
}

impl std::fmt::Display for ChunkName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn name_with_sampling(value: u16) -> ChunkName {
        let mut raw = [0xabu8; CHUNK_NAME_SIZE];
        raw[14..16].copy_from_slice(&value.to_be_bytes());
        ChunkName(raw)
    }

    #[test]
    fn test_from_data_is_deterministic() {
        assert_eq!(ChunkName::from_data(b"block"), ChunkName::from_data(b"block"));
        assert_ne!(ChunkName::from_data(b"block"), ChunkName::from_data(b"other"));
    }

    #[test]
    fn test_sampling_bytes_are_trailing_big_endian() {
        let name = name_with_sampling(0x1234);
        assert_eq!(name.sampling_bytes(), 0x1234);
    }

    #[test]
    fn test_master_index_bytes_are_leading_big_endian() {
        let mut raw = [0u8; CHUNK_NAME_SIZE];
        raw[..8].copy_from_slice(&0x0102030405060708u64.to_be_bytes());
        assert_eq!(ChunkName(raw).master_index_bytes(), 0x0102030405060708);
    }

    #[test]
    fn test_sample_classification() {
        assert!(name_with_sampling(320).is_sample(32));
        assert!(!name_with_sampling(321).is_sample(32));
        assert!(name_with_sampling(0).is_sample(7));
        assert!(name_with_sampling(5).is_sample(1));
    }

    #[test]
    fn test_hex_display() {
        let name = ChunkName([0x0f; CHUNK_NAME_SIZE]);
        assert_eq!(format!("{}", name), "0f".repeat(CHUNK_NAME_SIZE));
    }

    proptest! {
        #[test]
        fn test_is_sample_matches_projection(
            raw in prop::array::uniform16(any::<u8>()),
            rate in 1u32..=1024,
        ) {
            let name = ChunkName(raw);
            let expected = name.sampling_bytes() % rate == 0;
            prop_assert_eq!(name.is_sample(rate), expected);
            prop_assert_eq!(name.is_sample(rate), name.is_sample(rate));
        }
    }
}
