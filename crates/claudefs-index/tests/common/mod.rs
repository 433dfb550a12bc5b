//! Shared helpers for claudefs-index integration tests.

#![allow(dead_code)]

use std::io::Cursor;

use claudefs_index::{
    BufferedReader, BufferedWriter, ChunkName, Geometry, IndexConfig, MasterIndex, SharedBuffer,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Nonce shared by every index built in these tests.
pub const NONCE: u64 = 0x5eed_cafe;

/// Install a test-friendly subscriber once per process. Honors RUST_LOG.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .try_init();
}

/// 64 chapters, 48 of them sparse, one name in eight sampled.
pub fn small_config() -> IndexConfig {
    IndexConfig::new(
        Geometry {
            chapters_per_volume: 64,
            sparse_chapters_per_volume: 48,
            records_per_chapter: 1024,
        },
        8,
    )
}

pub fn names(count: u64) -> Vec<ChunkName> {
    (0..count)
        .map(|seed| ChunkName::from_data(&seed.to_le_bytes()))
        .collect()
}

/// Save every zone into its own in-memory stream.
pub fn save_all(index: &MasterIndex) -> Vec<Vec<u8>> {
    (0..index.num_zones())
        .map(|zone| {
            let sink = SharedBuffer::new();
            let writer = BufferedWriter::new(sink.clone());
            index.save_zone(zone, &writer).unwrap();
            sink.contents()
        })
        .collect()
}

pub fn readers(streams: &[Vec<u8>]) -> Vec<BufferedReader> {
    streams
        .iter()
        .map(|bytes| BufferedReader::new(Cursor::new(bytes.clone())))
        .collect()
}
