//! Index geometry and configuration, including the hook/non-hook split.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{IndexError, IndexResult};

/// Default number of chapters kept in a volume.
pub const DEFAULT_CHAPTERS_PER_VOLUME: u32 = 1024;
/// Default number of records indexed per chapter.
pub const DEFAULT_RECORDS_PER_CHAPTER: u32 = 65536;
/// Default sparse sample rate.
pub const DEFAULT_SPARSE_SAMPLE_RATE: u32 = 32;

/// Chapter geometry of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Total number of chapters in the volume
    pub chapters_per_volume: u32,
    /// Number of chapters indexed only through sampled names
    pub sparse_chapters_per_volume: u32,
    /// Number of records in each chapter
    pub records_per_chapter: u32,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            chapters_per_volume: DEFAULT_CHAPTERS_PER_VOLUME,
            sparse_chapters_per_volume: 0,
            records_per_chapter: DEFAULT_RECORDS_PER_CHAPTER,
        }
    }
}

impl Geometry {
    /// True if some chapters are indexed sparsely.
    pub fn is_sparse(&self) -> bool {
        self.sparse_chapters_per_volume > 0
    }

    /// Number of chapters indexed at full density.
    pub fn dense_chapters_per_volume(&self) -> u32 {
        self.chapters_per_volume
            .saturating_sub(self.sparse_chapters_per_volume)
    }

    /// Maximum number of records the geometry can index.
    pub fn records_per_volume(&self) -> u64 {
        self.records_per_chapter as u64 * self.chapters_per_volume as u64
    }
}

/// Global index configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Chapter geometry
    pub geometry: Geometry,
    /// One name in this many is a sample (hook)
    pub sparse_sample_rate: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            geometry: Geometry::default(),
            sparse_sample_rate: DEFAULT_SPARSE_SAMPLE_RATE,
        }
    }
}

impl IndexConfig {
    /// Create a configuration from a geometry and sample rate.
    pub fn new(geometry: Geometry, sparse_sample_rate: u32) -> Self {
        Self {
            geometry,
            sparse_sample_rate,
        }
    }

    /// Load a configuration from a `.json` or `.toml` file.
    pub fn from_file(path: &Path) -> IndexResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: IndexConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| IndexError::Config(e.to_string()))?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| IndexError::Config(e.to_string()))?
            }
            _ => {
                return Err(IndexError::Config(format!(
                    "unsupported config file extension: {:?}",
                    ext
                )))
            }
        };
        config.validate()?;
        debug!(path = %path.display(), ?config, "loaded index config");
        Ok(config)
    }

    /// Checks that the geometry describes a usable volume.
    pub fn validate(&self) -> IndexResult<()> {
        let geometry = &self.geometry;
        if geometry.chapters_per_volume == 0 {
            return Err(IndexError::InvalidArgument(
                "chapters_per_volume must be non-zero".to_string(),
            ));
        }
        if geometry.records_per_chapter == 0 {
            return Err(IndexError::InvalidArgument(
                "records_per_chapter must be non-zero".to_string(),
            ));
        }
        if geometry.sparse_chapters_per_volume >= geometry.chapters_per_volume {
            return Err(IndexError::InvalidArgument(format!(
                "sparse_chapters_per_volume {} must be less than chapters_per_volume {}",
                geometry.sparse_chapters_per_volume, geometry.chapters_per_volume
            )));
        }
        Ok(())
    }
}

/// Configurations for the two halves of a sparse+dense index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitConfig {
    /// Describes the hook (sampled) part of the index
    pub hook: IndexConfig,
    /// Describes the non-hook part of the index
    pub non_hook: IndexConfig,
}

impl SplitConfig {
    /// Derive the hook and non-hook configurations from a global one.
    ///
    /// The hook index keeps every chapter but only the sampled share of
    /// each chapter's records. The non-hook index keeps the remaining
    /// records for the dense chapters only. Neither half is sparse itself.
    pub fn split(config: &IndexConfig) -> IndexResult<Self> {
        if config.geometry.sparse_chapters_per_volume == 0 {
            return Err(IndexError::InvalidArgument(
                "cannot initialize sparse+dense master index with no sparse chapters".to_string(),
            ));
        }
        if config.sparse_sample_rate == 0 {
            return Err(IndexError::InvalidArgument(format!(
                "cannot initialize sparse+dense master index with a sparse sample rate of {}",
                config.sparse_sample_rate
            )));
        }

        let mut hook = *config;
        let mut non_hook = *config;

        let sample_records = config.geometry.records_per_chapter / config.sparse_sample_rate;
        hook.geometry.records_per_chapter = sample_records;
        non_hook.geometry.records_per_chapter -= sample_records;

        hook.geometry.sparse_chapters_per_volume = 0;
        non_hook.geometry.sparse_chapters_per_volume = 0;
        non_hook.geometry.chapters_per_volume = config.geometry.dense_chapters_per_volume();

        Ok(Self { hook, non_hook })
    }
}
