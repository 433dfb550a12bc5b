//! Error types for the claudefs-index subsystem.

use thiserror::Error;

/// Result type alias for index operations.
pub type IndexResult<T> = Result<T, IndexError>;

/// All errors that can occur while operating the master index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// A configuration or call argument is unusable.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Persisted index state failed validation.
    #[error("Corrupt index component: {0}")]
    CorruptComponent(String),

    /// The operation is not valid in the current state of the index.
    #[error("Bad index state: {0}")]
    BadState(String),

    /// A zone number outside the configured zone count was used.
    #[error("Zone {zone} out of range (index has {num_zones} zones)")]
    ZoneOutOfRange {
        /// The offending zone number.
        zone: u32,
        /// The number of zones in the index.
        num_zones: u32,
    },

    /// The calling thread already holds this zone's lock.
    #[error("Zone {zone} lock is already held by this thread")]
    ZoneLockReentered {
        /// The zone whose lock was re-entered.
        zone: u32,
    },

    /// Configuration file could not be loaded.
    #[error("Config error: {0}")]
    Config(String),

    /// I/O error from a buffered reader or writer.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IndexError {
    /// Returns true if this error reports corrupt persisted state.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, IndexError::CorruptComponent(_))
    }
}
