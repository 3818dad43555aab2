//! The error taxonomy for the engine's foreground operations.
//!
//! Background loops (the snapshot-compaction loop, the level-compaction loop) do not propagate
//! these; they log and continue, per the propagation policy in the design document.

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A point carried a field value whose tag did not match any known [`crate::format::Value`]
    /// variant. Rejected in `WritePoints` before any partial write occurs.
    #[error("unknown field type for field {field:?}")]
    UnknownFieldType { field: Vec<u8> },

    /// The Cache rejected a write because it would exceed `Config::cache_max_memory_size`.
    #[error("cache-max-memory-size exceeded: {size} + {incoming} > {limit}")]
    CacheMaxMemorySizeExceeded { size: usize, incoming: usize, limit: usize },

    /// Returned when a compaction group's files are already claimed by another in-flight
    /// compaction. Handled locally with a 1s back-off.
    #[error("a compaction for these files is already in progress")]
    CompactionInProgress,

    /// An index operation (`DropSeries`, `DropMeasurementIfSeriesNotExist`) failed. Propagated to
    /// the caller of `DeleteSeriesRange`; already-written tombstones remain valid.
    #[error("index error: {0}")]
    Index(String),

    /// A series-file operation (`DeleteSeriesID`) failed. Errors across a batch are accumulated
    /// and the last one is returned.
    #[error("series file error: {0}")]
    SeriesFile(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
