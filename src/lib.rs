//! Storage engine core for a single time-series shard, built on a Time Structured Merge (TSM)
//! tree: an in-memory Cache backed by a durable WAL, periodically snapshotted into immutable,
//! sorted TSM files on disk, which a background compaction pipeline continually merges and
//! optimizes (spec.md §1).
//!
//! The TSM block codec, the measurement/series index, query planning, and metrics export are
//! external collaborators this crate calls through narrow interfaces rather than implements; see
//! [`index`] for the trait boundary and [`tsmfile`] for the boundary with the block codec.

pub mod cache;
pub mod compaction;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod error;
pub mod filestore;
pub mod format;
pub mod index;
pub mod tsmfile;
pub mod vfs;
pub mod wal;

pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
pub use format::{Point, RawFieldValue};
pub use index::{Index, InMemoryIndex};
