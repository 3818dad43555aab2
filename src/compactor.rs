//! The merge engine behind `CompactFast`/`CompactFull`/`WriteSnapshot`.
//!
//! spec.md §1 names these as external-collaborator interfaces the core merely calls; it does not
//! exempt the merge itself from being built; it exempts the block-compressed on-disk *codec*
//! (handled already by [`crate::tsmfile`]). `CompactFast` and `CompactFull` differ only in which
//! generation level their output is tagged at by the caller — both perform the same full,
//! generation-ordered merge, since this core's simplified TSM stand-in has no per-block work to
//! skip for "fast" mode the way the real block-indexed format would.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::Snapshot as CacheSnapshot;
use crate::compaction::Throughput;
use crate::error::{Error, Result};
use crate::format::{CompositeKey, TimestampedValue, Value};
use crate::tsmfile::TsmFile;
use crate::vfs::Filesystem;

pub struct Compactor {
    fs: Arc<dyn Filesystem>,
    throughput: Throughput,
}

impl Compactor {
    #[must_use]
    pub fn new(fs: Arc<dyn Filesystem>, throughput: Throughput) -> Self {
        Self { fs, throughput }
    }

    /// Merges `files` (oldest first) into one new file at `new_path`. Later files in the slice
    /// win over earlier ones for a shared `(key, timestamp)`, matching generation precedence.
    pub fn compact(&self, files: &[Arc<Mutex<TsmFile>>], new_path: PathBuf) -> Result<TsmFile> {
        for file in files {
            if !self.fs.exists(file.lock().path()) {
                return Err(Error::CompactionInProgress);
            }
        }
        let merged = merge(files);
        self.throughput.take(estimated_size_bytes(&merged));
        TsmFile::write_new(self.fs.as_ref(), &new_path, merged)
    }

    /// Persists a Cache snapshot (already deduplicated) as a new level-1 TSM file.
    pub fn write_snapshot(&self, snapshot: &CacheSnapshot, new_path: PathBuf) -> Result<TsmFile> {
        let mut entries: BTreeMap<CompositeKey, Vec<TimestampedValue>> = BTreeMap::new();
        for (key, entry) in snapshot.iter() {
            entries.insert(key.clone(), entry.values.clone());
        }
        self.throughput.take(estimated_size_bytes(&entries));
        TsmFile::write_new(self.fs.as_ref(), &new_path, entries)
    }
}

fn estimated_size_bytes(entries: &BTreeMap<CompositeKey, Vec<TimestampedValue>>) -> u64 {
    entries.iter().map(|(k, vs)| k.len() as u64 + vs.len() as u64 * 24).sum()
}

fn merge(files: &[Arc<Mutex<TsmFile>>]) -> BTreeMap<CompositeKey, Vec<TimestampedValue>> {
    let mut merged: BTreeMap<CompositeKey, BTreeMap<i64, Value>> = BTreeMap::new();
    for file in files {
        let file = file.lock();
        let keys: Vec<CompositeKey> = file.iterator(&[]).cloned().collect();
        for key in keys {
            let by_timestamp = merged.entry(key.clone()).or_default();
            for value in file.values_for(&key) {
                by_timestamp.insert(value.timestamp, value.value);
            }
        }
    }
    merged
        .into_iter()
        .map(|(key, by_timestamp)| {
            let values = by_timestamp.into_iter().map(|(ts, v)| TimestampedValue::new(ts, v)).collect();
            (key, values)
        })
        .collect()
}
