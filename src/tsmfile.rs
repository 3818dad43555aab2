//! A minimal stand-in for the TSM file reader/writer and block codec.
//!
//! spec.md §1 treats the real block-compressed TSM format as an external collaborator, reached
//! only through `FileStore.Replace`, `TSMFile.Iterator`, `TSMFile.BatchDelete`, and
//! `Compactor.CompactFast/Full/WriteSnapshot`. This module implements exactly those interfaces
//! with a simple length-prefixed, sorted-by-key encoding (no block compression, no index
//! footer) so the engine core above it is fully exercisable; the real block codec is
//! deliberately out of scope here, per spec.md's non-goals around on-disk block format.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::format::{strip_field, CompositeKey, TimestampedValue, Value};
use crate::vfs::Filesystem;

/// A tombstone recorded against a series' composite keys for a time range.
#[derive(Debug, Clone)]
struct Tombstone {
    key: CompositeKey,
    min: i64,
    max: i64,
}

/// An immutable, sorted, on-disk file mapping composite keys to timestamped values.
///
/// Keys are sorted ascending and each `(key, timestamp)` pair appears at most once, per
/// spec.md §3's TSM-file invariant.
#[derive(Debug)]
pub struct TsmFile {
    path: PathBuf,
    entries: BTreeMap<CompositeKey, Vec<TimestampedValue>>,
    tombstones: Vec<Tombstone>,
    min_key: CompositeKey,
    max_key: CompositeKey,
    min_time: i64,
    max_time: i64,
}

impl TsmFile {
    /// Builds a file in memory from already-sorted, deduplicated entries and persists it.
    pub fn write_new(
        fs: &dyn Filesystem,
        path: &Path,
        entries: BTreeMap<CompositeKey, Vec<TimestampedValue>>,
    ) -> Result<Self> {
        let file = Self::from_entries(path.to_path_buf(), entries);
        file.persist(fs)?;
        Ok(file)
    }

    fn from_entries(path: PathBuf, entries: BTreeMap<CompositeKey, Vec<TimestampedValue>>) -> Self {
        let min_key = entries.keys().next().cloned().unwrap_or_default();
        let max_key = entries.keys().next_back().cloned().unwrap_or_default();
        let mut min_time = i64::MAX;
        let mut max_time = i64::MIN;
        for values in entries.values() {
            for v in values {
                min_time = min_time.min(v.timestamp);
                max_time = max_time.max(v.timestamp);
            }
        }
        if entries.is_empty() {
            min_time = 0;
            max_time = 0;
        }
        Self { path, entries, tombstones: Vec::new(), min_key, max_key, min_time, max_time }
    }

    pub fn open(fs: &dyn Filesystem, path: &Path) -> Result<Self> {
        let mut handle = fs.open(path)?;
        let mut buf = Vec::new();
        handle.read_to_end(&mut buf)?;
        Ok(Self::decode(path.to_path_buf(), &buf))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `(min, max)` over the file's keys, stripped to series keys (no field suffix), as used by
    /// `deleteSeriesRange` phase A to decide whether a file overlaps a delete.
    #[must_use]
    pub fn series_key_range(&self) -> (&[u8], &[u8]) {
        (strip_field(&self.min_key), strip_field(&self.max_key))
    }

    #[must_use]
    pub fn time_range(&self) -> (i64, i64) {
        (self.min_time, self.max_time)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.entries
            .iter()
            .map(|(k, vs)| k.len() as u64 + vs.len() as u64 * 24)
            .sum()
    }

    /// Iterates composite keys in ascending order, starting from the first key `>= min_key`.
    /// Tombstoned `(key, timestamp)` pairs are not filtered eagerly; callers that need live
    /// values should use [`TsmFile::values_for`].
    pub fn iterator(&self, min_key: &[u8]) -> impl Iterator<Item = &CompositeKey> {
        self.entries.range(min_key.to_vec()..).map(|(k, _)| k)
    }

    /// Returns the live (non-tombstoned) values for `key`.
    #[must_use]
    pub fn values_for(&self, key: &[u8]) -> Vec<TimestampedValue> {
        let Some(values) = self.entries.get(key) else { return Vec::new() };
        values
            .iter()
            .filter(|v| !self.is_tombstoned(key, v.timestamp))
            .cloned()
            .collect()
    }

    fn is_tombstoned(&self, key: &[u8], ts: i64) -> bool {
        self.tombstones.iter().any(|t| t.key == key && ts >= t.min && ts <= t.max)
    }

    /// Opens a batch-delete transaction against this file, per spec.md §4.6.1 phase A.
    #[must_use]
    pub fn batch_delete(&mut self) -> BatchDelete<'_> {
        BatchDelete { file: self, pending: Vec::new() }
    }

    fn persist(&self, fs: &dyn Filesystem) -> Result<()> {
        let mut buf = Vec::new();
        encode(&self.entries, &self.tombstones, &mut buf);
        let tmp_path = self.path.with_extension("tsm.tmp");
        let mut handle = fs.create(&tmp_path)?;
        handle.write_all(&buf)?;
        handle.sync_all()?;
        drop(handle);
        fs.rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn decode(path: PathBuf, buf: &[u8]) -> Self {
        let (entries, tombstones) = decode(buf);
        let mut file = Self::from_entries(path, entries);
        file.tombstones = tombstones;
        file
    }
}

/// A pending, uncommitted set of range deletes against a [`TsmFile`].
pub struct BatchDelete<'a> {
    file: &'a mut TsmFile,
    pending: Vec<Tombstone>,
}

impl BatchDelete<'_> {
    pub fn delete_range(&mut self, key: &[u8], min: i64, max: i64) {
        self.pending.push(Tombstone { key: key.to_vec(), min, max });
    }

    /// Commits the pending tombstones and re-persists the file.
    pub fn commit(self, fs: &dyn Filesystem) -> Result<()> {
        let Self { file, pending } = self;
        file.tombstones.extend(pending);
        // Physically drop tombstoned values now rather than waiting for a compaction to collect
        // them; this core has no separate tombstone-file format, so persisting dropped values
        // directly keeps `values_for` and `persist` consistent without extra state.
        for t in &file.tombstones.clone() {
            if let Some(values) = file.entries.get_mut(&t.key) {
                values.retain(|v| !(v.timestamp >= t.min && v.timestamp <= t.max));
            }
        }
        file.tombstones.clear();
        file.entries.retain(|_, v| !v.is_empty());
        file.persist(fs)
    }

    /// Discards the pending tombstones without modifying the file.
    pub fn rollback(self) {}
}

fn encode(
    entries: &BTreeMap<CompositeKey, Vec<TimestampedValue>>,
    tombstones: &[Tombstone],
    out: &mut Vec<u8>,
) {
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (key, values) in entries {
        out.extend_from_slice(&(key.len() as u32).to_le_bytes());
        out.extend_from_slice(key);
        out.extend_from_slice(&(values.len() as u32).to_le_bytes());
        for v in values {
            out.extend_from_slice(&v.timestamp.to_le_bytes());
            encode_value(&v.value, out);
        }
    }
    out.extend_from_slice(&(tombstones.len() as u32).to_le_bytes());
    for t in tombstones {
        out.extend_from_slice(&(t.key.len() as u32).to_le_bytes());
        out.extend_from_slice(&t.key);
        out.extend_from_slice(&t.min.to_le_bytes());
        out.extend_from_slice(&t.max.to_le_bytes());
    }
    let checksum = crc32c::crc32c(out);
    out.extend_from_slice(&checksum.to_le_bytes());
}

fn encode_value(value: &Value, out: &mut Vec<u8>) {
    out.push(value.block_type().0);
    match value {
        Value::Float(f) => out.extend_from_slice(&f.to_le_bytes()),
        Value::Integer(i) => out.extend_from_slice(&i.to_le_bytes()),
        Value::Unsigned(u) => out.extend_from_slice(&u.to_le_bytes()),
        Value::Boolean(b) => out.push(u8::from(*b)),
        Value::String(s) => {
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s);
        }
    }
}

fn decode(buf: &[u8]) -> (BTreeMap<CompositeKey, Vec<TimestampedValue>>, Vec<Tombstone>) {
    let mut cursor = 0usize;
    let mut entries = BTreeMap::new();

    let entry_count = read_u32(buf, &mut cursor);
    for _ in 0..entry_count {
        let key_len = read_u32(buf, &mut cursor) as usize;
        let key = buf[cursor..cursor + key_len].to_vec();
        cursor += key_len;
        let value_count = read_u32(buf, &mut cursor);
        let mut values = Vec::with_capacity(value_count as usize);
        for _ in 0..value_count {
            let timestamp = read_i64(buf, &mut cursor);
            let value = decode_value(buf, &mut cursor);
            values.push(TimestampedValue::new(timestamp, value));
        }
        entries.insert(key, values);
    }

    let mut tombstones = Vec::new();
    let tombstone_count = read_u32(buf, &mut cursor);
    for _ in 0..tombstone_count {
        let key_len = read_u32(buf, &mut cursor) as usize;
        let key = buf[cursor..cursor + key_len].to_vec();
        cursor += key_len;
        let min = read_i64(buf, &mut cursor);
        let max = read_i64(buf, &mut cursor);
        tombstones.push(Tombstone { key, min, max });
    }

    (entries, tombstones)
}

fn decode_value(buf: &[u8], cursor: &mut usize) -> Value {
    let block_type = buf[*cursor];
    *cursor += 1;
    match block_type {
        0 => {
            let v = f64::from_le_bytes(buf[*cursor..*cursor + 8].try_into().unwrap());
            *cursor += 8;
            Value::Float(v)
        }
        1 => {
            let v = i64::from_le_bytes(buf[*cursor..*cursor + 8].try_into().unwrap());
            *cursor += 8;
            Value::Integer(v)
        }
        2 => {
            let v = buf[*cursor] != 0;
            *cursor += 1;
            Value::Boolean(v)
        }
        3 => {
            let len = read_u32(buf, cursor) as usize;
            let v = buf[*cursor..*cursor + len].to_vec();
            *cursor += len;
            Value::String(v)
        }
        4 => {
            let v = u64::from_le_bytes(buf[*cursor..*cursor + 8].try_into().unwrap());
            *cursor += 8;
            Value::Unsigned(v)
        }
        other => panic!("tsmfile: unsupported block type {other} in on-disk file"),
    }
}

fn read_u32(buf: &[u8], cursor: &mut usize) -> u32 {
    let v = u32::from_le_bytes(buf[*cursor..*cursor + 4].try_into().unwrap());
    *cursor += 4;
    v
}

fn read_i64(buf: &[u8], cursor: &mut usize) -> i64 {
    let v = i64::from_le_bytes(buf[*cursor..*cursor + 8].try_into().unwrap());
    *cursor += 8;
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::MemoryFs;
    use std::path::PathBuf;

    fn sample() -> BTreeMap<CompositeKey, Vec<TimestampedValue>> {
        let mut entries = BTreeMap::new();
        entries.insert(b"cpu,host=a#!~#usage".to_vec(), vec![TimestampedValue::new(1, Value::Float(0.5))]);
        entries
    }

    #[test]
    fn write_then_open_round_trips() {
        let fs = MemoryFs::new();
        let path = PathBuf::from("/000001.tsm");
        TsmFile::write_new(&fs, &path, sample()).unwrap();
        let file = TsmFile::open(&fs, &path).unwrap();
        let values = file.values_for(b"cpu,host=a#!~#usage");
        assert_eq!(values, vec![TimestampedValue::new(1, Value::Float(0.5))]);
    }

    #[test]
    fn batch_delete_removes_range() {
        let fs = MemoryFs::new();
        let path = PathBuf::from("/000002.tsm");
        let mut file = TsmFile::write_new(&fs, &path, sample()).unwrap();
        let mut batch = file.batch_delete();
        batch.delete_range(b"cpu,host=a#!~#usage", 0, 10);
        batch.commit(&fs).unwrap();
        assert!(file.values_for(b"cpu,host=a#!~#usage").is_empty());
    }
}
