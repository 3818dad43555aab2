//! The durable, append-only write-ahead log.
//!
//! Segment rotation and removal follow spec.md §4.3 and §6: a segment is created on write,
//! closed by [`Wal::close_segment`] as part of taking a Cache snapshot, and removed once the
//! corresponding snapshot TSM file is durably linked into the `FileStore`.

mod segment;

pub use segment::WalRecord;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::error::Result;
use crate::format::{CompositeKey, TimestampedValue};
use crate::vfs::Filesystem;

/// Opaque handle to a closed WAL segment, returned by [`Wal::closed_segments`] and consumed by
/// [`Wal::remove`].
pub type SegmentId = u64;

pub struct Wal {
    fs: Arc<dyn Filesystem>,
    dir: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    active_id: SegmentId,
    active_file: Box<dyn crate::vfs::FileHandle>,
    closed_ids: Vec<SegmentId>,
    last_write: Instant,
}

impl Wal {
    /// Opens (creating if necessary) the WAL directory, replays every existing segment, and
    /// begins a fresh active segment for subsequent writes.
    ///
    /// Returns the WAL handle plus every record found in pre-existing segments, in the order
    /// they were originally written, for the engine to reconstruct the Cache from.
    pub fn open(fs: Arc<dyn Filesystem>, dir: &Path) -> Result<(Self, Vec<WalRecord>)> {
        fs.create_dir_all(dir)?;

        let mut existing_ids = Vec::new();
        for entry in fs.read_dir(dir)? {
            if let Some(id) = parse_segment_id(&entry.path) {
                existing_ids.push(id);
            }
        }
        existing_ids.sort_unstable();

        let mut records = Vec::new();
        for id in &existing_ids {
            let mut handle = fs.open(&segment_path(dir, *id))?;
            records.extend(segment::read_records(&mut *handle)?);
        }

        let active_id = existing_ids.last().copied().unwrap_or(0) + 1;
        let active_file = fs.create(&segment_path(dir, active_id))?;

        let wal = Self {
            fs,
            dir: dir.to_path_buf(),
            inner: Mutex::new(Inner {
                active_id,
                active_file,
                closed_ids: existing_ids,
                last_write: Instant::now(),
            }),
        };
        Ok((wal, records))
    }

    /// Appends a write record and syncs it to durable storage before returning.
    pub fn write_multi(&self, entries: &BTreeMap<CompositeKey, Vec<TimestampedValue>>) -> Result<()> {
        let mut inner = self.inner.lock();
        segment::write_record(&mut *inner.active_file, &WalRecord::Write(entries.clone()))?;
        inner.active_file.sync_all()?;
        inner.last_write = Instant::now();
        Ok(())
    }

    /// Appends a range-delete record and syncs it to durable storage before returning.
    pub fn delete_range(&self, keys: &[CompositeKey], min: i64, max: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = WalRecord::DeleteRange { keys: keys.to_vec(), min, max };
        segment::write_record(&mut *inner.active_file, &record)?;
        inner.active_file.sync_all()?;
        inner.last_write = Instant::now();
        Ok(())
    }

    /// Closes the current active segment and opens a fresh one. Called as the first step of
    /// `WriteSnapshot` (spec.md §4.3) so the closed segment can be removed once the snapshot's
    /// TSM file is durably linked.
    pub fn close_segment(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let closed_id = inner.active_id;
        let next_id = closed_id + 1;
        let next_file = self.fs.create(&segment_path(&self.dir, next_id))?;
        inner.active_file = next_file;
        inner.active_id = next_id;
        inner.closed_ids.push(closed_id);
        Ok(())
    }

    /// The segments closed so far but not yet [`Wal::remove`]d.
    #[must_use]
    pub fn closed_segments(&self) -> Vec<SegmentId> {
        self.inner.lock().closed_ids.clone()
    }

    /// Deletes the given closed segments' files and stops tracking them.
    pub fn remove(&self, ids: &[SegmentId]) -> Result<()> {
        let mut inner = self.inner.lock();
        for id in ids {
            self.fs.remove_file(&segment_path(&self.dir, *id))?;
        }
        inner.closed_ids.retain(|id| !ids.contains(id));
        Ok(())
    }

    #[must_use]
    pub fn disk_size_bytes(&self) -> u64 {
        let inner = self.inner.lock();
        let mut total = self.fs.file_len(&segment_path(&self.dir, inner.active_id)).unwrap_or(0);
        for id in &inner.closed_ids {
            total += self.fs.file_len(&segment_path(&self.dir, *id)).unwrap_or(0);
        }
        total
    }

    #[must_use]
    pub fn last_write_time(&self) -> Instant {
        self.inner.lock().last_write
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }
}

fn segment_path(dir: &Path, id: SegmentId) -> PathBuf {
    dir.join(format!("{id:010}.wal"))
}

fn parse_segment_id(path: &Path) -> Option<SegmentId> {
    let stem = path.file_stem()?.to_str()?;
    if path.extension()?.to_str()? != "wal" {
        return None;
    }
    stem.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Value;
    use crate::vfs::MemoryFs;

    #[test]
    fn replay_after_reopen_reconstructs_writes() {
        let fs: Arc<dyn Filesystem> = Arc::new(MemoryFs::new());
        let dir = PathBuf::from("/wal");
        let (wal, initial) = Wal::open(Arc::clone(&fs), &dir).unwrap();
        assert!(initial.is_empty());

        let mut entries = BTreeMap::new();
        entries.insert(b"cpu#!~#usage".to_vec(), vec![TimestampedValue::new(1, Value::Float(1.0))]);
        wal.write_multi(&entries).unwrap();
        drop(wal);

        let (_wal, records) = Wal::open(Arc::clone(&fs), &dir).unwrap();
        assert_eq!(records.len(), 1);
        match &records[0] {
            WalRecord::Write(e) => assert_eq!(e, &entries),
            WalRecord::DeleteRange { .. } => panic!("expected a write record"),
        }
    }

    #[test]
    fn close_segment_tracks_closed_ids_for_removal() {
        let fs: Arc<dyn Filesystem> = Arc::new(MemoryFs::new());
        let (wal, _) = Wal::open(Arc::clone(&fs), Path::new("/wal")).unwrap();
        assert!(wal.closed_segments().is_empty());
        wal.close_segment().unwrap();
        let closed = wal.closed_segments();
        assert_eq!(closed.len(), 1);
        wal.remove(&closed).unwrap();
        assert!(wal.closed_segments().is_empty());
    }
}
