//! The set of immutable, sorted TSM files backing a shard (spec.md §2, §4.3, §4.6.1).
//!
//! `Replace` is the only mutator of the file set and is atomic from a reader's perspective: the
//! write lock is held only long enough to splice the `Vec`, never across I/O. `Apply` fans the
//! given closure out over every file on its own thread, since spec.md §5 requires
//! `FileStore.Apply` to run per-file work in parallel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::compaction::CompactionLevel;
use crate::error::Result;
use crate::tsmfile::TsmFile;
use crate::vfs::Filesystem;

pub struct FileStore {
    fs: Arc<dyn Filesystem>,
    dir: PathBuf,
    files: RwLock<Vec<Arc<Mutex<TsmFile>>>>,
    started_at: Instant,
    last_modified_nanos: AtomicI64,
}

impl FileStore {
    /// Opens every `*.tsm` file already present under `dir`. `madv_will_need` mirrors
    /// `Config::madv_will_need` (spec.md §6): when set, each file's path is passed through
    /// `Filesystem::advise_will_need` before being read.
    pub fn open(fs: Arc<dyn Filesystem>, dir: &Path, madv_will_need: bool) -> Result<Self> {
        fs.create_dir_all(dir)?;

        let mut entries: Vec<PathBuf> = fs
            .read_dir(dir)?
            .into_iter()
            .filter(|e| !e.is_dir && e.path.extension().is_some_and(|ext| ext == "tsm"))
            .map(|e| e.path)
            .collect();
        entries.sort();

        let mut files = Vec::with_capacity(entries.len());
        for path in entries {
            if madv_will_need {
                fs.advise_will_need(&path);
            }
            files.push(Arc::new(Mutex::new(TsmFile::open(fs.as_ref(), &path)?)));
        }

        Ok(Self {
            fs,
            dir: dir.to_path_buf(),
            files: RwLock::new(files),
            started_at: Instant::now(),
            last_modified_nanos: AtomicI64::new(0),
        })
    }

    /// Names the file with `level` as a leading digit so [`FileStore::level_of`] can recover a
    /// file's generation level from a bare path after a restart.
    #[must_use]
    pub fn new_file_path(&self, level: CompactionLevel) -> PathBuf {
        self.dir.join(format!("{}-{}.tsm", level.as_index(), Uuid::new_v4()))
    }

    /// Recovers the generation level encoded by [`FileStore::new_file_path`]. Falls back to
    /// `Level1` for a file name this store did not itself produce (the oldest on-disk naming had
    /// no level prefix), so every discovered file still yields a usable, if conservative, level.
    #[must_use]
    pub fn level_of(path: &Path) -> CompactionLevel {
        path.file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.split('-').next())
            .and_then(|prefix| prefix.parse::<u8>().ok())
            .and_then(CompactionLevel::from_index)
            .unwrap_or(CompactionLevel::Level1)
    }

    /// All files currently visible to readers, as shareable handles.
    #[must_use]
    pub fn files(&self) -> Vec<Arc<Mutex<TsmFile>>> {
        self.files.read().clone()
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.read().len()
    }

    /// Atomically removes `old` and inserts `new`. No caller ever observes a mixed or empty set.
    pub fn replace(&self, old: &[PathBuf], new: Vec<TsmFile>) -> Result<()> {
        self.replace_with_callback(old, new, |_| {})
    }

    /// As [`FileStore::replace`], but `on_replaced` runs with the new set already visible,
    /// before any other caller can observe the swap having happened and race it (used by the
    /// compaction strategy to record `tracker.Attempted` under the same "it happened" window).
    pub fn replace_with_callback(
        &self,
        old: &[PathBuf],
        new: Vec<TsmFile>,
        on_replaced: impl FnOnce(&[PathBuf]),
    ) -> Result<()> {
        {
            let mut files = self.files.write();
            files.retain(|f| !old.iter().any(|p| p == f.lock().path()));
            files.extend(new.into_iter().map(|f| Arc::new(Mutex::new(f))));
        }
        on_replaced(old);
        self.touch();
        // The new set is already visible to readers; only now is it safe to unlink the
        // superseded files (spec.md §3's TSM-file lifecycle: "removed when superseded by a
        // later Replace").
        for path in old {
            self.fs.remove_file(path)?;
        }
        Ok(())
    }

    /// Runs `f` against every file concurrently, one OS thread per file, and returns the first
    /// error encountered (if any) after all files have run to completion.
    pub fn apply<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&Mutex<TsmFile>) -> Result<()> + Sync,
    {
        let files = self.files.read().clone();
        let mut first_err = None;
        std::thread::scope(|scope| {
            let handles: Vec<_> = files.iter().map(|file| scope.spawn(|| f(file))).collect();
            for handle in handles {
                if let Err(err) = handle.join().expect("FileStore::apply worker panicked") {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        });
        first_err.map_or(Ok(()), Err)
    }

    #[must_use]
    pub fn disk_size_bytes(&self) -> u64 {
        self.files.read().iter().map(|f| f.lock().size_bytes()).sum()
    }

    #[must_use]
    pub fn last_modified(&self) -> Instant {
        self.started_at + std::time::Duration::from_nanos(self.last_modified_nanos.load(Ordering::Relaxed).max(0) as u64)
    }

    fn touch(&self) {
        self.last_modified_nanos.store(self.started_at.elapsed().as_nanos() as i64, Ordering::Relaxed);
    }

    /// No open file descriptors or background tasks are held by this implementation; exists for
    /// lifecycle symmetry with `Open` (spec.md §6's `Close` contract).
    pub fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{CompositeKey, TimestampedValue, Value};
    use crate::vfs::MemoryFs;
    use std::collections::BTreeMap;

    fn sample_file(fs: &dyn Filesystem, path: &Path, key: &[u8], ts: i64) -> TsmFile {
        let mut entries: BTreeMap<CompositeKey, Vec<TimestampedValue>> = BTreeMap::new();
        entries.insert(key.to_vec(), vec![TimestampedValue::new(ts, Value::Float(1.0))]);
        TsmFile::write_new(fs, path, entries).unwrap()
    }

    #[test]
    fn replace_swaps_file_set_atomically() {
        let fs: Arc<dyn Filesystem> = Arc::new(MemoryFs::new());
        let store = FileStore::open(Arc::clone(&fs), Path::new("/data"), false).unwrap();
        let path = store.new_file_path(CompactionLevel::Level1);
        let file = sample_file(fs.as_ref(), &path, b"cpu#!~#usage", 1);
        store.replace(&[], vec![file]).unwrap();
        assert_eq!(store.file_count(), 1);

        let replacement_path = store.new_file_path(CompactionLevel::Level1);
        let replacement = sample_file(fs.as_ref(), &replacement_path, b"cpu#!~#usage", 2);
        store.replace(&[path], vec![replacement]).unwrap();
        assert_eq!(store.file_count(), 1);
    }

    #[test]
    fn apply_visits_every_file() {
        let fs: Arc<dyn Filesystem> = Arc::new(MemoryFs::new());
        let store = FileStore::open(Arc::clone(&fs), Path::new("/data"), false).unwrap();
        for i in 0..4 {
            let path = store.new_file_path(CompactionLevel::Level1);
            let file = sample_file(fs.as_ref(), &path, b"cpu#!~#usage", i);
            store.replace(&[], vec![file]).unwrap();
        }

        let visited = std::sync::atomic::AtomicUsize::new(0);
        store
            .apply(|_file| {
                visited.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .unwrap();
        assert_eq!(visited.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn reopen_discovers_existing_files() {
        let fs: Arc<dyn Filesystem> = Arc::new(MemoryFs::new());
        let store = FileStore::open(Arc::clone(&fs), Path::new("/data"), false).unwrap();
        let path = store.new_file_path(CompactionLevel::Level2);
        let file = sample_file(fs.as_ref(), &path, b"cpu#!~#usage", 1);
        store.replace(&[], vec![file]).unwrap();
        drop(store);

        let reopened = FileStore::open(Arc::clone(&fs), Path::new("/data"), false).unwrap();
        assert_eq!(reopened.file_count(), 1);
    }

    #[test]
    fn level_of_recovers_the_level_encoded_in_new_file_path() {
        let fs: Arc<dyn Filesystem> = Arc::new(MemoryFs::new());
        let store = FileStore::open(Arc::clone(&fs), Path::new("/data"), false).unwrap();
        for level in [CompactionLevel::Level1, CompactionLevel::Level2, CompactionLevel::Level3, CompactionLevel::Full] {
            let path = store.new_file_path(level);
            assert_eq!(FileStore::level_of(&path), level);
        }
    }

    #[test]
    fn level_of_falls_back_to_level1_for_an_unprefixed_name() {
        assert_eq!(FileStore::level_of(Path::new("/data/not-a-level-prefix.tsm")), CompactionLevel::Level1);
    }
}
