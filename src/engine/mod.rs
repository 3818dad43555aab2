//! The Engine: orchestrates `Open`/`Close`, `WritePoints`, `WriteSnapshot`, the level-compaction
//! loop, and delete, owning the two compaction gates (spec.md §4.1, §6).

mod delete;
mod gates;
mod level_loop;
mod snapshot_loop;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

use crate::cache::Cache;
use crate::compaction::{CompactionTracker, Limiter, Planner, Scheduler};
use crate::compactor::Compactor;
use crate::config::Config;
use crate::error::Result;
use crate::filestore::FileStore;
use crate::format::{CompositeKey, Point, TimestampedValue};
use crate::index::Index;
use crate::vfs::Filesystem;
use crate::wal::{Wal, WalRecord};

use gates::{LevelGate, SnapshotGate};

/// Everything a background loop or a foreground call needs a handle to. Kept separate from
/// [`Engine`] so it can be captured by `Arc` and moved into spawned loop threads without also
/// dragging the gates (which own the `JoinHandle`s for those very threads) along.
pub(crate) struct Shared {
    pub(crate) fs: Arc<dyn Filesystem>,
    pub(crate) path: PathBuf,
    pub(crate) cache: Cache,
    pub(crate) wal: Wal,
    pub(crate) filestore: FileStore,
    pub(crate) compactor: Compactor,
    pub(crate) planner: Planner,
    pub(crate) scheduler: Scheduler,
    pub(crate) tracker: CompactionTracker,
    pub(crate) limiter: Limiter,
    pub(crate) index: Arc<dyn Index>,
    pub(crate) config: Config,
    /// Guards lifecycle fields only; never held across blocking compactor or file I/O
    /// (spec.md §5). `WritePoints` takes a read lock; `WriteSnapshot` takes a write lock briefly.
    pub(crate) rw: RwLock<()>,
}

/// A single shard's storage engine core.
pub struct Engine {
    shared: Arc<Shared>,
    snapshot_gate: SnapshotGate,
    level_gate: LevelGate,
    closed: AtomicBool,
}

impl Engine {
    /// Creates `path`, removes stale temp artifacts, replays the WAL into the Cache, opens the
    /// `FileStore`, seeds the planner from files already on disk, and starts compactions.
    pub fn open(fs: Arc<dyn Filesystem>, path: &Path, index: Arc<dyn Index>, config: Config) -> Result<Self> {
        fs.create_dir_all(path)?;
        cleanup_stale_temp_files(fs.as_ref(), path)?;

        let wal_dir = path.join("wal");
        let (wal, records) = Wal::open(Arc::clone(&fs), &wal_dir)?;

        let cache = Cache::new(config.cache_max_memory_size);
        for record in records {
            match record {
                WalRecord::Write(entries) => {
                    // Best effort: a write that would now exceed the configured cache limit is
                    // dropped from the reload rather than failing `Open` outright.
                    let _ = cache.write_multi(&entries);
                }
                WalRecord::DeleteRange { keys, min, max } => cache.delete_range(&keys, min, max),
            }
        }

        let filestore = FileStore::open(Arc::clone(&fs), path, config.madv_will_need)?;
        let planner = Planner::new(config.compaction_full_write_cold_duration);
        for file in filestore.files() {
            let file = file.lock();
            // Restores each file's generation level from its filename rather than re-seeding
            // everything at Level1, so a file already merged up to Level3 before a restart keeps
            // being scheduled as Level3 work instead of restarting its climb through the levels.
            let level = FileStore::level_of(file.path());
            planner.record_new_file(file.path().to_path_buf(), level);
        }

        let compactor = Compactor::new(
            Arc::clone(&fs),
            crate::compaction::Throughput::new(config.compaction_throughput, config.compaction_throughput_burst),
        );
        let limiter = Limiter::new(config.resolved_compaction_max_concurrent());

        let shared = Arc::new(Shared {
            fs,
            path: path.to_path_buf(),
            cache,
            wal,
            filestore,
            compactor,
            planner,
            scheduler: Scheduler::new(),
            tracker: CompactionTracker::new(),
            limiter,
            index,
            config,
            rw: RwLock::new(()),
        });

        let engine = Self {
            shared,
            snapshot_gate: SnapshotGate::new(),
            level_gate: LevelGate::new(),
            closed: AtomicBool::new(false),
        };
        engine.set_compactions_enabled(true);
        Ok(engine)
    }

    /// Disables compactions and closes the `FileStore`. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.set_compactions_enabled(false);
        self.shared.filestore.close()
    }

    /// Writes a batch of points. Validates every field's type tag before writing anything, so a
    /// single unrecognized field fails the whole batch without a partial write (spec.md §4.2).
    pub fn write_points(&self, points: &[Point]) -> Result<()> {
        let mut values: std::collections::BTreeMap<CompositeKey, Vec<TimestampedValue>> = std::collections::BTreeMap::new();
        let mut key_buf = Vec::new();
        for point in points {
            for (field_name, raw) in &point.fields {
                let Some(value) = raw.clone().into_value() else {
                    return Err(crate::error::Error::UnknownFieldType { field: field_name.clone() });
                };
                crate::format::make_composite_key(&mut key_buf, &point.series_key, field_name);
                values.entry(key_buf.clone()).or_default().push(TimestampedValue::new(point.timestamp, value));
            }
        }

        let _guard = self.shared.rw.read();
        self.shared.cache.write_multi(&values)?;
        self.shared.wal.write_multi(&values)?;
        Ok(())
    }

    /// Enables or disables both the snapshot and level compaction gates.
    pub fn set_compactions_enabled(&self, enabled: bool) {
        if enabled {
            self.enable_snapshot_loop();
            self.enable_level_loop(false);
        } else {
            self.snapshot_gate.disable();
            self.level_gate.disable(false);
        }
    }

    fn enable_snapshot_loop(&self) {
        let shared = Arc::clone(&self.shared);
        self.snapshot_gate.enable(move |rx| snapshot_loop::spawn(shared, rx));
    }

    fn enable_level_loop(&self, wait: bool) {
        let shared = Arc::clone(&self.shared);
        self.level_gate.enable(wait, move |rx| level_loop::spawn(shared, rx));
    }

    /// `Cache.Size() == 0 ∧ AllActiveCompactions == 0 ∧ Planner.FullyCompacted()`.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.shared.cache.size() == 0
            && self.shared.tracker.all_active() == 0
            && self.shared.planner.fully_compacted()
    }

    #[must_use]
    pub fn disk_size(&self) -> u64 {
        self.shared.filestore.disk_size_bytes() + self.shared.wal.disk_size_bytes()
    }

    #[must_use]
    pub fn last_modified(&self) -> Instant {
        self.shared.filestore.last_modified().max(self.shared.wal.last_write_time())
    }

    /// Forces the live Cache to disk as a new level-1 TSM file, outside of the snapshot loop's
    /// own 1 Hz/threshold-driven schedule (spec.md §4.3, §6).
    pub fn write_snapshot(&self) -> Result<()> {
        snapshot_loop::write_snapshot(&self.shared)
    }

    /// Forces the Cache to disk and flushes every levelled file into one, by way of
    /// `WriteSnapshot` followed by a forced-full planner compaction.
    pub fn schedule_full_compaction(&self) -> Result<()> {
        snapshot_loop::write_snapshot(&self.shared)?;
        self.set_compactions_enabled(false);
        self.shared.planner.force_full();
        self.set_compactions_enabled(true);
        Ok(())
    }

    /// Deletes every point of every series in `series_keys` within `[min, max]` across the
    /// Cache, WAL, and on-disk TSM files (spec.md §4.6.1). `min`/`max` are nanosecond timestamps.
    pub fn delete_series_range(&self, series_keys: &[Vec<u8>], min: i64, max: i64) -> Result<()> {
        delete::delete_series_range(self, series_keys, min, max)
    }

    /// Deletes every series belonging to `measurement` over all time.
    pub fn delete_measurement(&self, measurement: &[u8]) -> Result<()> {
        delete::delete_measurement(self, measurement)
    }
}

/// Removes `*.tmp` directories and compaction temp files left behind by a process killed
/// mid-write (spec.md §6, scenario S6): a TSM file's tmp path always ends in `.tmp`.
fn cleanup_stale_temp_files(fs: &dyn Filesystem, path: &Path) -> Result<()> {
    for entry in fs.read_dir(path)? {
        if entry.path.extension().is_some_and(|ext| ext == "tmp") {
            if entry.is_dir {
                fs.remove_dir_all(&entry.path)?;
            } else {
                fs.remove_file(&entry.path)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::InMemoryIndex;
    use crate::vfs::MemoryFs;
    use std::path::Path;

    fn open_engine(fs: Arc<dyn Filesystem>) -> Engine {
        let index: Arc<dyn Index> = Arc::new(InMemoryIndex::new());
        Engine::open(fs, Path::new("/shard"), index, Config::default()).unwrap()
    }

    fn point(series: &[u8], ts: i64, field: &[u8], v: f64) -> Point {
        Point {
            series_key: series.to_vec(),
            timestamp: ts,
            fields: vec![(field.to_vec(), crate::format::RawFieldValue::Float(v))],
        }
    }

    #[test]
    fn write_then_close_then_reopen_reloads_cache_from_wal() {
        let fs: Arc<dyn Filesystem> = Arc::new(MemoryFs::new());
        let engine = open_engine(Arc::clone(&fs));
        engine.write_points(&[point(b"cpu,host=a", 1, b"usage", 0.5)]).unwrap();
        assert!(engine.shared.cache.size() > 0);
        engine.close().unwrap();

        let index: Arc<dyn Index> = Arc::new(InMemoryIndex::new());
        let reopened = Engine::open(fs, Path::new("/shard"), index, Config::default()).unwrap();
        assert!(reopened.shared.cache.size() > 0);
    }

    #[test]
    fn unknown_field_type_rejects_whole_batch() {
        let fs: Arc<dyn Filesystem> = Arc::new(MemoryFs::new());
        let engine = open_engine(fs);
        let bad = Point {
            series_key: b"cpu,host=a".to_vec(),
            timestamp: 1,
            fields: vec![
                (b"usage".to_vec(), crate::format::RawFieldValue::Float(1.0)),
                (b"weird".to_vec(), crate::format::RawFieldValue::Unknown(9)),
            ],
        };
        let err = engine.write_points(&[bad]).unwrap_err();
        assert!(matches!(err, crate::error::Error::UnknownFieldType { .. }));
        assert_eq!(engine.shared.cache.size(), 0, "no partial write on rejection");
    }

    #[test]
    fn close_is_idempotent() {
        let fs: Arc<dyn Filesystem> = Arc::new(MemoryFs::new());
        let engine = open_engine(fs);
        engine.close().unwrap();
        engine.close().unwrap();
    }
}
