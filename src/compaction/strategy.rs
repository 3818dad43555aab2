//! Executes one claimed [`CompactionGroup`] (spec.md §4.5).

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::constants::BACKOFF;
use super::group::{CompactionGroup, CompactionLevel};
use super::planner::Planner;
use super::tracker::CompactionTracker;
use crate::compactor::Compactor;
use crate::error::Error;
use crate::filestore::FileStore;
use crate::tsmfile::TsmFile;

fn next_level_for(level: CompactionLevel) -> CompactionLevel {
    match level {
        CompactionLevel::Level1 => CompactionLevel::Level2,
        CompactionLevel::Level2 => CompactionLevel::Level3,
        CompactionLevel::Level3 | CompactionLevel::Optimize | CompactionLevel::Full => CompactionLevel::Full,
        CompactionLevel::Snapshot => CompactionLevel::Level1,
    }
}

/// Runs `group` to completion: invokes the compactor, swaps the result into the `FileStore` on
/// success, updates the tracker, and always releases the group back to the planner.
///
/// The caller is expected to have already acquired a `compactionLimiter` permit, called
/// `tracker.inc_active(group.level)` before handing `group` off, and to run this on its own
/// worker task (spec.md §4.4 step 4, §5).
pub fn run(group: CompactionGroup, tracker: &CompactionTracker, compactor: &Compactor, filestore: &FileStore, planner: &Planner) {
    let start = Instant::now();

    let handles: Vec<Arc<Mutex<TsmFile>>> =
        filestore.files().into_iter().filter(|f| group.files.iter().any(|p| p == f.lock().path())).collect();
    let next_level = next_level_for(group.level);
    let new_path = filestore.new_file_path(next_level);

    match compactor.compact(&handles, new_path.clone()) {
        Ok(new_file) => {
            let on_replaced_path = new_path.clone();
            let result = filestore.replace_with_callback(&group.files, vec![new_file], |_| {
                planner.record_new_file(on_replaced_path, next_level);
            });
            match result {
                Ok(()) => {
                    for path in &group.files {
                        planner.forget_file(path);
                    }
                    tracker.attempted(group.level, true, start.elapsed());
                }
                Err(err) => {
                    tracing::warn!(level = ?group.level, %err, "FileStore::replace failed after compaction");
                    tracker.attempted(group.level, false, Duration::ZERO);
                }
            }
        }
        Err(Error::CompactionInProgress) => {
            tracing::debug!(level = ?group.level, "group already in progress, backing off");
            std::thread::sleep(BACKOFF);
        }
        Err(err) => {
            tracing::warn!(level = ?group.level, %err, "compaction attempt failed");
            tracker.attempted(group.level, false, Duration::ZERO);
            std::thread::sleep(BACKOFF);
        }
    }

    tracker.dec_active(group.level);
    planner.release(&group);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::group::CompactionGroup;
    use crate::vfs::{Filesystem, MemoryFs};
    use std::collections::BTreeMap;
    use std::path::Path;

    #[test]
    fn successful_compaction_advances_level_and_updates_tracker() {
        let fs: Arc<dyn Filesystem> = Arc::new(MemoryFs::new());
        let filestore = FileStore::open(Arc::clone(&fs), Path::new("/data"), false).unwrap();
        let planner = Planner::new(Duration::from_secs(3600));
        let tracker = CompactionTracker::new();
        let compactor = Compactor::new(Arc::clone(&fs), crate::compaction::Throughput::new(0, 0));

        let mut paths = Vec::new();
        for i in 0..4 {
            let path = filestore.new_file_path(CompactionLevel::Level1);
            let mut entries = BTreeMap::new();
            entries.insert(
                b"cpu#!~#usage".to_vec(),
                vec![crate::format::TimestampedValue::new(i, crate::format::Value::Integer(i))],
            );
            let file = TsmFile::write_new(fs.as_ref(), &path, entries).unwrap();
            filestore.replace(&[], vec![file]).unwrap();
            planner.record_new_file(path.clone(), CompactionLevel::Level1);
            paths.push(path);
        }

        let group = planner.plan_level(CompactionLevel::Level1).unwrap();
        assert_eq!(group.files.len(), 4);
        tracker.inc_active(group.level);
        run(group, &tracker, &compactor, &filestore, &planner);

        assert_eq!(tracker.completed(CompactionLevel::Level1), 1);
        assert_eq!(tracker.all_active(), 0);
        assert_eq!(filestore.file_count(), 1);
        assert!(planner.plan_level(CompactionLevel::Level2).is_none());
    }

    #[test]
    fn group_for_vanished_files_is_released_not_leaked() {
        let fs: Arc<dyn Filesystem> = Arc::new(MemoryFs::new());
        let filestore = FileStore::open(Arc::clone(&fs), Path::new("/data"), false).unwrap();
        let planner = Planner::new(Duration::from_secs(3600));
        let tracker = CompactionTracker::new();
        let compactor = Compactor::new(Arc::clone(&fs), crate::compaction::Throughput::new(0, 0));

        let group = CompactionGroup::new(CompactionLevel::Level1, vec![Path::new("/missing.tsm").to_path_buf()], false);

        tracker.inc_active(group.level);
        run(group, &tracker, &compactor, &filestore, &planner);
        assert_eq!(tracker.all_active(), 0);
        assert_eq!(tracker.errors(CompactionLevel::Level1), 0);
    }
}
