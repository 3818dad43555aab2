//! `CompactionPlanner`: produces [`CompactionGroup`]s per level and tracks which files are
//! currently claimed by an in-flight compaction (spec.md §2, §4.4).
//!
//! This core has no block-compressed TSM reader to derive a file's place in the merge hierarchy
//! from its contents, so the planner tracks each file's generation level explicitly: a level is
//! assigned when the file is produced (by a snapshot, at level 1, or by a compaction, at
//! `input_level + 1`) and recorded via [`Planner::record_new_file`].

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Instant;

use parking_lot::Mutex;

use super::constants::{MAX_FILES_PER_GROUP, MIN_FILES_TO_COMPACT};
use super::group::{CompactionGroup, CompactionLevel};

pub struct Planner {
    inner: Mutex<Inner>,
}

struct Inner {
    levels: HashMap<PathBuf, CompactionLevel>,
    claimed: HashSet<PathBuf>,
    full_write_cold_duration: std::time::Duration,
    force_full: bool,
}

impl Planner {
    #[must_use]
    pub fn new(full_write_cold_duration: std::time::Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                levels: HashMap::new(),
                claimed: HashSet::new(),
                full_write_cold_duration,
                force_full: false,
            }),
        }
    }

    /// Tags a freshly written file at `level`, making it eligible for future planning.
    pub fn record_new_file(&self, path: PathBuf, level: CompactionLevel) {
        self.inner.lock().levels.insert(path, level);
    }

    /// Stops tracking a file, e.g. after it was superseded by `FileStore.Replace` or removed.
    pub fn forget_file(&self, path: &PathBuf) {
        let mut inner = self.inner.lock();
        inner.levels.remove(path);
        inner.claimed.remove(path);
    }

    /// Plans a group at exactly `level` (1, 2, or 3), if enough unclaimed files have accumulated.
    #[must_use]
    pub fn plan_level(&self, level: CompactionLevel) -> Option<CompactionGroup> {
        let mut inner = self.inner.lock();
        let mut candidates: Vec<PathBuf> = inner
            .levels
            .iter()
            .filter(|&(path, &l)| l == level && !inner.claimed.contains(path))
            .map(|(path, _)| path.clone())
            .collect();
        if candidates.len() < MIN_FILES_TO_COMPACT {
            return None;
        }
        candidates.sort();
        candidates.truncate(MAX_FILES_PER_GROUP);
        for path in &candidates {
            inner.claimed.insert(path.clone());
        }
        let fast = level == CompactionLevel::Level3;
        Some(CompactionGroup::new(level, candidates, fast))
    }

    /// Plans a level-4 full compaction once the file set has been untouched for
    /// `Config::compaction_full_write_cold_duration`, or immediately if [`Planner::force_full`]
    /// was called. Merges every unclaimed file across all levels into one group.
    #[must_use]
    pub fn plan(&self, file_store_last_modified: Instant) -> Option<CompactionGroup> {
        let mut inner = self.inner.lock();
        let cold_enough = file_store_last_modified.elapsed() >= inner.full_write_cold_duration;
        if !inner.force_full && !cold_enough {
            return None;
        }
        inner.force_full = false;

        let candidates: Vec<PathBuf> =
            inner.levels.keys().filter(|path| !inner.claimed.contains(*path)).cloned().collect();
        if candidates.len() < 2 {
            return None;
        }
        for path in &candidates {
            inner.claimed.insert(path.clone());
        }
        Some(CompactionGroup::new(CompactionLevel::Full, candidates, false))
    }

    /// Fallback fill for the level-4 queue when [`Planner::plan`] found nothing: merges a handful
    /// of unclaimed files from different levels to reduce file count without waiting for the
    /// cold-duration threshold.
    #[must_use]
    pub fn plan_optimize(&self) -> Option<CompactionGroup> {
        let mut inner = self.inner.lock();
        let mut candidates: Vec<PathBuf> =
            inner.levels.keys().filter(|path| !inner.claimed.contains(*path)).cloned().collect();
        if candidates.len() < MIN_FILES_TO_COMPACT {
            return None;
        }
        candidates.sort();
        candidates.truncate(MAX_FILES_PER_GROUP);
        for path in &candidates {
            inner.claimed.insert(path.clone());
        }
        Some(CompactionGroup::new(CompactionLevel::Optimize, candidates, true))
    }

    /// Returns a group's files to the unclaimed pool, e.g. after a failed compaction or because
    /// it was not scheduled this tick.
    pub fn release(&self, group: &CompactionGroup) {
        let mut inner = self.inner.lock();
        for path in &group.files {
            inner.claimed.remove(path);
        }
    }

    /// Forces the very next [`Planner::plan`] call to produce a full compaction regardless of
    /// cold duration, used by `ScheduleFullCompaction` (spec.md §6).
    pub fn force_full(&self) {
        self.inner.lock().force_full = true;
    }

    /// True once the tracked file set cannot be leveled any further: zero or one file left.
    #[must_use]
    pub fn fully_compacted(&self) -> bool {
        self.inner.lock().levels.len() <= 1
    }
}
