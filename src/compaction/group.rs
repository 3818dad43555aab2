//! Compaction groups and levels (spec.md §3).

use std::path::PathBuf;

/// A rung of the merge hierarchy. `Ord` follows the numeric level so the scheduler's priority
/// order (1 > 2 > 3 > 4) reads naturally as "lower level first".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum CompactionLevel {
    Snapshot = 0,
    Level1 = 1,
    Level2 = 2,
    Level3 = 3,
    Optimize = 4,
    Full = 5,
}

impl CompactionLevel {
    /// All incremental levels the scheduler picks among, in priority order.
    pub const SCHEDULED: [CompactionLevel; 4] =
        [CompactionLevel::Level1, CompactionLevel::Level2, CompactionLevel::Level3, CompactionLevel::Optimize];

    #[must_use]
    pub fn as_index(self) -> usize {
        self as u8 as usize
    }

    /// Inverse of [`CompactionLevel::as_index`], used to restore a file's generation level from
    /// its on-disk filename across restarts.
    #[must_use]
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::Snapshot),
            1 => Some(Self::Level1),
            2 => Some(Self::Level2),
            3 => Some(Self::Level3),
            4 => Some(Self::Optimize),
            5 => Some(Self::Full),
            _ => None,
        }
    }
}

/// A set of TSM file paths the planner selected to be merged together, plus the strategy that
/// should execute it.
///
/// Once claimed by a worker, a group owns those files until the compaction completes or is
/// released back to the planner (e.g. it was not scheduled this tick, or the worker failed).
#[derive(Debug, Clone)]
pub struct CompactionGroup {
    pub level: CompactionLevel,
    pub files: Vec<PathBuf>,
    /// `true` selects `Compactor.CompactFast`; `false` selects `Compactor.CompactFull`.
    pub fast: bool,
}

impl CompactionGroup {
    #[must_use]
    pub fn new(level: CompactionLevel, files: Vec<PathBuf>, fast: bool) -> Self {
        Self { level, files, fast }
    }
}
