//! `CompactionTracker`: atomic counters/gauges per level (spec.md §4.7).
//!
//! Six slots, one per [`CompactionLevel`] (`Snapshot..Full`), even though the scheduler only
//! ever drives levels 1-4 — this mirrors the source's fixed-size label array and keeps
//! `AllActive` a single sum over every slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::group::CompactionLevel;

const SLOTS: usize = 6;

#[derive(Default)]
struct Slot {
    ok: AtomicU64,
    errors: AtomicU64,
    active: AtomicU64,
    queue: AtomicU64,
}

/// Safe for concurrent readers and writers; consumers observe eventually-consistent snapshots
/// (spec.md §4.7).
pub struct CompactionTracker {
    slots: [Slot; SLOTS],
}

impl Default for CompactionTracker {
    fn default() -> Self {
        Self { slots: std::array::from_fn(|_| Slot::default()) }
    }
}

/// A point-in-time summary of every level's counters, suitable for logging or an observability
/// endpoint (metrics plumbing itself is an external collaborator, spec.md §1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelSummary {
    pub level: CompactionLevel,
    pub ok: u64,
    pub errors: u64,
    pub active: u64,
    pub queue: u64,
}

impl CompactionTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_active(&self, level: CompactionLevel) {
        self.slots[level.as_index()].active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active(&self, level: CompactionLevel) {
        self.slots[level.as_index()].active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Records the outcome of one compaction attempt. `duration` is only meaningful on success;
    /// a failing attempt records zero (spec.md §4.5: `tracker.Attempted(level, false, 0)`).
    pub fn attempted(&self, level: CompactionLevel, success: bool, duration: Duration) {
        let slot = &self.slots[level.as_index()];
        if success {
            slot.ok.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(?level, micros = duration.as_micros(), "compaction attempt succeeded");
        } else {
            slot.errors.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(?level, "compaction attempt failed");
        }
    }

    pub fn set_queue(&self, level: CompactionLevel, n: u64) {
        self.slots[level.as_index()].queue.store(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn queue(&self, level: CompactionLevel) -> u64 {
        self.slots[level.as_index()].queue.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn active(&self, level: CompactionLevel) -> u64 {
        self.slots[level.as_index()].active.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn all_active(&self) -> u64 {
        self.slots.iter().map(|s| s.active.load(Ordering::Relaxed)).sum()
    }

    #[must_use]
    pub fn completed(&self, level: CompactionLevel) -> u64 {
        self.slots[level.as_index()].ok.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn errors(&self, level: CompactionLevel) -> u64 {
        self.slots[level.as_index()].errors.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn summary(&self) -> Vec<LevelSummary> {
        [
            CompactionLevel::Snapshot,
            CompactionLevel::Level1,
            CompactionLevel::Level2,
            CompactionLevel::Level3,
            CompactionLevel::Optimize,
            CompactionLevel::Full,
        ]
        .into_iter()
        .map(|level| LevelSummary {
            level,
            ok: self.completed(level),
            errors: self.errors(level),
            active: self.active(level),
            queue: self.queue(level),
        })
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_counters_round_trip() {
        let tracker = CompactionTracker::new();
        tracker.inc_active(CompactionLevel::Level1);
        tracker.inc_active(CompactionLevel::Level2);
        assert_eq!(tracker.all_active(), 2);
        tracker.dec_active(CompactionLevel::Level1);
        assert_eq!(tracker.all_active(), 1);
    }

    #[test]
    fn attempted_splits_ok_and_errors() {
        let tracker = CompactionTracker::new();
        tracker.attempted(CompactionLevel::Level3, true, Duration::from_millis(5));
        tracker.attempted(CompactionLevel::Level3, false, Duration::ZERO);
        assert_eq!(tracker.completed(CompactionLevel::Level3), 1);
        assert_eq!(tracker.errors(CompactionLevel::Level3), 1);
    }

    #[test]
    fn summary_covers_all_six_levels() {
        let tracker = CompactionTracker::new();
        assert_eq!(tracker.summary().len(), 6);
    }
}
