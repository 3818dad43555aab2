//! Engine-internal compaction tuning, kept separate from the user-facing [`crate::Config`].

/// Once a generation level holds this many unclaimed files, [`super::planner::Planner::plan_level`]
/// may form a compaction group for it.
pub(crate) const MIN_FILES_TO_COMPACT: usize = 4;

/// The largest group [`super::planner::Planner::plan_level`] will claim in one tick, so a single
/// compaction does not monopolize the worker pool for disproportionately long.
pub(crate) const MAX_FILES_PER_GROUP: usize = 8;

/// How long the level-compaction and snapshot-compaction loops sleep between ticks.
pub(crate) const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Back-off applied after `CompactionInProgress` or a non-disabled compaction error
/// (spec.md §4.5).
pub(crate) const BACKOFF: std::time::Duration = std::time::Duration::from_secs(1);
