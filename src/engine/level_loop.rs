//! `compact`: the level-compaction background loop (spec.md §4.4).

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::compaction::constants::TICK_INTERVAL;
use crate::compaction::{self, CompactionGroup, CompactionLevel};

use super::Shared;

/// One tick: plan levels 1-3 directly and level 4 from `Planner::plan`/`plan_optimize`, publish
/// queue depths, ask the scheduler for the single level to run this tick, and hand its group to a
/// worker thread holding a `compactionLimiter` permit. Every unselected group is released back to
/// the planner so it is not double-booked next tick.
pub(crate) fn tick(shared: &Arc<Shared>) {
    let mut groups: HashMap<CompactionLevel, CompactionGroup> = HashMap::new();
    for level in [CompactionLevel::Level1, CompactionLevel::Level2, CompactionLevel::Level3] {
        if let Some(group) = shared.planner.plan_level(level) {
            groups.insert(level, group);
        }
    }
    let l4 = shared
        .planner
        .plan(shared.filestore.last_modified())
        .or_else(|| shared.planner.plan_optimize());
    if let Some(group) = l4 {
        groups.insert(CompactionLevel::Optimize, group);
    }

    for level in CompactionLevel::SCHEDULED {
        shared.tracker.set_queue(level, u64::from(groups.contains_key(&level)));
    }

    let max_concurrent = shared.config.resolved_compaction_max_concurrent();
    let chosen = shared.scheduler.next(&shared.tracker, max_concurrent);

    if let Some(level) = chosen {
        if let Some(group) = groups.remove(&level) {
            match shared.limiter.try_take() {
                Some(permit) => {
                    tracing::debug!(?level, files = group.files.len(), "dispatching compaction");
                    // Counted here, synchronously on the tick thread, rather than inside the
                    // worker: a delete's wait for `AllActive() == 0` must never observe zero while
                    // a group has already been handed off but has not yet started running.
                    shared.tracker.inc_active(level);
                    let worker_shared = Arc::clone(shared);
                    std::thread::spawn(move || {
                        let _permit = permit;
                        compaction::run_group(
                            group,
                            &worker_shared.tracker,
                            &worker_shared.compactor,
                            &worker_shared.filestore,
                            &worker_shared.planner,
                        );
                    });
                }
                None => shared.planner.release(&group),
            }
        }
    }

    for group in groups.into_values() {
        shared.planner.release(&group);
    }
}

pub(crate) fn spawn(shared: Arc<Shared>, stop: Receiver<()>) -> JoinHandle<()> {
    std::thread::spawn(move || loop {
        match stop.recv_timeout(TICK_INTERVAL) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        tick(&shared);
    })
}
