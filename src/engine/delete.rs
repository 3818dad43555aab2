//! `DeleteSeriesRange` / `DeleteMeasurement`: the four-phase delete-across-tiers protocol
//! (spec.md §4.6, §4.6.1).
//!
//! Compactions are held off for the whole delete (`disableLevelCompactions(true)`, plus a wait for
//! any already-dispatched compaction worker to drain) so a concurrent compaction cannot garbage-
//! collect a tombstone before it is durable. The race documented between phases C and D — a write
//! landing in that window can cause its series to be dropped from the index even though the write
//! survives in the Cache — is accepted by design (spec.md §9 open question a) and is not fixed
//! here.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::Result;
use crate::format::{strip_field, CompositeKey};

use super::{Engine, Shared};

pub(super) fn delete_measurement(engine: &Engine, measurement: &[u8]) -> Result<()> {
    let series_keys = engine.shared.index.series_in_measurement(measurement);
    delete_series_range(engine, &series_keys, i64::MIN, i64::MAX)
}

pub(super) fn delete_series_range(engine: &Engine, series_keys: &[Vec<u8>], min: i64, max: i64) -> Result<()> {
    if series_keys.is_empty() {
        return Ok(());
    }
    let mut series_keys: Vec<Vec<u8>> = series_keys.to_vec();
    series_keys.sort_unstable();
    series_keys.dedup();

    tracing::debug!(series = series_keys.len(), min, max, "delete: quiescing compactions");
    engine.shared.index.disable_compactions();
    engine.level_gate.disable(true);
    // `level_gate.disable` only stops the tick loop from starting new groups; a group it already
    // dispatched to a worker thread before the stop signal lands is still running. Wait for it to
    // finish too, so a tombstone committed in Phase A is never clobbered by an in-flight compaction
    // replacing the very file it was just written to.
    while engine.shared.tracker.all_active() > 0 {
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    let _file_set = engine.shared.index.retain_file_set();
    engine.shared.index.wait();

    let result = run_phases(&engine.shared, &series_keys, min, max)
        .and_then(|()| engine.shared.index.rebuild());
    if let Err(err) = &result {
        tracing::warn!(%err, "delete: phase protocol failed");
    }

    engine.level_gate.enable(true, |rx| super::level_loop::spawn(std::sync::Arc::clone(&engine.shared), rx));
    engine.shared.index.enable_compactions();
    tracing::debug!("delete: compactions re-enabled");

    result
}

fn run_phases(shared: &Shared, series_keys: &[Vec<u8>], min: i64, max: i64) -> Result<()> {
    // Phase A: tombstone TSM files in parallel.
    shared.filestore.apply(|file| {
        let mut file = file.lock();
        let (tsm_min, tsm_max) = {
            let (lo, hi) = file.series_key_range();
            (lo.to_vec(), hi.to_vec())
        };
        let (file_min_time, file_max_time) = file.time_range();
        let key_overlap = tsm_max.as_slice() >= series_keys[0].as_slice()
            && tsm_min.as_slice() <= series_keys[series_keys.len() - 1].as_slice();
        let time_overlap = file_max_time >= min && file_min_time <= max;
        if !key_overlap && !time_overlap {
            return Ok(());
        }

        let keys: Vec<CompositeKey> = file.iterator(&[]).cloned().collect();
        let mut batch = file.batch_delete();
        let mut j = 0usize;
        for key in &keys {
            let series = strip_field(key);
            while j < series_keys.len() && series_keys[j].as_slice() < series {
                j += 1;
            }
            if j < series_keys.len() && series_keys[j].as_slice() == series {
                batch.delete_range(key, min, max);
            }
        }
        batch.commit(shared.fs.as_ref())
    })?;

    // Phase B: match and delete in Cache and WAL.
    let mut delete_keys: Vec<CompositeKey> = Vec::new();
    shared.cache.apply_entry_fn(|key, _entry| {
        let series = strip_field(key);
        if series_keys.binary_search_by(|k| k.as_slice().cmp(series)).is_ok() {
            delete_keys.push(key.clone());
        }
        Ok(())
    })?;
    delete_keys.sort_unstable();
    shared.cache.delete_range(&delete_keys, min, max);
    shared.wal.delete_range(&delete_keys, min, max)?;

    // Phase C: reconcile index — negate (mark as "still exists") any series that still has data
    // on disk after tombstoning.
    let survives: Vec<AtomicBool> = series_keys.iter().map(|_| AtomicBool::new(false)).collect();
    shared.filestore.apply(|file| {
        let file = file.lock();
        let keys: Vec<CompositeKey> = file.iterator(&[]).cloned().collect();
        let mut j = 0usize;
        for key in &keys {
            let series = strip_field(key);
            while j < series_keys.len() && series_keys[j].as_slice() < series {
                j += 1;
            }
            if j < series_keys.len() && series_keys[j].as_slice() == series && !file.values_for(key).is_empty() {
                survives[j].store(true, Ordering::Relaxed);
            }
        }
        Ok(())
    })?;

    // Phase D: drop from index/series file.
    let mut measurements = HashSet::new();
    let mut sids = Vec::new();
    for (k, series_key) in series_keys.iter().enumerate() {
        if survives[k].load(Ordering::Relaxed) {
            continue;
        }
        let sid = shared.index.series_id(series_key);
        if sid == 0 {
            continue;
        }
        if cache_has_series(shared, series_key) {
            continue;
        }
        shared.index.drop_series(sid, series_key, false)?;
        sids.push(sid);
        if let Some(measurement) = measurement_of(series_key) {
            measurements.insert(measurement.to_vec());
        }
    }

    for measurement in &measurements {
        shared.index.drop_measurement_if_series_not_exist(measurement)?;
    }
    for sid in &sids {
        shared.index.delete_series_id(*sid)?;
    }
    Ok(())
}

fn measurement_of(series_key: &[u8]) -> Option<&[u8]> {
    series_key.iter().position(|&b| b == b',').map(|idx| &series_key[..idx])
}

/// Whether any live Cache entry remains for `series_key` — a concurrent write may have re-added
/// it between phases C and D, in which case the series must not be dropped.
fn cache_has_series(shared: &Shared, series_key: &[u8]) -> bool {
    let mut found = false;
    let _ = shared.cache.apply_entry_fn(|key, entry| {
        if !found && strip_field(key) == series_key && !entry.values.is_empty() {
            found = true;
        }
        Ok(())
    });
    found
}
