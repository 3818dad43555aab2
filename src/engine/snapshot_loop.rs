//! `compactCache`: the snapshot-compaction background loop (spec.md §4.3).

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::compaction::CompactionLevel;
use crate::compaction::constants::TICK_INTERVAL;
use crate::config::Config;
use crate::error::Result;

use super::Shared;

/// Takes the Cache's live values, persists them as a new level-1 TSM file, and frees the closed
/// WAL segments. Single-flight per engine: the caller (the snapshot gate) guarantees only one
/// invocation runs at a time.
pub(crate) fn write_snapshot(shared: &Shared) -> Result<()> {
    let mut snapshot = {
        let _guard = shared.rw.write();
        shared.wal.close_segment()?;
        shared.cache.snapshot()
    };
    let closed = shared.wal.closed_segments();

    if snapshot.is_empty() {
        shared.cache.clear_snapshot(snapshot, true);
        return Ok(());
    }

    // Expensive; deliberately done outside the write lock so writers are not blocked.
    snapshot.deduplicate();

    let new_path = shared.filestore.new_file_path(CompactionLevel::Level1);
    let new_file = match shared.compactor.write_snapshot(&snapshot, new_path.clone()) {
        Ok(file) => file,
        Err(err) => {
            shared.cache.clear_snapshot(snapshot, false);
            return Err(err);
        }
    };

    let _guard = shared.rw.read();
    if let Err(err) = shared.filestore.replace(&[], vec![new_file]) {
        drop(_guard);
        shared.cache.clear_snapshot(snapshot, false);
        return Err(err);
    }
    shared.planner.record_new_file(new_path, CompactionLevel::Level1);
    shared.cache.clear_snapshot(snapshot, true);
    shared.wal.remove(&closed)?;
    Ok(())
}

/// `Cache.Size() > CacheFlushMemorySizeThreshold ∨ (now − Cache.LastWriteTime) >
/// CacheFlushWriteColdDuration`, gated on a non-empty cache.
pub(crate) fn should_compact_cache(cache: &crate::cache::Cache, config: &Config, now: Instant) -> bool {
    if cache.size() == 0 {
        return false;
    }
    cache.size() > config.cache_snapshot_memory_size
        || now.saturating_duration_since(cache.last_write_time()) > config.cache_snapshot_write_cold_duration
}

pub(crate) fn spawn(shared: Arc<Shared>, stop: Receiver<()>) -> JoinHandle<()> {
    std::thread::spawn(move || loop {
        match stop.recv_timeout(TICK_INTERVAL) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        shared.cache.update_age();
        if should_compact_cache(&shared.cache, &shared.config, Instant::now()) {
            if let Err(err) = write_snapshot(&shared) {
                tracing::warn!(%err, "cache snapshot failed, will retry next tick");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;

    #[test]
    fn empty_cache_never_wants_a_snapshot() {
        let cache = Cache::new(0);
        let config = Config::default();
        assert!(!should_compact_cache(&cache, &config, Instant::now()));
    }

    #[test]
    fn oversized_cache_wants_a_snapshot() {
        let cache = Cache::new(0);
        let mut config = Config::default();
        config.cache_snapshot_memory_size = 1;
        let mut entries = std::collections::BTreeMap::new();
        entries.insert(b"cpu#!~#usage".to_vec(), vec![crate::format::TimestampedValue::new(1, crate::format::Value::Integer(1))]);
        cache.write_multi(&entries).unwrap();
        assert!(should_compact_cache(&cache, &config, Instant::now()));
    }
}
