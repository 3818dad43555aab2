//! The in-memory Cache: ordered values per composite key, with snapshot/deduplicate/clear
//! semantics (spec.md §3-4.3).
//!
//! Sharded into a fixed number of independently-locked buckets so `WriteMulti`, `DeleteRange`,
//! and `ApplyEntryFn` scale with concurrent callers rather than serializing on a single global
//! lock. Each shard is a plain `BTreeMap`: composite keys are already byte-comparable, and this
//! core's working set (one shard's worth of series) does not need a skiplist's incremental-insert
//! concurrency.

mod entry;

pub use entry::Entry;

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::format::{CompositeKey, TimestampedValue};

const SHARD_COUNT: usize = 16;

type Shard = RwLock<BTreeMap<CompositeKey, Entry>>;

/// An immutable view of the cache captured by [`Cache::snapshot`], pending a `WriteSnapshot` to
/// disk and a [`Cache::clear_snapshot`].
pub struct Snapshot {
    entries: BTreeMap<CompositeKey, Entry>,
    size: usize,
}

impl Snapshot {
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Sorts and deduplicates every entry by timestamp. Expensive; the caller (`WriteSnapshot`)
    /// runs this outside the engine's write lock so it does not block writers.
    pub fn deduplicate(&mut self) {
        for entry in self.entries.values_mut() {
            entry.deduplicate();
        }
    }

    /// Iterates entries in ascending composite-key order, matching the TSM invariant that keys
    /// within a file are sorted.
    pub fn iter(&self) -> impl Iterator<Item = (&CompositeKey, &Entry)> {
        self.entries.iter()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct Cache {
    shards: Vec<Shard>,
    max_memory_size: usize,
    size: AtomicUsize,
    /// Set by [`Cache::snapshot`], cleared by [`Cache::clear_snapshot`]. `true` for longer than
    /// one `WriteSnapshot` cycle is a caller bug — the engine's snapshot gate guarantees at most
    /// one outstanding snapshot (spec.md §3).
    snapshot_outstanding: AtomicBool,
    last_write_time: AtomicI64,
    started_at: Instant,
}

impl Cache {
    #[must_use]
    pub fn new(max_memory_size: usize) -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(RwLock::new(BTreeMap::new()));
        }
        Self {
            shards,
            max_memory_size,
            size: AtomicUsize::new(0),
            snapshot_outstanding: AtomicBool::new(false),
            last_write_time: AtomicI64::new(0),
            started_at: Instant::now(),
        }
    }

    fn shard_for(&self, key: &[u8]) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Writes a batch of composite-key/value-series pairs. Rejects the whole batch with
    /// [`Error::CacheMaxMemorySizeExceeded`] if admitting it would exceed `max_memory_size`
    /// (`0` disables the limit).
    pub fn write_multi(&self, values: &BTreeMap<CompositeKey, Vec<TimestampedValue>>) -> Result<()> {
        let incoming: usize = values
            .values()
            .flat_map(|vs| vs.iter())
            .map(|v| 8 + v.value_size_hint())
            .sum();
        let current = self.size.load(Ordering::Relaxed);
        if self.max_memory_size != 0 && current + incoming > self.max_memory_size {
            return Err(Error::CacheMaxMemorySizeExceeded { size: current, incoming, limit: self.max_memory_size });
        }

        for (key, series) in values {
            let shard = self.shard_for(key);
            let mut shard = shard.write();
            shard.entry(key.clone()).or_default().append(series);
        }

        self.size.fetch_add(incoming, Ordering::Relaxed);
        self.last_write_time.store(self.started_at.elapsed().as_nanos() as i64, Ordering::Relaxed);
        Ok(())
    }

    /// Moves every live entry into a new [`Snapshot`], leaving the cache empty for new writes.
    ///
    /// Panics if a snapshot is already outstanding — the engine's snapshot gate (spec.md §4.1)
    /// ensures this is never called concurrently with itself.
    pub fn snapshot(&self) -> Snapshot {
        let already = self.snapshot_outstanding.swap(true, Ordering::AcqRel);
        assert!(!already, "Cache::snapshot called with a snapshot already outstanding");

        let mut entries = BTreeMap::new();
        let mut size = 0usize;
        for shard in &self.shards {
            let mut shard = shard.write();
            for (key, entry) in std::mem::take(&mut *shard) {
                size += entry.size_bytes();
                entries.insert(key, entry);
            }
        }
        self.size.fetch_sub(size.min(self.size.load(Ordering::Relaxed)), Ordering::Relaxed);

        Snapshot { entries, size }
    }

    /// Resolves the outstanding snapshot. `success = true` discards it (the data is now durable
    /// in a TSM file); `success = false` merges it back into the live cache as a rollback.
    pub fn clear_snapshot(&self, snapshot: Snapshot, success: bool) {
        self.snapshot_outstanding.store(false, Ordering::Release);

        if success {
            return;
        }

        for (key, entry) in snapshot.entries {
            let shard = self.shard_for(&key);
            let mut shard = shard.write();
            shard.entry(key).or_default().values.extend(entry.values);
        }
        self.size.fetch_add(snapshot.size, Ordering::Relaxed);
    }

    /// Calls `f` once per live composite key/entry, in arbitrary (shard) order. Used by
    /// `deleteSeriesRange` Phase B to find entries whose series matches a delete set.
    pub fn apply_entry_fn(&self, mut f: impl FnMut(&CompositeKey, &Entry) -> Result<()>) -> Result<()> {
        for shard in &self.shards {
            let shard = shard.read();
            for (key, entry) in shard.iter() {
                f(key, entry)?;
            }
        }
        Ok(())
    }

    /// Deletes `[min, max]` from every entry named in `keys`, dropping entries left empty.
    pub fn delete_range(&self, keys: &[CompositeKey], min: i64, max: i64) {
        for key in keys {
            let shard = self.shard_for(key);
            let mut shard = shard.write();
            let Some(entry) = shard.get_mut(key) else { continue };
            let before = entry.size_bytes();
            let emptied = entry.delete_range(min, max);
            let after = if emptied { 0 } else { entry.size_bytes() };
            self.size.fetch_sub(before.saturating_sub(after), Ordering::Relaxed);
            if emptied {
                shard.remove(key);
            }
        }
    }

    /// Live (non-snapshot) byte size, used by `ShouldCompactCache` and admission control.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Exists for API parity with the system this core is modeled on, whose cache periodically
    /// refreshes an age gauge for its memory-pressure metrics. Metrics are an external
    /// collaborator here (spec.md §1), so this is a no-op hook the snapshot loop still calls.
    pub fn update_age(&self) {}

    #[must_use]
    pub fn last_write_time(&self) -> Instant {
        self.started_at + std::time::Duration::from_nanos(self.last_write_time.load(Ordering::Relaxed).max(0) as u64)
    }

    /// Drops every shard's backing map and reallocates empty ones, releasing held capacity.
    /// Called after `disableSnapshotCompactions` observes an empty cache.
    pub fn free(&self) {
        for shard in &self.shards {
            let mut shard = shard.write();
            *shard = BTreeMap::new();
        }
    }
}

impl TimestampedValue {
    fn value_size_hint(&self) -> usize {
        use crate::format::Value;
        match &self.value {
            Value::Float(_) | Value::Integer(_) | Value::Unsigned(_) => 8,
            Value::Boolean(_) => 1,
            Value::String(s) => s.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Value;

    fn entries(pairs: &[(&[u8], i64, f64)]) -> BTreeMap<CompositeKey, Vec<TimestampedValue>> {
        let mut map = BTreeMap::new();
        for (key, ts, v) in pairs {
            map.entry(key.to_vec()).or_insert_with(Vec::new).push(TimestampedValue::new(*ts, Value::Float(*v)));
        }
        map
    }

    #[test]
    fn write_then_snapshot_empties_live_cache() {
        let cache = Cache::new(0);
        cache.write_multi(&entries(&[(b"cpu#!~#usage", 1, 0.5)])).unwrap();
        assert_eq!(cache.size(), 8 + 8);

        let snap = cache.snapshot();
        assert_eq!(cache.size(), 0);
        assert!(!snap.is_empty());

        cache.clear_snapshot(snap, true);
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn rollback_restores_live_cache() {
        let cache = Cache::new(0);
        cache.write_multi(&entries(&[(b"cpu#!~#usage", 1, 0.5)])).unwrap();
        let size_before = cache.size();
        let snap = cache.snapshot();
        cache.clear_snapshot(snap, false);
        assert_eq!(cache.size(), size_before);
    }

    #[test]
    fn write_multi_rejects_over_budget_batch() {
        let cache = Cache::new(4);
        let err = cache.write_multi(&entries(&[(b"cpu#!~#usage", 1, 0.5)])).unwrap_err();
        assert!(matches!(err, Error::CacheMaxMemorySizeExceeded { .. }));
    }

    #[test]
    fn delete_range_removes_matching_values() {
        let cache = Cache::new(0);
        cache.write_multi(&entries(&[(b"cpu#!~#usage", 5, 1.0)])).unwrap();
        cache.delete_range(&[b"cpu#!~#usage".to_vec()], 0, 10);
        assert_eq!(cache.size(), 0);
        let mut seen = 0;
        cache.apply_entry_fn(|_, _| { seen += 1; Ok(()) }).unwrap();
        assert_eq!(seen, 0);
    }
}
