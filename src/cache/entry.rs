//! A single composite key's in-memory value series.

use crate::format::TimestampedValue;

/// The values held in the Cache for one composite key.
///
/// Values are appended in write order and are not kept sorted on the hot path; sorting and
/// timestamp deduplication happen once, in [`Entry::deduplicate`], when a snapshot is taken.
#[derive(Debug, Clone, Default)]
pub struct Entry {
    pub values: Vec<TimestampedValue>,
}

impl Entry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, values: &[TimestampedValue]) {
        self.values.extend_from_slice(values);
    }

    /// Rough byte footprint, used for `Cache.MaxMemorySize` admission accounting. Not exact (it
    /// ignores allocator overhead and `Vec` growth slack), but stable and cheap.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.values.iter().map(value_size).sum()
    }

    /// Sorts by timestamp and drops all but the last-written value for each timestamp.
    pub fn deduplicate(&mut self) {
        // `sort_by` is stable, so a run of equal timestamps stays in write order; `dedup_by_key`
        // keeps the *first* of each run, so the run is reversed around the dedup to keep the last
        // write instead, then reversed back to restore ascending timestamp order.
        self.values.sort_by(crate::format::cmp_by_timestamp);
        self.values.reverse();
        self.values.dedup_by_key(|v| v.timestamp);
        self.values.reverse();
    }

    /// Removes every value whose timestamp falls in `[min, max]`.
    ///
    /// Returns `true` if the entry is now empty and should be dropped entirely.
    #[must_use]
    pub fn delete_range(&mut self, min: i64, max: i64) -> bool {
        self.values.retain(|v| v.timestamp < min || v.timestamp > max);
        self.values.is_empty()
    }
}

fn value_size(v: &TimestampedValue) -> usize {
    use crate::format::Value;
    8 + match &v.value {
        Value::Float(_) | Value::Integer(_) | Value::Unsigned(_) => 8,
        Value::Boolean(_) => 1,
        Value::String(s) => s.len(),
    }
}
