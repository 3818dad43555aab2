//! The measurement/series index and series file, treated as an external collaborator
//! (spec.md §1): the core only ever calls `DisableCompactions/Enable/Wait`, `DropSeries`,
//! `DropMeasurementIfSeriesNotExist`, `SeriesID`, `DeleteSeriesID`, and `RetainFileSet`.
//!
//! [`InMemoryIndex`] is a minimal implementation satisfying the trait for tests and for running
//! the engine standalone; a real deployment would plug in the measurement index and series file
//! this core is designed to sit next to.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::error::Result;

/// A series identifier. `0` is the sentinel for "no such series" (spec.md §4.6.1 Phase D).
pub type SeriesId = u64;

/// Held for the duration of a `deleteSeriesRange` delete, preventing compactions from garbage
/// collecting file-set entries the delete still needs to walk.
pub trait FileSetGuard: Send {}

/// The interface `DeleteSeriesRangeWithPredicate` (spec.md §4.6) consumes.
pub trait Index: Send + Sync {
    fn disable_compactions(&self);
    fn enable_compactions(&self);
    /// Blocks until any in-flight index compaction started before `disable_compactions` settles.
    fn wait(&self);

    /// Retains a consistent view of the on-disk file set for the duration of a delete.
    fn retain_file_set(&self) -> Box<dyn FileSetGuard>;

    /// `0` if no such series is registered.
    fn series_id(&self, series_key: &[u8]) -> SeriesId;
    /// Every series key currently registered under `measurement`. Used by `DeleteMeasurement`
    /// (spec.md §6) to derive a series iterator to delegate to `DeleteSeriesRange`.
    fn series_in_measurement(&self, measurement: &[u8]) -> Vec<Vec<u8>>;
    fn drop_series(&self, sid: SeriesId, series_key: &[u8], cascade: bool) -> Result<()>;
    fn delete_series_id(&self, sid: SeriesId) -> Result<()>;
    fn drop_measurement_if_series_not_exist(&self, measurement: &[u8]) -> Result<()>;

    /// Called once at the end of `DeleteSeriesRangeWithPredicate` (spec.md §4.6 step 6).
    fn rebuild(&self) -> Result<()>;
}

struct NoopGuard;
impl FileSetGuard for NoopGuard {}

/// A minimal, process-local index: assigns series IDs on first sight and tracks, per
/// measurement, which series still exist, so `DropMeasurementIfSeriesNotExist` is meaningful.
#[derive(Default)]
pub struct InMemoryIndex {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: SeriesId,
    series_ids: HashMap<Vec<u8>, SeriesId>,
    series_by_id: HashMap<SeriesId, Vec<u8>>,
    series_by_measurement: HashMap<Vec<u8>, HashSet<SeriesId>>,
}

impl InMemoryIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `series_key` (idempotently) and returns its ID. Not part of the `Index` trait —
    /// this core never creates series itself, but tests need a way to seed the index.
    pub fn create_series(&self, series_key: &[u8]) -> SeriesId {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&id) = inner.series_ids.get(series_key) {
            return id;
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner.series_ids.insert(series_key.to_vec(), id);
        inner.series_by_id.insert(id, series_key.to_vec());
        let measurement = measurement_of(series_key).to_vec();
        inner.series_by_measurement.entry(measurement).or_default().insert(id);
        id
    }
}

fn measurement_of(series_key: &[u8]) -> &[u8] {
    series_key.iter().position(|&b| b == b',').map_or(series_key, |idx| &series_key[..idx])
}

impl Index for InMemoryIndex {
    fn disable_compactions(&self) {}
    fn enable_compactions(&self) {}
    fn wait(&self) {}

    fn retain_file_set(&self) -> Box<dyn FileSetGuard> {
        Box::new(NoopGuard)
    }

    fn series_id(&self, series_key: &[u8]) -> SeriesId {
        self.inner.lock().unwrap().series_ids.get(series_key).copied().unwrap_or(0)
    }

    fn series_in_measurement(&self, measurement: &[u8]) -> Vec<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        let Some(ids) = inner.series_by_measurement.get(measurement) else { return Vec::new() };
        ids.iter().filter_map(|id| inner.series_by_id.get(id).cloned()).collect()
    }

    fn drop_series(&self, sid: SeriesId, series_key: &[u8], _cascade: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.series_ids.remove(series_key);
        inner.series_by_id.remove(&sid);
        let measurement = measurement_of(series_key).to_vec();
        if let Some(set) = inner.series_by_measurement.get_mut(&measurement) {
            set.remove(&sid);
        }
        Ok(())
    }

    fn delete_series_id(&self, sid: SeriesId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(key) = inner.series_by_id.remove(&sid) {
            inner.series_ids.remove(&key);
        }
        Ok(())
    }

    fn drop_measurement_if_series_not_exist(&self, measurement: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.series_by_measurement.get(measurement).is_some_and(HashSet::is_empty) {
            inner.series_by_measurement.remove(measurement);
        }
        Ok(())
    }

    fn rebuild(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_drop_series_clears_measurement() {
        let index = InMemoryIndex::new();
        let sid = index.create_series(b"cpu,host=a");
        assert_ne!(sid, 0);
        assert_eq!(index.series_id(b"cpu,host=a"), sid);

        index.drop_series(sid, b"cpu,host=a", false).unwrap();
        assert_eq!(index.series_id(b"cpu,host=a"), 0);
        index.drop_measurement_if_series_not_exist(b"cpu").unwrap();
    }

    #[test]
    fn delete_series_id_is_idempotent() {
        let index = InMemoryIndex::new();
        let sid = index.create_series(b"mem,host=a");
        index.delete_series_id(sid).unwrap();
        index.delete_series_id(sid).unwrap();
        assert_eq!(index.series_id(b"mem,host=a"), 0);
    }

    #[test]
    fn series_in_measurement_lists_only_that_measurement() {
        let index = InMemoryIndex::new();
        index.create_series(b"cpu,host=a");
        index.create_series(b"cpu,host=b");
        index.create_series(b"mem,host=a");

        let mut cpu_series = index.series_in_measurement(b"cpu");
        cpu_series.sort();
        assert_eq!(cpu_series, vec![b"cpu,host=a".to_vec(), b"cpu,host=b".to_vec()]);
        assert_eq!(index.series_in_measurement(b"disk"), Vec::<Vec<u8>>::new());
    }
}
