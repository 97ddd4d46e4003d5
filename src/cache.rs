use crate::model::MetricSample;
use std::{
    collections::HashMap,
    sync::RwLock,
    time::{SystemTime, UNIX_EPOCH},
};

/// Entries older than this are swept by `purge` (§4.2).
const MAX_AGE_SECS: f64 = 6.0 * 60.0;

/// `(measurement, item) → most recent sample` (C2).
///
/// Single writer per key is assumed (the Threshold Engine owns `put`);
/// readers always observe the last fully-committed sample since the whole
/// map swap happens under one write lock.
#[derive(Default)]
pub struct SampleCache {
    entries: RwLock<HashMap<(String, Option<String>), MetricSample>>,
}

impl SampleCache {
    pub fn new() -> Self {
        SampleCache {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn put(&self, sample: MetricSample) {
        let key = sample.cache_key();
        self.entries.write().unwrap().insert(key, sample);
    }

    pub fn get(&self, measurement: &str, item: Option<&str>) -> Option<MetricSample> {
        let key = (measurement.to_string(), item.map(str::to_string));
        self.entries.read().unwrap().get(&key).cloned()
    }

    /// Remove entries older than [`MAX_AGE_SECS`] and anything named in
    /// `deleted`. Intended to run every 5 minutes from the Scheduler.
    pub fn purge(&self, now: f64, deleted: &[(String, Option<String>)]) {
        let mut guard = self.entries.write().unwrap();
        guard.retain(|key, sample| {
            if deleted.contains(key) {
                return false;
            }
            now - sample.time < MAX_AGE_SECS
        });
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }
}

/// Seconds since the epoch, as used throughout the pipeline for sample
/// timestamps and cache ages.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_roundtrips() {
        let cache = SampleCache::new();
        let sample = MetricSample::new("cpu_idle", 1000.0, 70.0);
        cache.put(sample.clone());

        let fetched = cache.get("cpu_idle", None).unwrap();
        assert_eq!(fetched.value, 70.0);
    }

    #[test]
    fn get_distinguishes_item() {
        let cache = SampleCache::new();
        cache.put(MetricSample::new("disk_used", 1000.0, 10.0).with_item("/"));
        cache.put(MetricSample::new("disk_used", 1000.0, 20.0).with_item("/home"));

        assert_eq!(cache.get("disk_used", Some("/")).unwrap().value, 10.0);
        assert_eq!(cache.get("disk_used", Some("/home")).unwrap().value, 20.0);
        assert!(cache.get("disk_used", Some("/tmp")).is_none());
    }

    #[test]
    fn purge_drops_stale_and_deleted_entries() {
        let cache = SampleCache::new();
        cache.put(MetricSample::new("cpu_idle", 0.0, 70.0));
        cache.put(MetricSample::new("mem_used", 1000.0, 50.0));

        cache.purge(1000.0 + MAX_AGE_SECS + 1.0, &[]);
        assert!(cache.get("cpu_idle", None).is_none());
        assert!(cache.get("mem_used", None).is_some());

        cache.purge(1000.0, &[("mem_used".to_string(), None)]);
        assert!(cache.get("mem_used", None).is_none());
    }
}
