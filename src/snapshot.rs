//! Per-backend snapshot cache
//!
//! A [`Snapshot`] is built off to the side by the sampling task and then swapped in
//! whole. Readers clone the `Arc` under the lock and copy out after releasing it, so
//! they only ever see one complete cycle.

use crate::error::{Error, ErrorMap};
use crate::gpu::{Backend, MemoryInfo};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

/// Metrics and errors from one sampling cycle of one backend
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Temperature per device label, whole degrees Celsius
    pub temperatures: HashMap<String, i32>,
    /// Memory counters per device label
    pub memory: HashMap<String, MemoryInfo>,
    /// Utilization per device label (0-100)
    pub usage: HashMap<String, i32>,
    /// Last error per device label, or under the backend key
    pub errors: ErrorMap,
    /// When the metric maps were read
    pub taken_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self {
            temperatures: HashMap::new(),
            memory: HashMap::new(),
            usage: HashMap::new(),
            errors: ErrorMap::new(),
            taken_at: Utc::now(),
        }
    }

    /// Record `err` against a device label or backend key, replacing any earlier one
    pub fn record_error(&mut self, label: &str, err: Error) {
        self.errors.insert(label.to_string(), Arc::new(err));
    }

    /// Every device label appearing in any metric map or the error map
    pub fn labels(&self) -> BTreeSet<&str> {
        self.temperatures
            .keys()
            .chain(self.memory.keys())
            .chain(self.usage.keys())
            .chain(self.errors.keys())
            .map(String::as_str)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.temperatures.is_empty() && self.memory.is_empty() && self.usage.is_empty()
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new()
    }
}

/// The one live snapshot of a backend
#[derive(Debug)]
pub struct SnapshotCache {
    key: &'static str,
    current: Mutex<Arc<Snapshot>>,
}

impl SnapshotCache {
    pub fn new(key: &'static str) -> Self {
        Self {
            key,
            current: Mutex::new(Arc::new(Snapshot::new())),
        }
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    /// Current snapshot
    pub fn load(&self) -> Arc<Snapshot> {
        let guard = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Replace the live snapshot wholesale
    pub fn publish(&self, snapshot: Snapshot) {
        let next = Arc::new(snapshot);
        let mut guard = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = next;
    }

    /// Keep the previous metric maps, adding a backend-wide error under the backend key.
    ///
    /// Only the owning sampler publishes, so the read-modify-publish below cannot race
    /// another writer.
    pub fn publish_discovery_error(&self, err: Error) {
        let mut next = (*self.load()).clone();
        next.record_error(self.key, err);
        self.publish(next);
    }

    /// Run one full cycle of `backend` and publish the outcome
    pub fn refresh<B: Backend + ?Sized>(&self, backend: &B) {
        let sampled = panic::catch_unwind(AssertUnwindSafe(|| backend.sample()))
            .unwrap_or_else(|payload| {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(Error::QueryFailed(format!("sampling panicked: {}", message)))
            });
        match sampled {
            Ok(snapshot) => self.publish(snapshot),
            Err(e) => {
                log::warn!("{} discovery failed, keeping last snapshot: {}", self.key, e);
                self.publish_discovery_error(e);
            }
        }
    }

    /// Merge cached temperatures into `out`
    pub fn copy_temperatures(&self, out: &mut HashMap<String, i32>) -> ErrorMap {
        let snapshot = self.load();
        out.extend(snapshot.temperatures.iter().map(|(k, v)| (k.clone(), *v)));
        snapshot.errors.clone()
    }

    /// Merge cached memory counters into `out`
    pub fn copy_memory(&self, out: &mut HashMap<String, MemoryInfo>) -> ErrorMap {
        let snapshot = self.load();
        out.extend(snapshot.memory.iter().map(|(k, v)| (k.clone(), *v)));
        snapshot.errors.clone()
    }

    /// Merge cached utilization into `out`
    pub fn copy_usage(&self, out: &mut HashMap<String, i32>) -> ErrorMap {
        let snapshot = self.load();
        out.extend(snapshot.usage.iter().map(|(k, v)| (k.clone(), *v)));
        snapshot.errors.clone()
    }

    /// When the live metric maps were read
    pub fn last_updated(&self) -> DateTime<Utc> {
        self.load().taken_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::gpu::Provides;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::thread;

    fn generation(gen: i32, devices: usize) -> Snapshot {
        let mut snapshot = Snapshot::new();
        for d in 0..devices {
            let label = format!("GPU.{}", d);
            snapshot.temperatures.insert(label.clone(), gen);
            snapshot.usage.insert(label.clone(), gen);
            snapshot.memory.insert(
                label,
                MemoryInfo::from_counters(1000, gen as u64).unwrap(),
            );
        }
        snapshot
    }

    #[test]
    fn test_copy_merges_into_caller_map() {
        let cache = SnapshotCache::new("test");
        cache.publish(generation(7, 2));

        let mut temps = HashMap::new();
        temps.insert("other.0".to_string(), 99);
        let errors = cache.copy_temperatures(&mut temps);
        assert!(errors.is_empty());
        assert_eq!(temps.len(), 3);
        assert_eq!(temps["GPU.1"], 7);
        assert_eq!(temps["other.0"], 99);
    }

    #[test]
    fn test_discovery_error_keeps_previous_metrics() {
        let cache = SnapshotCache::new("amd");
        cache.publish(generation(3, 1));
        let before = cache.last_updated();

        cache.publish_discovery_error(Error::Config("unreadable".into()));

        let mut usage = HashMap::new();
        let errors = cache.copy_usage(&mut usage);
        assert_eq!(usage["GPU.0"], 3);
        assert!(errors.contains_key("amd"));
        assert_eq!(cache.last_updated(), before);
    }

    struct Flaky {
        fail: AtomicBool,
    }

    impl Backend for Flaky {
        fn key(&self) -> &'static str {
            "flaky"
        }
        fn provides(&self) -> Provides {
            Provides::ALL
        }
        fn sample(&self) -> Result<Snapshot> {
            if self.fail.load(Ordering::SeqCst) {
                Err(Error::NoDevicesFound("gone".into()))
            } else {
                Ok(generation(1, 1))
            }
        }
    }

    #[test]
    fn test_refresh_recovers_on_next_cycle() {
        let cache = SnapshotCache::new("flaky");
        let backend = Flaky {
            fail: AtomicBool::new(true),
        };
        cache.refresh(&backend);
        assert!(cache.load().is_empty());
        assert!(cache.load().errors.contains_key("flaky"));

        backend.fail.store(false, Ordering::SeqCst);
        cache.refresh(&backend);
        let snapshot = cache.load();
        assert_eq!(snapshot.usage["GPU.0"], 1);
        assert!(snapshot.errors.is_empty());
    }

    struct Panicky;

    impl Backend for Panicky {
        fn key(&self) -> &'static str {
            "panicky"
        }
        fn provides(&self) -> Provides {
            Provides::ALL
        }
        fn sample(&self) -> Result<Snapshot> {
            panic!("sensor blew up");
        }
    }

    #[test]
    fn test_refresh_turns_panic_into_backend_error() {
        let cache = SnapshotCache::new("panicky");
        cache.publish(generation(4, 1));

        cache.refresh(&Panicky);
        cache.refresh(&Panicky);

        let snapshot = cache.load();
        assert_eq!(snapshot.usage["GPU.0"], 4);
        let err = snapshot.errors["panicky"].to_string();
        assert!(err.contains("sensor blew up"), "{}", err);
    }

    #[test]
    fn test_labels_union() {
        let mut snapshot = generation(1, 1);
        snapshot.record_error("GPU.9", Error::InvalidValue("x".into()));
        let labels: Vec<_> = snapshot.labels().into_iter().collect();
        assert_eq!(labels, vec!["GPU.0", "GPU.9"]);
    }

    #[test]
    fn test_readers_never_observe_mixed_generations() {
        let cache = Arc::new(SnapshotCache::new("stress"));
        cache.publish(generation(0, 8));
        let done = Arc::new(AtomicBool::new(false));
        let reads = Arc::new(AtomicU64::new(0));

        let writer = {
            let cache = Arc::clone(&cache);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                for gen in 1..=500 {
                    cache.publish(generation(gen, 8));
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let done = Arc::clone(&done);
                let reads = Arc::clone(&reads);
                thread::spawn(move || {
                    while !done.load(Ordering::SeqCst) {
                        let mut temps = HashMap::new();
                        let mut mems = HashMap::new();
                        cache.copy_temperatures(&mut temps);
                        let snapshot = cache.load();
                        cache.copy_memory(&mut mems);

                        assert_eq!(snapshot.temperatures.len(), 8);
                        let gens: BTreeSet<i32> = snapshot
                            .temperatures
                            .values()
                            .chain(snapshot.usage.values())
                            .copied()
                            .collect();
                        assert_eq!(gens.len(), 1, "mixed generations: {:?}", gens);
                        let temp_gens: BTreeSet<i32> = temps.values().copied().collect();
                        assert_eq!(temp_gens.len(), 1);
                        let mem_gens: BTreeSet<u64> = mems.values().map(|m| m.used).collect();
                        assert_eq!(mem_gens.len(), 1);
                        reads.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(cache.load().temperatures["GPU.0"], 500);
    }
}
