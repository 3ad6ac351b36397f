//! Backend registration and provider fan-in
//!
//! Backends register a startup function up front. During bring-up [`Registry::run_startup`]
//! calls each one in registration order; a backend that decides to run registers its
//! provider callbacks and hands its sampler over via [`crate::sampler::launch`]. The
//! rendering layer then pulls merged results with the `update_*` methods.

use crate::config::BackendVars;
use crate::error::{ErrorMap, Result};
use crate::gpu::{self, BackendStatus, MemoryInfo};
use crate::sampler::Sampler;
use crate::snapshot::SnapshotCache;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

/// Backend initialization function
pub type StartupFn = dyn Fn(&BackendVars, &Registry) -> Result<()> + Send + Sync;

/// Temperature provider: merge into `out`, return this backend's errors
pub type TemperatureFn = dyn Fn(&mut HashMap<String, i32>) -> ErrorMap + Send + Sync;

/// Memory provider: merge into `out`, return this backend's errors
pub type MemoryFn = dyn Fn(&mut HashMap<String, MemoryInfo>) -> ErrorMap + Send + Sync;

/// Usage provider: merge into `out`, return this backend's errors. The flag asks for
/// per-device rather than aggregate values where a backend distinguishes them.
pub type UsageFn = dyn Fn(&mut HashMap<String, i32>, bool) -> ErrorMap + Send + Sync;

/// Process-wide set of backends and their provider callbacks
#[derive(Default)]
pub struct Registry {
    startups: Mutex<Vec<(&'static str, Arc<StartupFn>)>>,
    temperature: RwLock<Vec<Box<TemperatureFn>>>,
    memory: RwLock<Vec<Box<MemoryFn>>>,
    usage: RwLock<Vec<Box<UsageFn>>>,
    status: Mutex<BTreeMap<&'static str, BackendStatus>>,
    caches: Mutex<BTreeMap<&'static str, Arc<SnapshotCache>>>,
    samplers: Mutex<Vec<Sampler>>,
    started: AtomicBool,
}

impl Registry {
    /// Empty registry with no backends
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every backend compiled into this build
    pub fn with_builtin_backends() -> Self {
        let registry = Self::new();
        gpu::register_builtin(&registry);
        registry
    }

    /// Append a backend initialization function
    pub fn register_startup<F>(&self, key: &'static str, f: F)
    where
        F: Fn(&BackendVars, &Registry) -> Result<()> + Send + Sync + 'static,
    {
        lock(&self.startups).push((key, Arc::new(f)));
        lock(&self.status).entry(key).or_insert(BackendStatus::Disabled);
    }

    pub fn register_temperature<F>(&self, f: F)
    where
        F: Fn(&mut HashMap<String, i32>) -> ErrorMap + Send + Sync + 'static,
    {
        write(&self.temperature).push(Box::new(f));
    }

    pub fn register_memory<F>(&self, f: F)
    where
        F: Fn(&mut HashMap<String, MemoryInfo>) -> ErrorMap + Send + Sync + 'static,
    {
        write(&self.memory).push(Box::new(f));
    }

    pub fn register_usage<F>(&self, f: F)
    where
        F: Fn(&mut HashMap<String, i32>, bool) -> ErrorMap + Send + Sync + 'static,
    {
        write(&self.usage).push(Box::new(f));
    }

    /// Run every startup function once, in registration order.
    ///
    /// The first error aborts bring-up. Backends that decide not to run return `Ok`
    /// and stay [`BackendStatus::Disabled`]. Bring-up is single-shot: later calls
    /// return `Ok` without touching any backend.
    pub fn run_startup(&self, vars: &BackendVars) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            log::warn!("backend startup already ran, ignoring");
            return Ok(());
        }
        let startups: Vec<_> = lock(&self.startups).clone();
        for (key, startup) in startups {
            self.set_status(key, BackendStatus::Initializing);
            let result = startup(vars, self);
            if self.status(key) == Some(BackendStatus::Initializing) {
                self.set_status(key, BackendStatus::Disabled);
            }
            if let Err(e) = result {
                log::error!("{} startup failed: {}", key, e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Merge every temperature provider into `out`
    pub fn update_temperatures(&self, out: &mut HashMap<String, i32>) -> ErrorMap {
        let mut errors = ErrorMap::new();
        for provider in read(&self.temperature).iter() {
            errors.extend(provider(&mut *out));
        }
        errors
    }

    /// Merge every memory provider into `out`
    pub fn update_memory(&self, out: &mut HashMap<String, MemoryInfo>) -> ErrorMap {
        let mut errors = ErrorMap::new();
        for provider in read(&self.memory).iter() {
            errors.extend(provider(&mut *out));
        }
        errors
    }

    /// Merge every usage provider into `out`
    pub fn update_usage(&self, out: &mut HashMap<String, i32>, per_device: bool) -> ErrorMap {
        let mut errors = ErrorMap::new();
        for provider in read(&self.usage).iter() {
            errors.extend(provider(&mut *out, per_device));
        }
        errors
    }

    /// Lifecycle state of a registered backend
    pub fn status(&self, key: &str) -> Option<BackendStatus> {
        lock(&self.status).get(key).copied()
    }

    /// Status of every registered backend, ordered by key
    pub fn statuses(&self) -> Vec<(&'static str, BackendStatus)> {
        lock(&self.status).iter().map(|(k, v)| (*k, *v)).collect()
    }

    /// When a running backend last published metrics
    pub fn last_updated(&self, key: &str) -> Option<DateTime<Utc>> {
        lock(&self.caches).get(key).map(|cache| cache.last_updated())
    }

    /// Stop every sampler and wait for in-flight cycles to finish.
    ///
    /// Provider callbacks keep serving the last published snapshots.
    pub fn shutdown(&self) {
        let samplers = std::mem::take(&mut *lock(&self.samplers));
        for sampler in samplers {
            log::debug!("stopping {} sampler", sampler.name());
            sampler.stop();
        }
        for status in lock(&self.status).values_mut() {
            if *status == BackendStatus::Running {
                *status = BackendStatus::Disabled;
            }
        }
    }

    pub(crate) fn set_status(&self, key: &'static str, status: BackendStatus) {
        lock(&self.status).insert(key, status);
    }

    pub(crate) fn attach(&self, key: &'static str, cache: Arc<SnapshotCache>, sampler: Sampler) {
        lock(&self.caches).insert(key, cache);
        lock(&self.samplers).push(sampler);
        self.set_status(key, BackendStatus::Running);
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("status", &*lock(&self.status))
            .field("temperature_providers", &read(&self.temperature).len())
            .field("memory_providers", &read(&self.memory).len())
            .field("usage_providers", &read(&self.usage).len())
            .finish()
    }
}

/// The process-wide registry, populated with the built-in backends on first use
pub fn global() -> &'static Registry {
    static GLOBAL: OnceLock<Registry> = OnceLock::new();
    GLOBAL.get_or_init(Registry::with_builtin_backends)
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}
