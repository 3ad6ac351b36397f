// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2024 NervoSys

//! Backends driven by an opaque native device query
//!
//! Vendor libraries (NVML, IOKit) hand back an ordered device list without stable bus
//! information. [`QueryBackend`] adapts any [`GpuQuery`] into a [`Backend`], labeling
//! devices `<name>.<ordinal>`. Ordinals follow enumeration order and can shift when
//! devices are added or removed.

use crate::config::{refresh_interval, BackendVars, Enablement};
use crate::error::{Error, Result};
use crate::gpu::{Backend, MemoryInfo, Provides};
use crate::registry::Registry;
use crate::sampler;
use crate::snapshot::Snapshot;
use serde::{Deserialize, Serialize};

/// One device as reported by a native query
///
/// Implementations copy everything they need into this struct and release any
/// library-owned buffers before returning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceReading {
    pub name: String,
    /// Total memory in bytes
    pub total_memory: u64,
    /// Used memory in bytes
    pub used_memory: u64,
    /// Utilization percentage, `None` when the device does not report it
    pub utilization: Option<u32>,
    /// Temperature in °C, `None` when the device does not report it
    pub temperature: Option<i32>,
    /// Device-level failure reported alongside whatever fields were read
    pub error: Option<String>,
}

/// A device that could not be read at all
impl From<Error> for DeviceReading {
    fn from(err: Error) -> Self {
        DeviceReading {
            error: Some(err.to_string()),
            ..DeviceReading::default()
        }
    }
}

/// Native device enumeration + read
pub trait GpuQuery: Send + Sync + 'static {
    fn query(&self) -> Result<Vec<DeviceReading>>;
}

impl<F> GpuQuery for F
where
    F: Fn() -> Result<Vec<DeviceReading>> + Send + Sync + 'static,
{
    fn query(&self) -> Result<Vec<DeviceReading>> {
        self()
    }
}

/// [`Backend`] over a [`GpuQuery`]
pub struct QueryBackend<Q> {
    key: &'static str,
    vendor: &'static str,
    provides: Provides,
    query: Q,
}

impl<Q: GpuQuery> QueryBackend<Q> {
    pub fn new(key: &'static str, vendor: &'static str, provides: Provides, query: Q) -> Self {
        Self {
            key,
            vendor,
            provides,
            query,
        }
    }

    pub fn vendor(&self) -> &'static str {
        self.vendor
    }

    /// Query once and label the result
    pub fn readings(&self) -> Result<Vec<(String, DeviceReading)>> {
        Ok(self
            .query
            .query()?
            .into_iter()
            .enumerate()
            .map(|(idx, reading)| (ordinal_label(&reading.name, idx), reading))
            .collect())
    }
}

impl<Q: GpuQuery> Backend for QueryBackend<Q> {
    fn key(&self) -> &'static str {
        self.key
    }

    fn provides(&self) -> Provides {
        self.provides
    }

    fn sample(&self) -> Result<Snapshot> {
        let readings = self.readings()?;
        let mut snapshot = Snapshot::new();
        if readings.is_empty() {
            snapshot.record_error(
                self.key,
                Error::NoDevicesFound(format!("no {} GPUs reported", self.vendor)),
            );
            return Ok(snapshot);
        }

        for (label, reading) in readings {
            let device_failed = reading.error.is_some();
            if let Some(message) = reading.error {
                snapshot.record_error(&label, Error::QueryFailed(message));
            }

            if self.provides.memory {
                match MemoryInfo::from_counters(reading.total_memory, reading.used_memory) {
                    Ok(mem) => {
                        snapshot.memory.insert(label.clone(), mem);
                    }
                    Err(e) if !device_failed => snapshot.record_error(&label, e),
                    Err(_) => {}
                }
            }

            if self.provides.usage {
                match reading.utilization {
                    Some(util) => {
                        snapshot.usage.insert(label.clone(), util.min(100) as i32);
                    }
                    None if !device_failed => snapshot.record_error(
                        &label,
                        Error::InvalidValue("utilization unavailable".to_string()),
                    ),
                    None => {}
                }
            }

            if self.provides.temperature {
                match reading.temperature {
                    Some(temp) => {
                        snapshot.temperatures.insert(label.clone(), temp);
                    }
                    None if !device_failed => snapshot.record_error(
                        &label,
                        Error::InvalidValue("temperature unavailable".to_string()),
                    ),
                    None => {}
                }
            }
        }
        snapshot.taken_at = chrono::Utc::now();
        Ok(snapshot)
    }
}

/// `<name>.<idx>`, with `GPU` standing in for an empty name
pub fn ordinal_label(name: &str, idx: usize) -> String {
    let name = name.trim();
    let name = if name.is_empty() { "GPU" } else { name };
    format!("{}.{}", name, idx)
}

/// Shared startup sequence for query-backed backends.
///
/// A failed query or an empty device list is fatal only when force-enabled.
pub fn start<Q: GpuQuery>(
    backend: QueryBackend<Q>,
    enablement: Enablement,
    vars: &BackendVars,
    registry: &Registry,
) -> Result<()> {
    let key = backend.key;
    if enablement == Enablement::Disabled {
        log::debug!("{} backend disabled", key);
        return Ok(());
    }

    let count = match backend.query.query() {
        Ok(devices) => devices.len(),
        Err(e) if enablement.is_forced() => return Err(e),
        Err(e) => {
            log::warn!("{} auto-detection failed: {}", key, e);
            return Ok(());
        }
    };
    if count == 0 {
        let message = format!("no {} GPUs found", backend.vendor);
        if enablement.is_forced() {
            return Err(Error::NoDevicesFound(message));
        }
        log::debug!("{}", message);
        return Ok(());
    }

    let interval = refresh_interval(vars, &format!("{}-refresh", key))?;
    sampler::launch(backend, interval, registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::BackendStatus;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn reading(name: &str, total: u64, used: u64, util: Option<u32>) -> DeviceReading {
        DeviceReading {
            name: name.to_string(),
            total_memory: total,
            used_memory: used,
            utilization: util,
            temperature: Some(50),
            error: None,
        }
    }

    fn fixed(devices: Vec<DeviceReading>) -> impl GpuQuery {
        move || -> Result<Vec<DeviceReading>> { Ok(devices.clone()) }
    }

    #[test]
    fn test_ordinal_labels() {
        let backend = QueryBackend::new(
            "fake",
            "Fake",
            Provides::ALL,
            fixed(vec![
                reading("Apple M2", 100, 10, Some(5)),
                reading("Apple M2", 100, 10, Some(5)),
                reading("  ", 100, 10, Some(5)),
            ]),
        );
        let labels: Vec<String> = backend.readings().unwrap().into_iter().map(|(l, _)| l).collect();
        assert_eq!(labels, vec!["Apple M2.0", "Apple M2.1", "GPU.2"]);
    }

    #[test]
    fn test_device_error_keeps_reported_metrics() {
        let mut broken = reading("B", 0, 0, Some(12));
        broken.error = Some("counter read failed".to_string());
        broken.temperature = None;
        let backend = QueryBackend::new(
            "fake",
            "Fake",
            Provides::ALL,
            fixed(vec![reading("A", 200, 50, Some(30)), broken]),
        );
        let snapshot = backend.sample().unwrap();
        assert_eq!(snapshot.usage["A.0"], 30);
        assert_eq!(snapshot.memory["A.0"].used_percent, 25.0);
        assert_eq!(snapshot.usage["B.1"], 12);
        assert!(!snapshot.memory.contains_key("B.1"));
        assert_eq!(snapshot.errors.len(), 1);
        assert!(snapshot.errors["B.1"].to_string().contains("counter read failed"));
    }

    #[test]
    fn test_missing_values_are_errors_not_zero() {
        let backend = QueryBackend::new(
            "fake",
            "Fake",
            Provides {
                temperature: false,
                memory: true,
                usage: true,
            },
            fixed(vec![reading("A", 0, 0, None)]),
        );
        let snapshot = backend.sample().unwrap();
        assert!(snapshot.usage.is_empty());
        assert!(snapshot.memory.is_empty());
        assert!(snapshot.temperatures.is_empty());
        assert!(snapshot.errors.contains_key("A.0"));
    }

    #[test]
    fn test_empty_query_is_empty_snapshot() {
        let backend = QueryBackend::new("fake", "Fake", Provides::ALL, fixed(vec![]));
        let snapshot = backend.sample().unwrap();
        assert!(snapshot.is_empty());
        assert!(snapshot.errors.contains_key("fake"));
    }

    #[test]
    fn test_start_forced_vs_auto() {
        let failing = || -> Result<Vec<DeviceReading>> { Err(Error::QueryFailed("no driver".into())) };
        let registry = Registry::new();
        let vars = BackendVars::new();

        let backend = QueryBackend::new("fake", "Fake", Provides::ALL, failing);
        assert!(start(backend, Enablement::Auto, &vars, &registry).is_ok());
        let backend = QueryBackend::new("fake", "Fake", Provides::ALL, failing);
        assert!(start(backend, Enablement::Forced, &vars, &registry).is_err());

        let backend = QueryBackend::new("fake", "Fake", Provides::ALL, fixed(vec![]));
        assert!(start(backend, Enablement::Auto, &vars, &registry).is_ok());
        let backend = QueryBackend::new("fake", "Fake", Provides::ALL, fixed(vec![]));
        let err = start(backend, Enablement::Forced, &vars, &registry).unwrap_err();
        assert!(matches!(err, Error::NoDevicesFound(_)));

        let mut usage = HashMap::new();
        assert!(registry.update_usage(&mut usage, false).is_empty());
        assert!(usage.is_empty());
    }

    #[test]
    fn test_start_launches_and_resamples() {
        let calls = Arc::new(AtomicUsize::new(0));
        let query = {
            let calls = Arc::clone(&calls);
            move || -> Result<Vec<DeviceReading>> {
                let n = calls.fetch_add(1, Ordering::SeqCst) as u32;
                Ok(vec![reading("Fake GPU", 100, 40, Some(n.min(100)))])
            }
        };
        let registry = Registry::new();
        let mut vars = BackendVars::new();
        vars.insert("fake-refresh".into(), "10ms".into());
        registry.register_startup("fake", |_, _| Ok(()));
        start(
            QueryBackend::new("fake", "Fake", Provides::ALL, query),
            Enablement::Auto,
            &vars,
            &registry,
        )
        .unwrap();
        assert_eq!(registry.status("fake"), Some(BackendStatus::Running));

        let mut mems = HashMap::new();
        registry.update_memory(&mut mems);
        assert_eq!(mems["Fake GPU.0"].used_percent, 40.0);
        let mut usage = HashMap::new();
        registry.update_usage(&mut usage, false);
        assert_eq!(usage["Fake GPU.0"], 0);

        // Later ticks must reach readers through the registry
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        let mut seen = 0;
        while seen < 3 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
            let mut usage = HashMap::new();
            registry.update_usage(&mut usage, false);
            seen = usage["Fake GPU.0"];
        }
        registry.shutdown();
        assert!(seen >= 3, "usage stuck at {}", seen);
        assert!(calls.load(Ordering::SeqCst) >= 4);
    }
}
