// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2024 NervoSys

//! GPU telemetry backends
//!
//! A backend is one vendor's telemetry source. Each backend knows how to discover its
//! devices and read their metrics; the shared machinery in [`crate::sampler`] and
//! [`crate::registry`] turns that into a periodically refreshed [`Snapshot`] and the
//! provider callbacks the rendering layer pulls from.
//!
//! # Examples
//!
//! ```no_run
//! use gputel::{registry, BackendVars};
//! use std::collections::HashMap;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = registry::global();
//! registry.run_startup(&BackendVars::new())?;
//!
//! let mut temps = HashMap::new();
//! let errors = registry.update_temperatures(&mut temps);
//! for (label, temp) in &temps {
//!     println!("{}: {}°C", label, temp);
//! }
//! for (label, err) in &errors {
//!     eprintln!("{}: {}", label, err);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Platform Support
//!
//! | Backend | Linux | Windows | macOS | Requirements |
//! |---------|-------|---------|-------|--------------|
//! | AMD     | ✅    | ❌      | ❌    | amdgpu/radeon driver, /sys/class/drm |
//! | NVIDIA  | ✅    | ✅      | ❌    | `nvidia` feature, libnvidia-ml.so / nvml.dll |
//! | Apple   | ❌    | ❌      | ✅    | `apple` feature, explicit `apple = "true"` |

use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::snapshot::Snapshot;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod amd;
pub mod amd_ids;
pub mod apple;
pub mod query;

#[cfg(feature = "nvidia")]
pub mod nvidia;

/// Memory counters for one device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryInfo {
    /// Total memory in bytes
    pub total: u64,
    /// Used memory in bytes
    pub used: u64,
    /// Used memory as a percentage of total (0-100)
    pub used_percent: f64,
}

impl MemoryInfo {
    /// Build from a total/used counter pair.
    ///
    /// A zero total is an error rather than 0%.
    pub fn from_counters(total: u64, used: u64) -> Result<Self> {
        if total == 0 {
            return Err(Error::InvalidValue("total memory is zero".to_string()));
        }
        Ok(Self {
            total,
            used,
            used_percent: (used as f64 / total as f64) * 100.0,
        })
    }
}

/// Which provider kinds a backend feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Provides {
    pub temperature: bool,
    pub memory: bool,
    pub usage: bool,
}

impl Provides {
    pub const ALL: Provides = Provides {
        temperature: true,
        memory: true,
        usage: true,
    };
}

/// Lifecycle of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendStatus {
    /// Never started (disabled, or auto-detection found nothing)
    Disabled,
    /// Startup function is running
    Initializing,
    /// Periodic sampler active
    Running,
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendStatus::Disabled => write!(f, "disabled"),
            BackendStatus::Initializing => write!(f, "initializing"),
            BackendStatus::Running => write!(f, "running"),
        }
    }
}

/// A telemetry source that can rediscover and re-read all of its devices
pub trait Backend: Send + Sync + 'static {
    /// Unique key; also the reserved error-map key for backend-wide errors
    fn key(&self) -> &'static str;

    /// Provider kinds this backend feeds
    fn provides(&self) -> Provides;

    /// Full discovery + metric read.
    ///
    /// `Err` means discovery itself failed; per-device failures belong in the
    /// returned snapshot's error map.
    fn sample(&self) -> Result<Snapshot>;
}

/// Register the startup function of every backend compiled into this build
#[allow(unused_variables)]
pub fn register_builtin(registry: &Registry) {
    #[cfg(target_os = "linux")]
    registry.register_startup(amd::AMD_KEY, amd::startup);

    #[cfg(all(target_os = "macos", feature = "apple"))]
    registry.register_startup(apple::APPLE_KEY, apple::startup);

    #[cfg(feature = "nvidia")]
    registry.register_startup(nvidia::NVIDIA_KEY, nvidia::startup);

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_percent() {
        let mem = MemoryInfo::from_counters(8 << 30, 2 << 30).unwrap();
        assert_eq!(mem.used_percent, 25.0);
        let idle = MemoryInfo::from_counters(1024, 0).unwrap();
        assert_eq!(idle.used_percent, 0.0);
    }

    #[test]
    fn test_memory_zero_total_is_error() {
        assert!(matches!(
            MemoryInfo::from_counters(0, 0),
            Err(Error::InvalidValue(_))
        ));
        assert!(MemoryInfo::from_counters(0, 512).is_err());
    }

    #[test]
    fn test_builtin_registration() {
        let registry = Registry::new();
        register_builtin(&registry);
        #[cfg(target_os = "linux")]
        assert_eq!(registry.status(amd::AMD_KEY), Some(BackendStatus::Disabled));
    }
}
