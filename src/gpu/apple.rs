// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2024 NervoSys

//! Apple Silicon GPU telemetry
//!
//! Apple GPUs share memory with the host, so "used" is the accelerator's in-use system
//! memory counter and "total" is the host's physical memory. No temperature is
//! exposed. The backend only runs when explicitly enabled with `apple = "true"`.

use crate::config::{BackendVars, Enablement};
use crate::error::Result;
use crate::gpu::query::{self, GpuQuery, QueryBackend};
use crate::gpu::Provides;
use crate::registry::Registry;

/// Backend key, also the reserved error-map key
pub const APPLE_KEY: &str = "apple";

const PROVIDES: Provides = Provides {
    temperature: false,
    memory: true,
    usage: true,
};

/// Apple backend over any device query
pub fn backend<Q: GpuQuery>(query: Q) -> QueryBackend<Q> {
    QueryBackend::new(APPLE_KEY, "Apple", PROVIDES, query)
}

/// Launch if `apple = "true"`; anything else leaves the backend off
pub fn start<Q: GpuQuery>(query: Q, vars: &BackendVars, registry: &Registry) -> Result<()> {
    match Enablement::from_vars(vars, &[APPLE_KEY]) {
        Enablement::Forced => query::start(backend(query), Enablement::Forced, vars, registry),
        Enablement::Auto | Enablement::Disabled => {
            log::debug!("Apple backend not enabled (set apple = \"true\")");
            Ok(())
        }
    }
}

/// Startup function registered on macOS builds
#[cfg(all(target_os = "macos", feature = "apple"))]
pub fn startup(vars: &BackendVars, registry: &Registry) -> Result<()> {
    start(ioreg::IoregQuery, vars, registry)
}

/// Host physical memory in bytes
#[cfg(unix)]
pub fn host_total_memory() -> Option<u64> {
    // SAFETY: sysconf has no preconditions
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if pages <= 0 || page_size <= 0 {
        return None;
    }
    (pages as u64).checked_mul(page_size as u64)
}

#[cfg(all(target_os = "macos", feature = "apple"))]
pub mod ioreg {
    //! IOAccelerator statistics from `ioreg`

    use super::host_total_memory;
    use crate::error::{Error, Result};
    use crate::gpu::query::{DeviceReading, GpuQuery};
    use plist::Value;
    use std::process::Command;

    /// Reads every IOAccelerator's `PerformanceStatistics`
    #[derive(Debug, Clone, Copy, Default)]
    pub struct IoregQuery;

    impl GpuQuery for IoregQuery {
        fn query(&self) -> Result<Vec<DeviceReading>> {
            let output = Command::new("ioreg")
                .args(["-r", "-d", "1", "-a", "-c", "IOAccelerator"])
                .output()
                .map_err(|e| Error::QueryFailed(format!("ioreg: {}", e)))?;
            if !output.status.success() {
                return Err(Error::QueryFailed(format!("ioreg exited with {}", output.status)));
            }
            // No accelerators prints nothing at all
            if output.stdout.iter().all(u8::is_ascii_whitespace) {
                return Ok(Vec::new());
            }
            let value = Value::from_reader(std::io::Cursor::new(output.stdout))
                .map_err(|e| Error::QueryFailed(format!("ioreg plist: {}", e)))?;
            let total = host_total_memory()
                .ok_or_else(|| Error::QueryFailed("host memory size unavailable".to_string()))?;
            Ok(parse_accelerators(&value, total))
        }
    }

    /// One reading per accelerator dictionary in `ioreg -a` output
    pub fn parse_accelerators(value: &Value, host_total: u64) -> Vec<DeviceReading> {
        let Some(entries) = value.as_array() else {
            return Vec::new();
        };
        entries
            .iter()
            .filter_map(Value::as_dictionary)
            .map(|dict| {
                let name = dict
                    .get("model")
                    .and_then(Value::as_string)
                    .unwrap_or("Apple GPU")
                    .to_string();
                let mut reading = DeviceReading {
                    name,
                    total_memory: host_total,
                    ..DeviceReading::default()
                };
                match dict.get("PerformanceStatistics").and_then(Value::as_dictionary) {
                    Some(stats) => {
                        reading.utilization = stats
                            .get("Device Utilization %")
                            .and_then(Value::as_signed_integer)
                            // Negative means the driver has no figure yet
                            .and_then(|u| u32::try_from(u).ok())
                            .map(|u| u.min(100));
                        match stats
                            .get("In use system memory")
                            .and_then(Value::as_unsigned_integer)
                        {
                            Some(used) => reading.used_memory = used,
                            None => reading.error = Some("in-use memory not reported".to_string()),
                        }
                    }
                    None => {
                        reading.error = Some("PerformanceStatistics missing".to_string());
                    }
                }
                reading
            })
            .collect()
    }

}
