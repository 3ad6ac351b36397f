// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2024 NervoSys

//! NVIDIA GPU telemetry via NVML
//!
//! Requires libnvidia-ml.so (Linux) or nvml.dll (Windows) at runtime. Devices are
//! labeled `<name>.<index>` in NVML enumeration order.

use crate::config::{BackendVars, Enablement};
use crate::error::{Error, Result};
use crate::gpu::query::{self, DeviceReading, GpuQuery, QueryBackend};
use crate::gpu::Provides;
use crate::registry::Registry;
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::Nvml;

/// Backend key, also the reserved error-map key
pub const NVIDIA_KEY: &str = "nvidia";

/// One NVML session, reused for every sampling cycle
pub struct NvmlQuery {
    nvml: Nvml,
}

impl NvmlQuery {
    pub fn init() -> Result<Self> {
        Ok(Self { nvml: Nvml::init()? })
    }

    fn read_device(&self, index: u32) -> DeviceReading {
        let device = match self.nvml.device_by_index(index) {
            Ok(device) => device,
            Err(e) => return Error::from(e).into(),
        };

        let mut reading = DeviceReading {
            name: device.name().unwrap_or_else(|_| "NVIDIA".to_string()),
            ..DeviceReading::default()
        };
        match device.memory_info() {
            Ok(mem) => {
                reading.total_memory = mem.total;
                reading.used_memory = mem.used;
            }
            Err(e) => reading.error = Some(format!("memory: {}", e)),
        }
        reading.utilization = device.utilization_rates().ok().map(|u| u.gpu);
        reading.temperature = device
            .temperature(TemperatureSensor::Gpu)
            .ok()
            .and_then(|t| i32::try_from(t).ok());
        reading
    }
}

impl GpuQuery for NvmlQuery {
    fn query(&self) -> Result<Vec<DeviceReading>> {
        let count = self.nvml.device_count()?;
        Ok((0..count).map(|index| self.read_device(index)).collect())
    }
}

/// NVIDIA backend over any device query
pub fn backend<Q: GpuQuery>(query: Q) -> QueryBackend<Q> {
    QueryBackend::new(NVIDIA_KEY, "NVIDIA", Provides::ALL, query)
}

/// Startup function: auto-detected unless `nvidia = "false"`
pub fn startup(vars: &BackendVars, registry: &Registry) -> Result<()> {
    let enablement = Enablement::from_vars(vars, &[NVIDIA_KEY]);
    if enablement == Enablement::Disabled {
        return Ok(());
    }
    let nvml = match NvmlQuery::init() {
        Ok(nvml) => nvml,
        Err(e) if enablement.is_forced() => return Err(e),
        Err(e) => {
            log::debug!("NVML unavailable: {}", e);
            return Ok(());
        }
    };
    query::start(backend(nvml), enablement, vars, registry)
}
