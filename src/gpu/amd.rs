// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2024 NervoSys

//! AMD GPU telemetry via the amdgpu/radeon sysfs interface
//!
//! Devices are discovered by scanning `/sys/class/drm/card*`, falling back to the
//! devices bound to `/sys/bus/pci/drivers/amdgpu` when the DRM scan finds nothing.
//! Every sampling cycle rediscovers and rereads:
//! - GPU utilization (`gpu_busy_percent`)
//! - Temperature (first `hwmon*/temp*_input`, millidegrees)
//! - VRAM (`mem_info_vram_*`, falling back to `mem_info_vis_vram_*`)
//!
//! Labels are `<model>.<bus>` with the model name resolved through libdrm's
//! `amdgpu.ids`, e.g. `MI300X.2f`.

use crate::config::{refresh_interval, BackendVars, Enablement};
use crate::error::{Error, Result};
use crate::gpu::amd_ids::{IdTable, LazyIdTable};
use crate::gpu::{Backend, MemoryInfo, Provides};
use crate::registry::Registry;
use crate::sampler;
use crate::snapshot::Snapshot;
use crate::sysfs;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Backend key, also the reserved error-map key
pub const AMD_KEY: &str = "amd";

/// PCI vendor ID for AMD/ATI
pub const AMD_VENDOR_ID: u32 = 0x1002;

const ACCEPTED_DRIVERS: &[&str] = &["amdgpu", "radeon"];

/// Control files living next to the device links in a PCI driver directory
const DRIVER_CONTROL_FILES: &[&str] = &["bind", "unbind", "new_id", "remove_id", "uevent", "module"];

/// Long marketing names and their short aliases, applied in order
const NAME_ALIASES: &[(&str, &str)] = &[
    ("AMD Instinct MI210", "MI210"),
    ("AMD MI210", "MI210"),
    ("AMD Instinct MI250X / MI250", "MI250"),
    ("AMD Instinct MI250X/MI250", "MI250"),
    ("AMD Instinct MI250", "MI250"),
    ("AMD Instinct MI300X", "MI300X"),
    ("AMD MI300X", "MI300X"),
    ("AMD Instinct MI300", "MI300"),
    ("AMD MI300", "MI300"),
    ("AMD Instinct MI325X", "MI325X"),
    ("AMD MI325X", "MI325X"),
];

/// Sysfs roots scanned during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmdPaths {
    /// DRM class directory (`/sys/class/drm`)
    pub drm_class: PathBuf,
    /// amdgpu PCI driver directory (`/sys/bus/pci/drivers/amdgpu`)
    pub pci_driver: PathBuf,
    /// PCI device directory (`/sys/bus/pci/devices`)
    pub pci_devices: PathBuf,
}

impl AmdPaths {
    pub fn system() -> Self {
        Self::under(Path::new("/"))
    }

    /// Same layout rooted somewhere other than `/`
    pub fn under(root: &Path) -> Self {
        Self {
            drm_class: root.join("sys/class/drm"),
            pci_driver: root.join("sys/bus/pci/drivers/amdgpu"),
            pci_devices: root.join("sys/bus/pci/devices"),
        }
    }
}

/// One discovered AMD GPU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmdGpu {
    /// Display label, unique within one discovery pass
    pub label: String,
    /// PCI device directory that metrics are read from
    pub device_path: PathBuf,
}

/// AMD backend state
#[derive(Debug, Clone)]
pub struct AmdBackend {
    paths: AmdPaths,
    ids: Arc<LazyIdTable>,
}

impl AmdBackend {
    /// Backend reading the live system with the shared ID table
    pub fn new() -> Self {
        Self::with_paths(AmdPaths::system(), LazyIdTable::system())
    }

    pub fn with_paths(paths: AmdPaths, ids: Arc<LazyIdTable>) -> Self {
        Self { paths, ids }
    }

    /// System backend, honoring an `amd-ids` path override
    pub fn from_vars(vars: &BackendVars) -> Self {
        match vars.get("amd-ids") {
            Some(path) => Self::with_paths(
                AmdPaths::system(),
                Arc::new(LazyIdTable::new([PathBuf::from(path)])),
            ),
            None => Self::new(),
        }
    }

    pub fn paths(&self) -> &AmdPaths {
        &self.paths
    }

    /// Enumerate AMD GPUs, sorted by card/slot name.
    ///
    /// `Err` only when the DRM class directory cannot be read at all.
    pub fn discover(&self) -> Result<Vec<AmdGpu>> {
        let ids = match self.ids.get() {
            Ok(table) => Some(table),
            Err(e) => {
                log::debug!("AMD model names unavailable, using generic labels: {}", e);
                None
            }
        };
        let ids = ids.as_deref();

        let gpus = self.discover_from_drm(ids)?;
        if !gpus.is_empty() {
            return Ok(gpus);
        }
        self.discover_from_pci_driver(ids)
    }

    /// Primary strategy: DRM class cards with an AMD vendor ID and an accepted driver
    pub fn discover_from_drm(&self, ids: Option<&IdTable>) -> Result<Vec<AmdGpu>> {
        let mut gpus = Vec::new();
        let mut seen = HashSet::new();
        for (name, path) in sysfs::sorted_entries(&self.paths.drm_class)? {
            // card0-DP-1 and friends are connectors, not devices
            if !name.starts_with("card") || name.contains('-') || !path.is_dir() {
                continue;
            }
            let device_path = path.join("device");
            if !is_amd(&device_path) {
                log::debug!("skipping {}: not an AMD device", name);
                continue;
            }
            if let Some(driver) = sysfs::driver_name(&device_path) {
                if !ACCEPTED_DRIVERS.contains(&driver.as_str()) {
                    log::debug!("skipping {}: bound to {}", name, driver);
                    continue;
                }
            }
            push_unique(&mut gpus, &mut seen, device_label(&name, &device_path, ids), device_path);
        }
        Ok(gpus)
    }

    /// Fallback strategy: devices bound to the amdgpu PCI driver.
    ///
    /// A missing driver directory means the driver is not loaded and yields no devices.
    pub fn discover_from_pci_driver(&self, ids: Option<&IdTable>) -> Result<Vec<AmdGpu>> {
        let entries = match sysfs::sorted_entries(&self.paths.pci_driver) {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut gpus = Vec::new();
        let mut seen = HashSet::new();
        for (name, _) in entries {
            if name.is_empty() || DRIVER_CONTROL_FILES.iter().any(|c| name.starts_with(c)) {
                continue;
            }
            let device_path = self.paths.pci_devices.join(&name);
            if !device_path.is_dir() || !is_amd(&device_path) {
                log::debug!("skipping PCI device {}", name);
                continue;
            }
            let card = drm_card_name(&device_path).unwrap_or_else(|| name.clone());
            push_unique(&mut gpus, &mut seen, device_label(&card, &device_path, ids), device_path);
        }
        Ok(gpus)
    }
}

impl Default for AmdBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for AmdBackend {
    fn key(&self) -> &'static str {
        AMD_KEY
    }

    fn provides(&self) -> Provides {
        Provides::ALL
    }

    fn sample(&self) -> Result<Snapshot> {
        let gpus = self.discover()?;
        let mut snapshot = Snapshot::new();
        if gpus.is_empty() {
            snapshot.record_error(AMD_KEY, Error::NoDevicesFound(self.not_found_message()));
            return Ok(snapshot);
        }

        for gpu in &gpus {
            match read_temperature(&gpu.device_path) {
                Ok(temp) => {
                    snapshot.temperatures.insert(gpu.label.clone(), temp);
                }
                Err(e) => snapshot.record_error(&gpu.label, e),
            }
            match read_busy_percent(&gpu.device_path) {
                Ok(busy) => {
                    snapshot.usage.insert(gpu.label.clone(), busy);
                }
                Err(e) => snapshot.record_error(&gpu.label, e),
            }
            match read_vram(&gpu.device_path) {
                Ok(mem) => {
                    snapshot.memory.insert(gpu.label.clone(), mem);
                }
                Err(e) => snapshot.record_error(&gpu.label, e),
            }
        }
        snapshot.taken_at = chrono::Utc::now();
        Ok(snapshot)
    }
}

impl AmdBackend {
    fn not_found_message(&self) -> String {
        format!(
            "no AMD GPUs found (checked {} and {})",
            self.paths.drm_class.display(),
            self.paths.pci_driver.display()
        )
    }
}

fn is_amd(device_path: &Path) -> bool {
    matches!(
        sysfs::read_prefixed_u32(&device_path.join("vendor")),
        Ok(AMD_VENDOR_ID)
    )
}

fn push_unique(gpus: &mut Vec<AmdGpu>, seen: &mut HashSet<String>, label: String, device_path: PathBuf) {
    if seen.insert(label.clone()) {
        gpus.push(AmdGpu { label, device_path });
    } else {
        log::debug!("duplicate AMD device label {}, skipping {}", label, device_path.display());
    }
}

/// `cardN` under a PCI device's `drm` directory, if any
fn drm_card_name(device_path: &Path) -> Option<String> {
    sysfs::sorted_entries(&device_path.join("drm"))
        .ok()?
        .into_iter()
        .map(|(name, _)| name)
        .find(|name| name.starts_with("card") && !name.contains('-'))
}

/// Build the display label for a device
pub fn device_label(card: &str, device_path: &Path, ids: Option<&IdTable>) -> String {
    let model = ids.and_then(|table| {
        let device_id = sysfs::read_prefixed_u32(&device_path.join("device")).ok()?;
        let revision_id = sysfs::read_prefixed_u32(&device_path.join("revision")).ok()?;
        table.lookup(device_id, revision_id).map(str::to_string)
    });
    let slot = sysfs::pci_slot_name(device_path).unwrap_or_default();
    format_label(model.as_deref(), &slot, card)
}

/// `<model>.<slot>`, `<model>.<card>` without a slot, `AMD.<card>` without a model
pub fn format_label(model: Option<&str>, slot: &str, card: &str) -> String {
    let model = model.map(simplify_name).filter(|m| !m.is_empty());
    let slot = simplify_slot(slot);
    match (model, slot.is_empty()) {
        (Some(model), false) => format!("{}.{}", model, slot),
        (Some(model), true) => format!("{}.{}", model, card),
        (None, _) => format!("AMD.{}", card),
    }
}

/// Shorten known long model names
pub fn simplify_name(name: &str) -> String {
    NAME_ALIASES
        .iter()
        .fold(name.trim().to_string(), |acc, (long, short)| acc.replace(long, short))
}

/// `0000:2f:00.0` → `2f`
pub fn simplify_slot(slot: &str) -> String {
    let slot = slot.trim();
    let slot = slot.strip_prefix("0000:").unwrap_or(slot);
    slot.strip_suffix(":00.0").unwrap_or(slot).to_string()
}

/// Temperature in whole degrees Celsius from the first hwmon sensor
pub fn read_temperature(device_path: &Path) -> Result<i32> {
    let hwmon = sysfs::first_hwmon_path(device_path)?;
    let input = sysfs::first_matching_file(&hwmon, "temp", "_input")?;
    let millidegrees = sysfs::read_int(&input)?;
    millidegrees
        .checked_add(500)
        .and_then(|v| i32::try_from(v.div_euclid(1000)).ok())
        .ok_or_else(|| {
            Error::InvalidValue(format!(
                "{} reported {} out of range",
                input.display(),
                millidegrees
            ))
        })
}

/// Utilization percentage from `gpu_busy_percent`
pub fn read_busy_percent(device_path: &Path) -> Result<i32> {
    let path = device_path.join("gpu_busy_percent");
    let busy = sysfs::read_int(&path)?;
    if !(0..=100).contains(&busy) {
        return Err(Error::InvalidValue(format!(
            "{} reported {}%",
            path.display(),
            busy
        )));
    }
    Ok(busy as i32)
}

/// VRAM counters, falling back to the CPU-visible pair
pub fn read_vram(device_path: &Path) -> Result<MemoryInfo> {
    let (total, used) = match read_counter_pair(device_path, "mem_info_vram") {
        Err(e) if e.is_not_found() => read_counter_pair(device_path, "mem_info_vis_vram")?,
        other => other?,
    };
    if total == 0 {
        return Err(Error::InvalidValue(format!(
            "total VRAM is zero in {}",
            device_path.display()
        )));
    }
    MemoryInfo::from_counters(total, used)
}

fn read_counter_pair(device_path: &Path, prefix: &str) -> Result<(u64, u64)> {
    let total = sysfs::read_uint(&device_path.join(format!("{}_total", prefix)))?;
    let used = sysfs::read_uint(&device_path.join(format!("{}_used", prefix)))?;
    Ok((total, used))
}

/// Decide whether to run and launch the sampler.
///
/// Discovery failures and an empty device list are fatal only when the backend was
/// explicitly enabled.
pub fn start(backend: AmdBackend, vars: &BackendVars, registry: &Registry) -> Result<()> {
    let enablement = Enablement::from_vars(vars, &["amd", "amdgpu"]);
    if enablement == Enablement::Disabled {
        log::debug!("AMD backend disabled by configuration");
        return Ok(());
    }

    let gpus = match backend.discover() {
        Ok(gpus) => gpus,
        Err(e) if enablement.is_forced() => return Err(e),
        Err(e) => {
            log::warn!("AMD auto-detection failed: {}", e);
            return Ok(());
        }
    };
    if gpus.is_empty() {
        if enablement.is_forced() {
            return Err(Error::NoDevicesFound(backend.not_found_message()));
        }
        log::debug!("{}", backend.not_found_message());
        return Ok(());
    }

    let interval = refresh_interval(vars, "amd-refresh")?;
    sampler::launch(backend, interval, registry)
}

/// Startup function registered for the live system
pub fn startup(vars: &BackendVars, registry: &Registry) -> Result<()> {
    start(AmdBackend::from_vars(vars), vars, registry)
}
