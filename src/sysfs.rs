//! Leaf readers for sysfs-style attribute files
//!
//! Every read is independent and may fail on its own; errors carry the path.

use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Read a file and trim surrounding whitespace
pub fn read_trimmed(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| Error::io(path, e))
}

/// Read a signed decimal integer (e.g. `gpu_busy_percent`, `temp1_input`)
pub fn read_int(path: &Path) -> Result<i64> {
    let text = read_trimmed(path)?;
    text.parse::<i64>()
        .map_err(|e| Error::parse(path, format!("'{}': {}", text, e)))
}

/// Read an unsigned decimal integer (e.g. `mem_info_vram_total`)
pub fn read_uint(path: &Path) -> Result<u64> {
    let text = read_trimmed(path)?;
    text.parse::<u64>()
        .map_err(|e| Error::parse(path, format!("'{}': {}", text, e)))
}

/// Read an integer with a radix prefix (`0x1002`, `0o17`, `0b1`, or plain decimal)
pub fn read_prefixed_u32(path: &Path) -> Result<u32> {
    let text = read_trimmed(path)?;
    parse_prefixed_u32(&text).ok_or_else(|| Error::parse(path, format!("'{}' is not an integer", text)))
}

pub(crate) fn parse_prefixed_u32(text: &str) -> Option<u32> {
    let lower = text.to_ascii_lowercase();
    if let Some(hex) = lower.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()
    } else if let Some(oct) = lower.strip_prefix("0o") {
        u32::from_str_radix(oct, 8).ok()
    } else if let Some(bin) = lower.strip_prefix("0b") {
        u32::from_str_radix(bin, 2).ok()
    } else {
        lower.parse().ok()
    }
}

/// Name of the driver bound to a device, or `None` if unbound/unreadable
pub fn driver_name(device_path: &Path) -> Option<String> {
    let link = fs::read_link(device_path.join("driver")).ok()?;
    link.file_name()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
}

/// `PCI_SLOT_NAME` from the device's uevent file, if present
pub fn pci_slot_name(device_path: &Path) -> Option<String> {
    let uevent = fs::read_to_string(device_path.join("uevent")).ok()?;
    uevent
        .lines()
        .find_map(|line| line.strip_prefix("PCI_SLOT_NAME="))
        .map(|slot| slot.trim().to_string())
}

/// Sorted entries of a directory as (name, path) pairs
pub fn sorted_entries(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut entries: Vec<(String, PathBuf)> = fs::read_dir(dir)
        .map_err(|e| Error::io(dir, e))?
        .flatten()
        .map(|e| (e.file_name().to_string_lossy().to_string(), e.path()))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

/// First directory under `<device>/hwmon`
pub fn first_hwmon_path(device_path: &Path) -> Result<PathBuf> {
    let hwmon_root = device_path.join("hwmon");
    sorted_entries(&hwmon_root)?
        .into_iter()
        .map(|(_, path)| path)
        .find(|path| path.is_dir())
        .ok_or_else(|| {
            Error::SensorUnavailable(format!("no hwmon directory under {}", hwmon_root.display()))
        })
}

/// First regular file in `dir` named `<prefix>*<suffix>`
pub fn first_matching_file(dir: &Path, prefix: &str, suffix: &str) -> Result<PathBuf> {
    sorted_entries(dir)?
        .into_iter()
        .find(|(name, path)| name.starts_with(prefix) && name.ends_with(suffix) && path.is_file())
        .map(|(_, path)| path)
        .ok_or_else(|| {
            Error::SensorUnavailable(format!(
                "no {}*{} file in {}",
                prefix,
                suffix,
                dir.display()
            ))
        })
}
