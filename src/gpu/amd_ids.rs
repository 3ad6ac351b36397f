// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2024 NervoSys

//! libdrm `amdgpu.ids` model name table
//!
//! Format: one `device_id, revision_id, name` record per line, ids in hex,
//! `#` comments. The name column runs to end of line and may contain commas.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// Locations the ID table is shipped at, probed in order
pub const ID_TABLE_PATHS: &[&str] = &[
    "/usr/share/libdrm/amdgpu.ids",
    "/usr/local/share/libdrm/amdgpu.ids",
    "/opt/amdgpu/share/libdrm/amdgpu.ids",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdKey {
    pub device_id: u32,
    pub revision_id: u32,
}

/// Parsed (device, revision) → marketing name table
#[derive(Debug, Clone, Default)]
pub struct IdTable {
    names: HashMap<IdKey, String>,
}

impl IdTable {
    /// Parse records from a reader.
    ///
    /// Malformed records are skipped. An I/O error part-way through keeps what was
    /// parsed so far.
    pub fn from_reader<R: BufRead>(reader: R) -> Self {
        let mut table = Self::default();
        for line in reader.lines() {
            match line {
                Ok(line) => table.add_line(&line),
                Err(e) => {
                    log::warn!(
                        "amdgpu.ids read error after {} records: {}",
                        table.len(),
                        e
                    );
                    break;
                }
            }
        }
        table
    }

    pub fn parse(text: &str) -> Self {
        let mut table = Self::default();
        for line in text.lines() {
            table.add_line(line);
        }
        table
    }

    /// Load from a single file
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        Ok(Self::from_reader(BufReader::new(file)))
    }

    fn add_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return;
        }
        let mut fields = line.splitn(3, ',');
        let (Some(dev), Some(rev), Some(name)) = (fields.next(), fields.next(), fields.next())
        else {
            return;
        };
        let (Some(device_id), Some(revision_id)) = (parse_hex(dev), parse_hex(rev)) else {
            return;
        };
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        self.names.insert(
            IdKey {
                device_id,
                revision_id,
            },
            name.to_string(),
        );
    }

    pub fn lookup(&self, device_id: u32, revision_id: u32) -> Option<&str> {
        self.names
            .get(&IdKey {
                device_id,
                revision_id,
            })
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

fn parse_hex(field: &str) -> Option<u32> {
    let field = field.trim();
    let digits = field
        .strip_prefix("0x")
        .or_else(|| field.strip_prefix("0X"))
        .unwrap_or(field);
    u32::from_str_radix(digits, 16).ok()
}

/// ID table loaded on first use and memoized, including a failed load.
///
/// Concurrent first callers block on the same load.
#[derive(Debug)]
pub struct LazyIdTable {
    candidates: Vec<PathBuf>,
    cell: OnceLock<std::result::Result<Arc<IdTable>, Arc<Error>>>,
}

impl LazyIdTable {
    pub fn new<I, P>(candidates: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            candidates: candidates.into_iter().map(Into::into).collect(),
            cell: OnceLock::new(),
        }
    }

    /// The process-wide table backed by the system locations
    pub fn system() -> Arc<LazyIdTable> {
        static SYSTEM: OnceLock<Arc<LazyIdTable>> = OnceLock::new();
        Arc::clone(SYSTEM.get_or_init(|| Arc::new(LazyIdTable::new(ID_TABLE_PATHS.iter().copied()))))
    }

    /// The table, or the reason it is unavailable
    pub fn get(&self) -> std::result::Result<Arc<IdTable>, Arc<Error>> {
        self.cell.get_or_init(|| self.load()).clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.get().is_some()
    }

    fn load(&self) -> std::result::Result<Arc<IdTable>, Arc<Error>> {
        for path in &self.candidates {
            match IdTable::load(path) {
                Ok(table) => {
                    log::debug!("loaded {} AMD ids from {}", table.len(), path.display());
                    return Ok(Arc::new(table));
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    log::debug!("skipping ID table candidate: {}", e);
                    continue;
                }
            }
        }
        let checked: Vec<String> = self
            .candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        Err(Arc::new(Error::IdTableUnavailable(format!(
            "checked {}",
            checked.join(", ")
        ))))
    }
}
