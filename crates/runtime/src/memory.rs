//! Memory statistics reported in rounded gigabytes.
//!
//! The accelerator runtime exposes three counters: bytes currently in use, the
//! high-water mark, and the allocation limit. [`MemoryStatsSource`] abstracts
//! over where they come from so the formatting can be shared between the
//! `/proc` backed [`ProcessMemory`] and device-specific providers.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use crate::RuntimeError;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Raw counters in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemorySnapshot {
    pub in_use: u64,
    pub max_in_use: u64,
    pub limit: u64,
}

/// Anything able to report [`MemorySnapshot`]s.
pub trait MemoryStatsSource {
    fn snapshot(&self) -> Result<MemorySnapshot, RuntimeError>;
}

/// Host process memory read from procfs.
///
/// `in_use` is the resident set size, `max_in_use` its peak, and `limit` the
/// total physical memory of the machine.
#[derive(Debug, Clone)]
pub struct ProcessMemory {
    status_path: PathBuf,
    meminfo_path: PathBuf,
}

impl Default for ProcessMemory {
    fn default() -> Self {
        Self::with_paths("/proc/self/status", "/proc/meminfo")
    }
}

impl ProcessMemory {
    /// Reads from custom locations (used by tests).
    pub fn with_paths(status: impl Into<PathBuf>, meminfo: impl Into<PathBuf>) -> Self {
        Self {
            status_path: status.into(),
            meminfo_path: meminfo.into(),
        }
    }
}

impl MemoryStatsSource for ProcessMemory {
    fn snapshot(&self) -> Result<MemorySnapshot, RuntimeError> {
        let status = read(&self.status_path)?;
        let meminfo = read(&self.meminfo_path)?;
        Ok(MemorySnapshot {
            in_use: kib_field(&status, "VmRSS")?,
            max_in_use: kib_field(&status, "VmHWM")?,
            limit: kib_field(&meminfo, "MemTotal")?,
        })
    }
}

fn read(path: &Path) -> Result<String, RuntimeError> {
    fs::read_to_string(path).map_err(|source| RuntimeError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Extracts `Name:   1234 kB` from a procfs listing and converts it to bytes.
fn kib_field(text: &str, name: &str) -> Result<u64, RuntimeError> {
    let line = text
        .lines()
        .find(|line| {
            line.split_once(':')
                .map(|(key, _)| key.trim() == name)
                .unwrap_or(false)
        })
        .ok_or_else(|| RuntimeError::parse("procfs", format!("missing field {name}")))?;
    let value = line
        .split_once(':')
        .map(|(_, rest)| rest)
        .unwrap_or_default()
        .split_whitespace()
        .next()
        .ok_or_else(|| RuntimeError::parse("procfs", format!("empty field {name}")))?;
    let kib: u64 = value
        .parse()
        .map_err(|err| RuntimeError::parse("procfs", format!("{name}={value}: {err}")))?;
    Ok(kib * 1024)
}

/// Converts a byte count to gigabytes rounded to two decimals.
pub fn to_gb_rounded(bytes: f64) -> f64 {
    (bytes / BYTES_PER_GB * 100.0).round() / 100.0
}

/// Current, peak and total memory in GB keyed the way the training logs expect.
pub fn memory_stats(source: &dyn MemoryStatsSource) -> Result<BTreeMap<String, f64>, RuntimeError> {
    let snapshot = source.snapshot()?;
    let mut stats = BTreeMap::new();
    stats.insert(
        "memory_allocated (GB)".to_string(),
        to_gb_rounded(snapshot.in_use as f64),
    );
    stats.insert(
        "max_memory_allocated (GB)".to_string(),
        to_gb_rounded(snapshot.max_in_use as f64),
    );
    stats.insert(
        "total_memory_available (GB)".to_string(),
        to_gb_rounded(snapshot.limit as f64),
    );
    Ok(stats)
}
