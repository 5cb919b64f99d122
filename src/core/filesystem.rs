//! Operations shared by the IMGFS and XIP filesystems

use crate::error::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::fmt;
use std::io::Read;

/// Seconds between 1601-01-01 and 1970-01-01
const FILETIME_UNIX_DIFF: i64 = 11_644_473_600;
const FILETIME_TICKS: i64 = 10_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FsKind {
    Imgfs,
    Xip,
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsKind::Imgfs => write!(f, "imgfs"),
            FsKind::Xip => write!(f, "xip"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Module,
}

/// Listing record for one entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    pub name: String,
    pub kind: EntryKind,
    /// Declared size from the entry record
    pub size: u64,
    /// Bytes occupied on the image
    pub stored_size: u64,
    pub attributes: u32,
    pub modified: Option<DateTime<Utc>>,
    /// Offset (IMGFS) or RVA (XIP) of the entry record
    pub address: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FsStats {
    pub files: usize,
    pub modules: usize,
    pub used_bytes: u64,
    pub directory_blocks: usize,
    pub entry_slots: usize,
    pub used_slots: usize,
}

/// A named-entry filesystem mounted on a stream.
///
/// Names are matched case-insensitively. Mutations either complete or leave
/// the in-memory allocation state as it was before the call.
pub trait Filesystem: Send {
    fn kind(&self) -> FsKind;

    /// Entries in case-insensitive name order
    fn entries(&self) -> Vec<EntryInfo>;

    fn stat(&self, name: &str) -> Result<EntryInfo>;

    fn contains(&self, name: &str) -> bool;

    fn extract(&self, name: &str) -> Result<Vec<u8>>;

    /// Store `data` under `name`, replacing an existing entry.
    fn add(&mut self, name: &str, data: &mut dyn Read) -> Result<()>;

    fn rename(&mut self, from: &str, to: &str) -> Result<()>;

    fn delete(&mut self, name: &str) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    fn stats(&self) -> FsStats;
}

/// Case-insensitive name key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NameKey(String);

impl NameKey {
    pub fn new(name: &str) -> Self {
        NameKey(name.to_lowercase())
    }
}

impl From<&str> for NameKey {
    fn from(name: &str) -> Self {
        NameKey::new(name)
    }
}

pub fn filetime_to_datetime(filetime: u64) -> Option<DateTime<Utc>> {
    if filetime == 0 {
        return None;
    }
    let ticks = i64::try_from(filetime).ok()?;
    let secs = ticks / FILETIME_TICKS - FILETIME_UNIX_DIFF;
    let nanos = (ticks % FILETIME_TICKS) * 100;
    Utc.timestamp_opt(secs, nanos as u32).single()
}

pub fn datetime_to_filetime(time: DateTime<Utc>) -> u64 {
    let secs = time.timestamp() + FILETIME_UNIX_DIFF;
    let ticks = secs * FILETIME_TICKS + time.timestamp_subsec_nanos() as i64 / 100;
    u64::try_from(ticks).unwrap_or(0)
}

/// Current time as a FILETIME
pub fn filetime_now() -> u64 {
    datetime_to_filetime(Utc::now())
}

pub(crate) fn encode_utf16le(name: &str) -> Vec<u8> {
    name.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Decode UTF-16LE, stopping at the first NUL.
pub(crate) fn decode_utf16le(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

pub(crate) fn round_up(value: u64, unit: u64) -> u64 {
    value.div_ceil(unit) * unit
}
