//! Engine configuration
//!
//! Loaded from TOML. Every field has a default, so an empty document is a
//! valid configuration.
//!
//! ```toml
//! overlap_policy = "strict"
//! read_only = true
//! xip_rva_base = 0x8c000000
//! partition_sector_size = 0x800
//! ```

use crate::allocator::OverlapPolicy;
use crate::error::Result;
use crate::partition::DEFAULT_SECTOR_SIZE;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_BLOCK_CACHE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Allocation overlaps: warn and continue, or fail
    pub overlap_policy: OverlapPolicy,
    /// Open the input without write access
    pub read_only: bool,
    /// Forced RVA base for XIP regions whose ECEC record lacks a header offset
    pub xip_rva_base: Option<u32>,
    /// Older e32 layout. Unset means "legacy when an RVA base is forced".
    pub legacy_xip_layout: Option<bool>,
    /// Sub-range of the input holding the image
    pub image_offset: Option<u64>,
    pub image_length: Option<u64>,
    pub partition_sector_size: u64,
    /// Decompressed blocks kept per compressed region
    pub decompressed_block_cache: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            overlap_policy: OverlapPolicy::Warn,
            read_only: false,
            xip_rva_base: None,
            legacy_xip_layout: None,
            image_offset: None,
            image_length: None,
            partition_sector_size: DEFAULT_SECTOR_SIZE,
            decompressed_block_cache: DEFAULT_BLOCK_CACHE,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        tracing::debug!("loading engine config from {}", path.as_ref().display());
        Self::from_toml_str(&text)
    }

    /// Effective XIP layout flag
    pub fn legacy_xip(&self) -> bool {
        self.legacy_xip_layout
            .unwrap_or(self.xip_rva_base.is_some())
    }
}
