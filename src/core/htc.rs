//! "HTCIMAGE" update containers
//!
//! A 0x200-byte header lists up to 32 sections by type, offset and size.
//! The tag is spelled one character per little-endian word.

use crate::error::{FlashError, Result};
use crate::io::{le_u32, SharedStream};
use crate::transform::RangeView;
use serde::Serialize;

pub const HTC_HEADER_LEN: usize = 0x200;
pub const HTC_SECTION_SLOTS: usize = 32;
/// Section type holding the operating system image
pub const HTC_OS_SECTION: u32 = 0x400;

const HTC_TAG: &[u8; 8] = b"HTCIMAGE";
const DEVICE_OFFSET: usize = 0x20;
const TYPES_OFFSET: usize = 0x40;
const OFFSETS_OFFSET: usize = 0xc0;
const SIZES_OFFSET: usize = 0x140;
const CID_OFFSET: usize = 0x1c0;
const VERSION_OFFSET: usize = 0x1e0;
const LANGUAGE_OFFSET: usize = 0x1f0;

fn has_tag(raw: &[u8]) -> bool {
    raw.len() >= 0x20
        && HTC_TAG
            .iter()
            .enumerate()
            .all(|(i, &c)| (le_u32(raw, 4 * i) & 0xff) as u8 == c)
}

/// Check for the tag at the start of `store`.
pub fn is_htc_image(store: &SharedStream) -> bool {
    match store.read_upto(0, 0x20) {
        Ok(raw) => has_tag(&raw),
        Err(_) => false,
    }
}

/// Known section type names
pub fn section_type_name(kind: u32) -> Option<&'static str> {
    let name = match kind {
        0x100 => "IPL",
        0x101 => "G3IPL",
        0x102 => "G4IPL",
        0x103 => "H3IPL",
        0x200 => "SPL",
        0x201 => "G3SPL",
        0x202 => "G4SPL",
        0x300 => "GSM",
        0x301 => "GSMV2",
        0x380 => "QCCONF",
        0x400 => "OS",
        0x500 => "diag",
        0x600 => "MainSplash",
        0x610 => "splash1",
        0x611 => "splash2",
        0x700 => "Extrom",
        0x800 => "cpldcode",
        0x900 => "Extrom2",
        0x920 => "HTCCONF",
        _ => return None,
    };
    Some(name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HtcSection {
    /// Slot in the header table
    pub slot: usize,
    pub kind: u32,
    pub offset: u32,
    pub size: u32,
}

impl HtcSection {
    /// Type name, or the hex type for unknown sections
    pub fn label(&self) -> String {
        match section_type_name(self.kind) {
            Some(name) => name.to_string(),
            None => format!("{:04x}", self.kind),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HtcImage {
    pub device: String,
    pub cid: String,
    pub version: String,
    pub language: String,
    sections: Vec<HtcSection>,
}

fn fixed_str(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

impl HtcImage {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < HTC_HEADER_LEN {
            return Err(FlashError::format("truncated HTCIMAGE header"));
        }
        if !has_tag(raw) {
            return Err(FlashError::format("missing HTCIMAGE signature"));
        }
        let sections = (0..HTC_SECTION_SLOTS)
            .map(|slot| HtcSection {
                slot,
                kind: le_u32(raw, TYPES_OFFSET + 4 * slot),
                offset: le_u32(raw, OFFSETS_OFFSET + 4 * slot),
                size: le_u32(raw, SIZES_OFFSET + 4 * slot),
            })
            .filter(|s| s.kind != 0 || s.offset != 0 || s.size != 0)
            .collect();

        Ok(HtcImage {
            device: fixed_str(&raw[DEVICE_OFFSET..TYPES_OFFSET]),
            cid: fixed_str(&raw[CID_OFFSET..VERSION_OFFSET]),
            version: fixed_str(&raw[VERSION_OFFSET..LANGUAGE_OFFSET]),
            language: fixed_str(&raw[LANGUAGE_OFFSET..HTC_HEADER_LEN]),
            sections,
        })
    }

    pub fn read(store: &SharedStream) -> Result<Self> {
        let raw = store.read_upto(0, HTC_HEADER_LEN)?;
        let image = Self::parse(&raw)?;
        tracing::debug!(
            "HTCIMAGE device={:?} cid={:?} version={:?}, {} sections",
            image.device,
            image.cid,
            image.version,
            image.sections.len()
        );
        Ok(image)
    }

    /// Non-empty sections in slot order
    pub fn sections(&self) -> &[HtcSection] {
        &self.sections
    }

    pub fn find(&self, kind: u32) -> Option<&HtcSection> {
        self.sections.iter().find(|s| s.kind == kind)
    }

    /// Bounds-checked view of one section.
    pub fn open_section(&self, store: &SharedStream, section: &HtcSection) -> Result<SharedStream> {
        let view = RangeView::new(store.clone(), section.offset as u64, section.size as u64)?;
        Ok(SharedStream::new(view))
    }

    pub fn open_os(&self, store: &SharedStream) -> Result<SharedStream> {
        let section = self
            .find(HTC_OS_SECTION)
            .ok_or_else(|| FlashError::NotFound("HTCIMAGE OS section".into()))?;
        self.open_section(store, section)
    }
}
