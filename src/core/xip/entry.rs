//! XIP table entries
//!
//! The module list (0x20-byte TOC entries) is followed directly by the file
//! list (0x1c-byte file entries).

use crate::io::{le_u32, le_u64, put_u32, put_u64};

/// readonly | hidden | system
pub const NEW_FILE_ATTRIBUTES: u32 = 0x7;
pub const ATTR_COMPRESSED: u32 = 0x800;
/// Longest name read from the region
pub const MAX_NAME_LEN: usize = 260;

/// Module descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocEntry {
    pub attributes: u32,
    pub filetime: u64,
    pub size: u32,
    pub name_rva: u32,
    pub e32_rva: u32,
    pub o32_rva: u32,
    pub load_rva: u32,
}

impl TocEntry {
    pub const LEN: usize = 0x20;

    pub fn parse(raw: &[u8]) -> Self {
        TocEntry {
            attributes: le_u32(raw, 0x00),
            filetime: le_u64(raw, 0x04),
            size: le_u32(raw, 0x0c),
            name_rva: le_u32(raw, 0x10),
            e32_rva: le_u32(raw, 0x14),
            o32_rva: le_u32(raw, 0x18),
            load_rva: le_u32(raw, 0x1c),
        }
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        put_u32(&mut out, 0x00, self.attributes);
        put_u64(&mut out, 0x04, self.filetime);
        put_u32(&mut out, 0x0c, self.size);
        put_u32(&mut out, 0x10, self.name_rva);
        put_u32(&mut out, 0x14, self.e32_rva);
        put_u32(&mut out, 0x18, self.o32_rva);
        put_u32(&mut out, 0x1c, self.load_rva);
        out
    }
}

/// Plain file descriptor; data is one blob, optionally compressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub attributes: u32,
    pub filetime: u64,
    pub size: u32,
    pub compressed_size: u32,
    pub name_rva: u32,
    pub load_rva: u32,
}

impl FileEntry {
    pub const LEN: usize = 0x1c;

    pub fn new(filetime: u64) -> Self {
        FileEntry {
            attributes: NEW_FILE_ATTRIBUTES,
            filetime,
            size: 0,
            compressed_size: 0,
            name_rva: 0,
            load_rva: 0,
        }
    }

    pub fn parse(raw: &[u8]) -> Self {
        FileEntry {
            attributes: le_u32(raw, 0x00),
            filetime: le_u64(raw, 0x04),
            size: le_u32(raw, 0x0c),
            compressed_size: le_u32(raw, 0x10),
            name_rva: le_u32(raw, 0x14),
            load_rva: le_u32(raw, 0x18),
        }
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        put_u32(&mut out, 0x00, self.attributes);
        put_u64(&mut out, 0x04, self.filetime);
        put_u32(&mut out, 0x0c, self.size);
        put_u32(&mut out, 0x10, self.compressed_size);
        put_u32(&mut out, 0x14, self.name_rva);
        put_u32(&mut out, 0x18, self.load_rva);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XipEntry {
    Module(TocEntry),
    File(FileEntry),
}

impl XipEntry {
    pub fn is_module(&self) -> bool {
        matches!(self, XipEntry::Module(_))
    }

    pub fn attributes(&self) -> u32 {
        match self {
            XipEntry::Module(m) => m.attributes,
            XipEntry::File(f) => f.attributes,
        }
    }

    pub fn filetime(&self) -> u64 {
        match self {
            XipEntry::Module(m) => m.filetime,
            XipEntry::File(f) => f.filetime,
        }
    }

    pub fn size(&self) -> u32 {
        match self {
            XipEntry::Module(m) => m.size,
            XipEntry::File(f) => f.size,
        }
    }

    pub fn name_rva(&self) -> u32 {
        match self {
            XipEntry::Module(m) => m.name_rva,
            XipEntry::File(f) => f.name_rva,
        }
    }

    pub fn set_name_rva(&mut self, rva: u32) {
        match self {
            XipEntry::Module(m) => m.name_rva = rva,
            XipEntry::File(f) => f.name_rva = rva,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            XipEntry::Module(m) => m.encode().to_vec(),
            XipEntry::File(f) => f.encode().to_vec(),
        }
    }
}

/// Bytes reserved for a NUL-terminated name
pub fn name_storage_len(name: &str) -> u64 {
    crate::filesystem::round_up(name.len() as u64 + 1, 4)
}
