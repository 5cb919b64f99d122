//! In-ROM executable headers and the executable reconstruction seam
//!
//! Modules stored in either filesystem keep a ROM variant of the PE header:
//! one e32 record followed by `object_count` o32 records. Turning those plus
//! the section data back into a loadable executable is delegated to an
//! [`ExeBuilder`].

use crate::error::{FlashError, Result};
use crate::io::{le_u16, le_u32, put_u16, put_u32, SharedStream};
use serde::Serialize;

pub const E32_SIZE: usize = 0x70;
/// e32 without the timestamp field
pub const E32_LEGACY_SIZE: usize = 0x6c;
pub const O32_SIZE: usize = 0x18;
pub const IMAGE_SCN_COMPRESSED: u32 = 0x2000;
pub const IMAGE_FILE_MACHINE_ARM: u16 = 0x01c0;
const DATA_DIRECTORIES: usize = 9;

/// Header values an executable builder needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleHeader {
    pub cpu_type: u16,
    pub entry_rva: u32,
    pub base_rva: u32,
    pub stack_max: u32,
    pub subsystem_version: (u16, u16),
    pub timestamp: u32,
    pub image_flags: u16,
    pub subsystem: u16,
    pub image_size: u32,
}

/// One section handed to an [`ExeBuilder`].
#[derive(Debug, Clone)]
pub struct SectionSource {
    pub name: String,
    pub size: u64,
    pub reader: SharedStream,
}

/// Rebuilds an executable from a module header and its sections.
pub trait ExeBuilder: Send + Sync {
    fn reconstruct(&self, header: &ModuleHeader, sections: &[SectionSource]) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DataDirectory {
    pub rva: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct E32Rom {
    pub object_count: u16,
    pub image_flags: u16,
    pub entry_rva: u32,
    pub vbase: u32,
    pub subsys_major: u16,
    pub subsys_minor: u16,
    pub stack_max: u32,
    pub vsize: u32,
    pub sect14_rva: u32,
    pub sect14_size: u32,
    pub timestamp: u32,
    pub info: [DataDirectory; DATA_DIRECTORIES],
    pub subsystem: u16,
}

impl E32Rom {
    pub fn size(legacy: bool) -> usize {
        if legacy {
            E32_LEGACY_SIZE
        } else {
            E32_SIZE
        }
    }

    pub fn parse(raw: &[u8], legacy: bool) -> Result<Self> {
        if raw.len() < Self::size(legacy) {
            return Err(FlashError::format(format!(
                "e32 record needs {:#x} bytes, got {:#x}",
                Self::size(legacy),
                raw.len()
            )));
        }
        let (timestamp, info_ofs) = if legacy {
            (0, 0x20)
        } else {
            (le_u32(raw, 0x20), 0x24)
        };
        let mut info = [DataDirectory::default(); DATA_DIRECTORIES];
        for (i, d) in info.iter_mut().enumerate() {
            d.rva = le_u32(raw, info_ofs + 8 * i);
            d.size = le_u32(raw, info_ofs + 8 * i + 4);
        }
        Ok(E32Rom {
            object_count: le_u16(raw, 0x00),
            image_flags: le_u16(raw, 0x02),
            entry_rva: le_u32(raw, 0x04),
            vbase: le_u32(raw, 0x08),
            subsys_major: le_u16(raw, 0x0c),
            subsys_minor: le_u16(raw, 0x0e),
            stack_max: le_u32(raw, 0x10),
            vsize: le_u32(raw, 0x14),
            sect14_rva: le_u32(raw, 0x18),
            sect14_size: le_u32(raw, 0x1c),
            timestamp,
            info,
            subsystem: le_u16(raw, info_ofs + 8 * DATA_DIRECTORIES),
        })
    }

    pub fn encode(&self, legacy: bool) -> Vec<u8> {
        let mut out = vec![0u8; Self::size(legacy)];
        put_u16(&mut out, 0x00, self.object_count);
        put_u16(&mut out, 0x02, self.image_flags);
        put_u32(&mut out, 0x04, self.entry_rva);
        put_u32(&mut out, 0x08, self.vbase);
        put_u16(&mut out, 0x0c, self.subsys_major);
        put_u16(&mut out, 0x0e, self.subsys_minor);
        put_u32(&mut out, 0x10, self.stack_max);
        put_u32(&mut out, 0x14, self.vsize);
        put_u32(&mut out, 0x18, self.sect14_rva);
        put_u32(&mut out, 0x1c, self.sect14_size);
        let info_ofs = if legacy {
            0x20
        } else {
            put_u32(&mut out, 0x20, self.timestamp);
            0x24
        };
        for (i, d) in self.info.iter().enumerate() {
            put_u32(&mut out, info_ofs + 8 * i, d.rva);
            put_u32(&mut out, info_ofs + 8 * i + 4, d.size);
        }
        put_u16(&mut out, info_ofs + 8 * DATA_DIRECTORIES, self.subsystem);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct O32Rom {
    pub vsize: u32,
    pub rva: u32,
    pub psize: u32,
    /// RVA of the section data inside the ROM
    pub dataptr: u32,
    pub realaddr: u32,
    pub flags: u32,
}

impl O32Rom {
    pub fn parse(raw: &[u8]) -> Self {
        O32Rom {
            vsize: le_u32(raw, 0x00),
            rva: le_u32(raw, 0x04),
            psize: le_u32(raw, 0x08),
            dataptr: le_u32(raw, 0x0c),
            realaddr: le_u32(raw, 0x10),
            flags: le_u32(raw, 0x14),
        }
    }

    pub fn encode(&self) -> [u8; O32_SIZE] {
        let mut out = [0u8; O32_SIZE];
        put_u32(&mut out, 0x00, self.vsize);
        put_u32(&mut out, 0x04, self.rva);
        put_u32(&mut out, 0x08, self.psize);
        put_u32(&mut out, 0x0c, self.dataptr);
        put_u32(&mut out, 0x10, self.realaddr);
        put_u32(&mut out, 0x14, self.flags);
        out
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & IMAGE_SCN_COMPRESSED != 0
    }

    /// Bytes occupied in the ROM
    pub fn data_size(&self) -> u32 {
        self.vsize.min(self.psize)
    }
}

/// e32 plus its o32 table, as stored for one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RomExeHeader {
    pub e32: E32Rom,
    pub o32: Vec<O32Rom>,
}

impl RomExeHeader {
    /// Parse a contiguous e32+o32 blob.
    pub fn parse(blob: &[u8], legacy: bool) -> Result<Self> {
        let e32 = E32Rom::parse(blob, legacy)?;
        let start = E32Rom::size(legacy);
        Self::with_objects(e32, &blob[start..])
    }

    /// Combine an e32 record with a separately stored o32 table.
    pub fn with_objects(e32: E32Rom, o32_table: &[u8]) -> Result<Self> {
        let count = e32.object_count as usize;
        if o32_table.len() < count * O32_SIZE {
            return Err(FlashError::format(format!(
                "module declares {} sections, header holds {}",
                count,
                o32_table.len() / O32_SIZE
            )));
        }
        let o32 = o32_table
            .chunks_exact(O32_SIZE)
            .take(count)
            .map(O32Rom::parse)
            .collect();
        Ok(RomExeHeader { e32, o32 })
    }

    pub fn encoded_len(&self, legacy: bool) -> usize {
        E32Rom::size(legacy) + self.o32.len() * O32_SIZE
    }

    pub fn module_header(&self, cpu_type: u16) -> ModuleHeader {
        ModuleHeader {
            cpu_type,
            entry_rva: self.e32.entry_rva,
            base_rva: self.e32.vbase,
            stack_max: self.e32.stack_max,
            subsystem_version: (self.e32.subsys_major, self.e32.subsys_minor),
            timestamp: self.e32.timestamp,
            image_flags: self.e32.image_flags,
            subsystem: self.e32.subsystem,
            image_size: self.e32.vsize,
        }
    }
}
