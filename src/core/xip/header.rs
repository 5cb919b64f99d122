//! XIP ROM header and its locator
//!
//! The region starts with a jump block. At 0x40 sits the `ECEC` signature
//! followed by the header's RVA and its offset from the region start. The
//! difference of the two is the region's RVA base.

use crate::error::{FlashError, Result};
use crate::io::{le_u16, le_u32, put_u16, put_u32, SharedStream};
use serde::Serialize;

pub const ECEC_OFFSET: u64 = 0x40;
pub const ECEC_SIGNATURE: u32 = 0x4345_4345;
/// Signature, header RVA and header offset
pub const ECEC_RECORD_LEN: u64 = 12;
/// Bytes kept free at the region start
pub const FIRST_BLOCK_LEN: u64 = 0x1000;
pub const COPY_ENTRY_LEN: u64 = 16;

/// Where the ROM header lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct XipLocation {
    pub header_rva: u32,
    pub header_offset: u32,
    pub rva_base: u32,
}

impl XipLocation {
    /// Read the `ECEC` record. A zero header offset needs a forced `rva_base`.
    pub fn read(store: &SharedStream, rva_base: Option<u32>) -> Result<Self> {
        let mut raw = [0u8; 12];
        if store.read_at(ECEC_OFFSET, &mut raw)? != raw.len() {
            return Err(FlashError::format("region too small for an XIP header"));
        }
        if le_u32(&raw, 0) != ECEC_SIGNATURE {
            return Err(FlashError::format("no XIP ECEC signature"));
        }
        let header_rva = le_u32(&raw, 4);
        let mut header_offset = le_u32(&raw, 8);
        if header_rva == 0 && header_offset == 0 {
            return Err(FlashError::format("XIP header pointer is empty"));
        }
        if header_offset == 0 {
            let base = rva_base.ok_or_else(|| {
                FlashError::format("XIP without header offset needs an RVA base")
            })?;
            header_offset = header_rva.checked_sub(base).ok_or_else(|| {
                FlashError::format(format!(
                    "XIP header rva {:08x} below base {:08x}",
                    header_rva, base
                ))
            })?;
        }
        let rva_base = header_rva.checked_sub(header_offset).ok_or_else(|| {
            FlashError::format(format!(
                "XIP header offset {:#x} exceeds rva {:08x}",
                header_offset, header_rva
            ))
        })?;
        Ok(XipLocation {
            header_rva,
            header_offset,
            rva_base,
        })
    }
}

/// Check for an XIP region: signature plus `physfirst == hdrrva - hdrofs`.
pub fn is_xip(store: &SharedStream, rva_base: Option<u32>) -> bool {
    let loc = match XipLocation::read(store, rva_base) {
        Ok(loc) => loc,
        Err(e) => {
            tracing::trace!("not xip: {}", e);
            return false;
        }
    };
    match store.read_u32_at(loc.header_offset as u64 + 8) {
        Ok(physfirst) if physfirst == loc.rva_base => true,
        Ok(physfirst) => {
            tracing::trace!(
                "not xip: physfirst {:08x} != {:08x}",
                physfirst,
                loc.rva_base
            );
            false
        }
        Err(_) => false,
    }
}

/// The 0x54-byte ROM header
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RomHeader {
    pub dll_first: u32,
    pub dll_last: u32,
    pub phys_first: u32,
    pub phys_last: u32,
    pub num_mods: u32,
    pub ram_start: u32,
    pub ram_free: u32,
    pub ram_end: u32,
    pub copy_entries: u32,
    pub copy_offset: u32,
    pub profile_len: u32,
    pub profile_offset: u32,
    pub num_files: u32,
    pub kernel_flags: u32,
    pub fs_ram_percent: u32,
    pub drivglob_start: u32,
    pub drivglob_len: u32,
    pub cpu_type: u16,
    pub misc_flags: u16,
    pub extensions: u32,
    pub tracking_start: u32,
    pub tracking_len: u32,
}

impl RomHeader {
    pub const LEN: usize = 0x54;

    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < Self::LEN {
            return Err(FlashError::format("truncated XIP rom header"));
        }
        Ok(RomHeader {
            dll_first: le_u32(raw, 0x00),
            dll_last: le_u32(raw, 0x04),
            phys_first: le_u32(raw, 0x08),
            phys_last: le_u32(raw, 0x0c),
            num_mods: le_u32(raw, 0x10),
            ram_start: le_u32(raw, 0x14),
            ram_free: le_u32(raw, 0x18),
            ram_end: le_u32(raw, 0x1c),
            copy_entries: le_u32(raw, 0x20),
            copy_offset: le_u32(raw, 0x24),
            profile_len: le_u32(raw, 0x28),
            profile_offset: le_u32(raw, 0x2c),
            num_files: le_u32(raw, 0x30),
            kernel_flags: le_u32(raw, 0x34),
            fs_ram_percent: le_u32(raw, 0x38),
            drivglob_start: le_u32(raw, 0x3c),
            drivglob_len: le_u32(raw, 0x40),
            cpu_type: le_u16(raw, 0x44),
            misc_flags: le_u16(raw, 0x46),
            extensions: le_u32(raw, 0x48),
            tracking_start: le_u32(raw, 0x4c),
            tracking_len: le_u32(raw, 0x50),
        })
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        put_u32(&mut out, 0x00, self.dll_first);
        put_u32(&mut out, 0x04, self.dll_last);
        put_u32(&mut out, 0x08, self.phys_first);
        put_u32(&mut out, 0x0c, self.phys_last);
        put_u32(&mut out, 0x10, self.num_mods);
        put_u32(&mut out, 0x14, self.ram_start);
        put_u32(&mut out, 0x18, self.ram_free);
        put_u32(&mut out, 0x1c, self.ram_end);
        put_u32(&mut out, 0x20, self.copy_entries);
        put_u32(&mut out, 0x24, self.copy_offset);
        put_u32(&mut out, 0x28, self.profile_len);
        put_u32(&mut out, 0x2c, self.profile_offset);
        put_u32(&mut out, 0x30, self.num_files);
        put_u32(&mut out, 0x34, self.kernel_flags);
        put_u32(&mut out, 0x38, self.fs_ram_percent);
        put_u32(&mut out, 0x3c, self.drivglob_start);
        put_u32(&mut out, 0x40, self.drivglob_len);
        put_u16(&mut out, 0x44, self.cpu_type);
        put_u16(&mut out, 0x46, self.misc_flags);
        put_u32(&mut out, 0x48, self.extensions);
        put_u32(&mut out, 0x4c, self.tracking_start);
        put_u32(&mut out, 0x50, self.tracking_len);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryStore;

    fn region(header_rva: u32, header_offset: u32, physfirst: u32) -> SharedStream {
        let mut raw = vec![0u8; 0x2000];
        put_u32(&mut raw, 0x40, ECEC_SIGNATURE);
        put_u32(&mut raw, 0x44, header_rva);
        put_u32(&mut raw, 0x48, header_offset);
        let at = if header_offset != 0 { header_offset } else { 0x1000 } as usize;
        put_u32(&mut raw, at + 8, physfirst);
        SharedStream::new(MemoryStore::from_vec(raw))
    }

    #[test]
    fn test_locate_header() {
        let store = region(0x8000_1000, 0x1000, 0x8000_0000);
        let loc = XipLocation::read(&store, None).unwrap();
        assert_eq!(loc.rva_base, 0x8000_0000);
        assert!(is_xip(&store, None));
    }

    #[test]
    fn test_forced_base_for_old_layout() {
        let store = region(0x8c00_1000, 0, 0x8c00_0000);
        assert!(XipLocation::read(&store, None).is_err());
        assert!(!is_xip(&store, None));

        let loc = XipLocation::read(&store, Some(0x8c00_0000)).unwrap();
        assert_eq!(loc.header_offset, 0x1000);
        assert!(is_xip(&store, Some(0x8c00_0000)));
    }

    #[test]
    fn test_rejects_inconsistent_physfirst() {
        let store = region(0x8000_1000, 0x1000, 0x1234);
        assert!(!is_xip(&store, None));
        let store = SharedStream::new(MemoryStore::from_vec(vec![0u8; 0x100]));
        assert!(!is_xip(&store, None));
    }

    #[test]
    fn test_rom_header_layout() {
        let hdr = RomHeader {
            phys_first: 0x8000_0000,
            num_mods: 3,
            num_files: 7,
            cpu_type: 0x01c2,
            tracking_len: 0x55,
            ..RomHeader::default()
        };
        let raw = hdr.encode();
        assert_eq!(le_u32(&raw, 0x10), 3);
        assert_eq!(le_u16(&raw, 0x44), 0x01c2);
        assert_eq!(RomHeader::parse(&raw).unwrap(), hdr);
    }
}
