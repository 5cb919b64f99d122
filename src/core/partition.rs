//! Partition tables and flash layout sectors
//!
//! [`PartitionTable`] reads a classic MBR sector. [`FlashLayout`] reads the
//! "MSFLSH50" sector some images place one sector before their MBR.

use crate::error::{FlashError, Result};
use crate::io::{le_u32, SharedStream};
use serde::Serialize;

pub const SECTOR_LEN: usize = 512;
const TABLE_OFFSET: usize = 0x1be;
const ENTRY_LEN: usize = 16;
const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xaa];

/// Default sector size used by flash partition tables
pub const DEFAULT_SECTOR_SIZE: u64 = 0x800;

pub const PART_UPDATE_XIP: u8 = 0x20;
pub const PART_BOOT_XIP: u8 = 0x23;
pub const PART_IMGFS: u8 = 0x25;

/// Check the boot signature of the MBR sector at `offset`.
pub fn is_partition_table(store: &SharedStream, offset: u64) -> bool {
    let mut sig = [0u8; 2];
    matches!(store.read_at(offset + 510, &mut sig), Ok(2)) && sig == BOOT_SIGNATURE
}

/// Cylinder/head/sector triple as packed in an MBR entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Chs {
    pub cylinder: u16,
    pub head: u8,
    pub sector: u8,
}

impl Chs {
    fn parse(raw: &[u8]) -> Self {
        Chs {
            head: raw[0],
            sector: raw[1] & 0x3f,
            cylinder: raw[2] as u16 | (((raw[1] & 0xc0) as u16) << 2),
        }
    }
}

/// One MBR partition entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartitionEntry {
    pub index: usize,
    pub boot_flag: u8,
    pub start_chs: Chs,
    pub kind: u8,
    pub end_chs: Chs,
    pub start_sector: u32,
    pub sector_count: u32,
    pub sector_size: u64,
}

impl PartitionEntry {
    fn parse(index: usize, raw: &[u8], sector_size: u64) -> Self {
        PartitionEntry {
            index,
            boot_flag: raw[0],
            start_chs: Chs::parse(&raw[1..4]),
            kind: raw[4],
            end_chs: Chs::parse(&raw[5..8]),
            start_sector: le_u32(raw, 8),
            sector_count: le_u32(raw, 12),
            sector_size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kind == 0 && self.sector_count == 0
    }

    pub fn is_bootable(&self) -> bool {
        self.boot_flag & 0x80 != 0
    }

    /// Byte offset of the partition
    pub fn start(&self) -> u64 {
        self.start_sector as u64 * self.sector_size
    }

    /// Byte length of the partition
    pub fn size(&self) -> u64 {
        self.sector_count as u64 * self.sector_size
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            PART_UPDATE_XIP => "update-xip",
            PART_BOOT_XIP => "boot-xip",
            PART_IMGFS => "imgfs",
            0 => "empty",
            _ => "other",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionTable {
    entries: [PartitionEntry; 4],
}

impl PartitionTable {
    /// Parse a 512-byte MBR sector.
    pub fn parse(sector: &[u8], sector_size: u64) -> Result<Self> {
        if sector.len() < SECTOR_LEN || sector[510..512] != BOOT_SIGNATURE {
            return Err(FlashError::format("no partition table boot signature"));
        }
        let entry = |i: usize| {
            let ofs = TABLE_OFFSET + i * ENTRY_LEN;
            PartitionEntry::parse(i, &sector[ofs..ofs + ENTRY_LEN], sector_size)
        };
        Ok(PartitionTable {
            entries: [entry(0), entry(1), entry(2), entry(3)],
        })
    }

    pub fn read(store: &SharedStream, offset: u64, sector_size: u64) -> Result<Self> {
        let sector = store.read_upto(offset, SECTOR_LEN)?;
        Self::parse(&sector, sector_size)
    }

    /// All four raw entries
    pub fn entries(&self) -> &[PartitionEntry; 4] {
        &self.entries
    }

    /// Entries in use
    pub fn partitions(&self) -> impl Iterator<Item = &PartitionEntry> {
        self.entries.iter().filter(|e| !e.is_empty())
    }

    pub fn first_of_kind(&self, kind: u8) -> Option<&PartitionEntry> {
        self.partitions().find(|e| e.kind == kind)
    }
}

pub const FLASH_LAYOUT_TAG: &[u8; 8] = b"MSFLSH50";

/// Named reserved area in a flash layout sector
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservedEntry {
    pub name: String,
    pub start_block: u32,
    pub block_count: u32,
}

/// Flash region record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlashRegion {
    pub kind: u32,
    pub start_phys_block: u32,
    pub phys_block_count: u32,
    pub logical_block_count: u32,
    pub sectors_per_block: u32,
    pub bytes_per_block: u32,
    pub compact_blocks: u32,
}

/// "MSFLSH50" flash layout sector
#[derive(Debug, Clone, Serialize)]
pub struct FlashLayout {
    pub reserved: Vec<ReservedEntry>,
    pub regions: Vec<FlashRegion>,
}

const RESERVED_ENTRY_LEN: usize = 16;
const REGION_LEN: usize = 0x1c;

impl FlashLayout {
    pub fn parse(sector: &[u8]) -> Result<Self> {
        if sector.len() < 16 || &sector[..8] != FLASH_LAYOUT_TAG {
            return Err(FlashError::format("missing MSFLSH50 tag"));
        }
        let reserved_len = le_u32(sector, 8) as usize;
        let region_len = le_u32(sector, 12) as usize;
        if reserved_len % RESERVED_ENTRY_LEN != 0 || region_len % REGION_LEN != 0 {
            return Err(FlashError::format("MSFLSH50 table sizes not whole records"));
        }
        let mut pos = 16;
        if pos + reserved_len + region_len > sector.len() {
            return Err(FlashError::format("MSFLSH50 tables exceed sector"));
        }

        let mut reserved = Vec::new();
        for raw in sector[pos..pos + reserved_len].chunks_exact(RESERVED_ENTRY_LEN) {
            let name_end = raw[..8].iter().position(|&b| b == 0).unwrap_or(8);
            reserved.push(ReservedEntry {
                name: String::from_utf8_lossy(&raw[..name_end]).into_owned(),
                start_block: le_u32(raw, 8),
                block_count: le_u32(raw, 12),
            });
        }
        pos += reserved_len;

        let mut regions = Vec::new();
        for raw in sector[pos..pos + region_len].chunks_exact(REGION_LEN) {
            regions.push(FlashRegion {
                kind: le_u32(raw, 0),
                start_phys_block: le_u32(raw, 4),
                phys_block_count: le_u32(raw, 8),
                logical_block_count: le_u32(raw, 12),
                sectors_per_block: le_u32(raw, 16),
                bytes_per_block: le_u32(raw, 20),
                compact_blocks: le_u32(raw, 24),
            });
        }
        Ok(FlashLayout { reserved, regions })
    }

    /// Probe sector sizes 512..=65536 for a layout sector at offset
    /// `sector_size`, returning the sector size and the layout.
    pub fn locate(store: &SharedStream) -> Option<(u64, FlashLayout)> {
        let mut sector_size = 512u64;
        while sector_size <= 0x10000 {
            if let Ok(sector) = store.read_upto(sector_size, SECTOR_LEN) {
                if let Ok(layout) = Self::parse(&sector) {
                    return Some((sector_size, layout));
                }
            }
            sector_size *= 2;
        }
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::io::MemoryStore;

    pub(crate) fn mbr(entries: &[(u8, u8, u32, u32)]) -> Vec<u8> {
        let mut sector = vec![0u8; SECTOR_LEN];
        for (i, &(boot, kind, start, count)) in entries.iter().enumerate() {
            let ofs = TABLE_OFFSET + i * ENTRY_LEN;
            sector[ofs] = boot;
            sector[ofs + 1..ofs + 4].copy_from_slice(&[1, 0xc2, 0x05]);
            sector[ofs + 4] = kind;
            sector[ofs + 5..ofs + 8].copy_from_slice(&[2, 0x3f, 0x10]);
            sector[ofs + 8..ofs + 12].copy_from_slice(&start.to_le_bytes());
            sector[ofs + 12..ofs + 16].copy_from_slice(&count.to_le_bytes());
        }
        sector[510] = 0x55;
        sector[511] = 0xaa;
        sector
    }

    #[test]
    fn test_parse_four_entries() {
        let sector = mbr(&[
            (0x80, PART_BOOT_XIP, 2, 0x100),
            (0x00, PART_UPDATE_XIP, 0x102, 0x80),
            (0x00, PART_IMGFS, 0x182, 0x1000),
            (0x00, 0x04, 0x1182, 0x20),
        ]);
        let table = PartitionTable::parse(&sector, 0x800).unwrap();
        let e = table.entries();
        assert!(e[0].is_bootable());
        assert!(!e[1].is_bootable());
        assert_eq!(e[0].boot_flag, 0x80);
        assert_eq!((e[0].start(), e[0].size()), (0x1000, 0x80000));
        assert_eq!((e[1].start(), e[1].size()), (0x81000, 0x40000));
        assert_eq!((e[2].start(), e[2].size()), (0xc1000, 0x800000));
        assert_eq!((e[3].start(), e[3].size()), (0x8c1000, 0x10000));
        assert_eq!(e[2].kind_name(), "imgfs");
        assert_eq!(table.first_of_kind(PART_IMGFS).unwrap().index, 2);
    }

    #[test]
    fn test_chs_decoding() {
        let sector = mbr(&[(0, PART_IMGFS, 1, 1)]);
        let table = PartitionTable::parse(&sector, 512).unwrap();
        let e = &table.entries()[0];
        assert_eq!(
            e.start_chs,
            Chs {
                cylinder: 0x305,
                head: 1,
                sector: 2
            }
        );
        assert_eq!(
            e.end_chs,
            Chs {
                cylinder: 0x10,
                head: 2,
                sector: 0x3f
            }
        );
    }

    #[test]
    fn test_empty_entries_skipped() {
        let sector = mbr(&[(0, PART_IMGFS, 4, 8)]);
        let table = PartitionTable::parse(&sector, 512).unwrap();
        assert_eq!(table.partitions().count(), 1);
    }

    #[test]
    fn test_signature_check() {
        let mut sector = mbr(&[]);
        let store = SharedStream::new(MemoryStore::from_vec(sector.clone()));
        assert!(is_partition_table(&store, 0));
        sector[511] = 0;
        assert!(PartitionTable::parse(&sector, 512).unwrap_err().is_format());
    }

    #[test]
    fn test_flash_layout_locate() {
        let mut image = vec![0u8; 0x1000 + SECTOR_LEN];
        let layout = &mut image[0x1000..];
        layout[..8].copy_from_slice(FLASH_LAYOUT_TAG);
        layout[8..12].copy_from_slice(&16u32.to_le_bytes());
        layout[12..16].copy_from_slice(&(REGION_LEN as u32).to_le_bytes());
        layout[16..22].copy_from_slice(b"BOOTLD");
        layout[24..28].copy_from_slice(&0u32.to_le_bytes());
        layout[28..32].copy_from_slice(&4u32.to_le_bytes());
        layout[32..36].copy_from_slice(&1u32.to_le_bytes());
        layout[52..56].copy_from_slice(&0x800u32.to_le_bytes());

        let store = SharedStream::new(MemoryStore::from_vec(image));
        let (sector_size, layout) = FlashLayout::locate(&store).unwrap();
        assert_eq!(sector_size, 0x1000);
        assert_eq!(layout.reserved[0].name, "BOOTLD");
        assert_eq!(layout.reserved[0].block_count, 4);
        assert_eq!(layout.regions.len(), 1);
        assert_eq!(layout.regions[0].kind, 1);
        assert_eq!(layout.regions[0].bytes_per_block, 0x800);
    }
}
