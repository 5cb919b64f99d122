//! IMGFS directory records
//!
//! Every record is `DIRENT_SIZE` (0x34) bytes and starts with a magic:
//!
//! | magic        | record                             |
//! |--------------|------------------------------------|
//! | `0xfffff6fe` | file                               |
//! | `0xfffffefe` | module (file with a section chain) |
//! | `0xfffff6fd` | section                            |
//! | `0xfffffefb` | overflow name (24 UTF-16 chars)    |
//! | `0xffffffff` | free                               |

use super::header::DIRENT_SIZE;
use crate::error::{FlashError, Result};
use crate::filesystem::{decode_utf16le, encode_utf16le};
use crate::io::{le_u16, le_u32, le_u64, put_u16, put_u32, put_u64};

pub const DIRBLOCK_MAGIC: u32 = 0x2f53_14ce;
pub const FILE_MAGIC: u32 = 0xffff_f6fe;
pub const MODULE_FLAG: u32 = 0x800;
pub const MODULE_MAGIC: u32 = FILE_MAGIC | MODULE_FLAG;
pub const SECTION_MAGIC: u32 = 0xffff_f6fd;
pub const NAME_MAGIC: u32 = 0xffff_fefb;
pub const FREE_MAGIC: u32 = 0xffff_ffff;

/// Default attributes of a new file
pub const DEFAULT_ATTRIBUTES: u32 = 0x41;
/// Uncompressed bytes per index piece
pub const PIECE_SIZE: usize = 4096;
const NAME_IN_ENTRY: u16 = 2;
const INLINE_CHARS: usize = 4;
const NAME_ENTRY_CHARS: usize = 24;
const INDEX_RECORD: usize = 8;

/// Where a name is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameTier {
    /// Up to 4 UTF-16 units inside the referencing record
    Inline,
    /// Up to 24 units in a separate name record
    Entry,
    /// In a chunk run of its own
    Chunk,
}

impl NameTier {
    pub fn for_len(units: usize) -> Self {
        if units <= INLINE_CHARS {
            NameTier::Inline
        } else if units <= NAME_ENTRY_CHARS {
            NameTier::Entry
        } else {
            NameTier::Chunk
        }
    }
}

/// The 12-byte name reference embedded in file and section records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameInfo {
    /// Length in UTF-16 units
    pub length: u16,
    pub flags: u16,
    pub hash: u32,
    pub ptr: u32,
    pub inline: String,
}

impl NameInfo {
    pub fn parse(raw: &[u8]) -> Self {
        let length = le_u16(raw, 0);
        let flags = le_u16(raw, 2);
        if (length as usize) <= INLINE_CHARS {
            NameInfo {
                length,
                flags,
                hash: 0,
                ptr: 0,
                inline: decode_utf16le(&raw[4..12]),
            }
        } else {
            NameInfo {
                length,
                flags,
                hash: le_u32(raw, 4),
                ptr: le_u32(raw, 8),
                inline: String::new(),
            }
        }
    }

    pub fn encode(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        put_u16(&mut out, 0, self.length);
        put_u16(&mut out, 2, self.flags);
        if self.tier() == NameTier::Inline {
            let raw = encode_utf16le(&self.inline);
            out[4..4 + raw.len()].copy_from_slice(&raw);
        } else {
            put_u32(&mut out, 4, self.hash);
            put_u32(&mut out, 8, self.ptr);
        }
        out
    }

    /// Tier of a stored name; overflow records are flagged explicitly.
    pub fn tier(&self) -> NameTier {
        if (self.length as usize) <= INLINE_CHARS {
            NameTier::Inline
        } else if self.flags & NAME_IN_ENTRY != 0 {
            NameTier::Entry
        } else {
            NameTier::Chunk
        }
    }

    pub fn inline(name: &str) -> Self {
        NameInfo {
            length: name.encode_utf16().count() as u16,
            flags: 0,
            hash: 0,
            ptr: 0,
            inline: name.to_string(),
        }
    }

    pub fn in_entry(name: &str, ptr: u32) -> Self {
        NameInfo {
            length: name.encode_utf16().count() as u16,
            flags: NAME_IN_ENTRY,
            hash: name_hash(name),
            ptr,
            inline: String::new(),
        }
    }

    pub fn in_chunk(name: &str, ptr: u32) -> Self {
        NameInfo {
            length: name.encode_utf16().count() as u16,
            flags: 0,
            hash: name_hash(name),
            ptr,
            inline: String::new(),
        }
    }

    /// Bytes of UTF-16 text when stored in a chunk
    pub fn chunk_bytes(&self) -> u64 {
        self.length as u64 * 2
    }
}

/// Lookup hash: first two and last two characters, with a 4-character
/// extension stripped when enough of the name remains.
pub fn name_hash(name: &str) -> u32 {
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.len() <= INLINE_CHARS {
        return 0;
    }
    let mut stem = &units[..];
    if let Some(dot) = units.iter().rposition(|&u| u == u16::from(b'.')) {
        if dot + 4 == units.len() && dot >= 4 {
            stem = &units[..dot];
        }
    }
    let byte = |u: u16| (u & 0xff) as u32;
    let n = stem.len();
    (byte(stem[0]) << 24) | (byte(stem[1]) << 16) | (byte(stem[n - 2]) << 8) | byte(stem[n - 1])
}

fn check_magic(raw: &[u8], offset: u64, want: &[u32], what: &str) -> Result<u32> {
    let magic = le_u32(raw, 0);
    if want.contains(&magic) {
        Ok(magic)
    } else {
        Err(FlashError::CorruptDirectory {
            offset,
            reason: format!("{} record has magic {:08x}", what, magic),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub magic: u32,
    pub datatable: u32,
    pub section_list: u32,
    pub name: NameInfo,
    pub size: u32,
    pub attributes: u32,
    pub filetime: u64,
    pub reserved: u32,
    pub index_ptr: u32,
    pub index_size: u32,
}

impl FileRecord {
    pub fn parse(raw: &[u8], offset: u64) -> Result<Self> {
        let magic = check_magic(raw, offset, &[FILE_MAGIC, MODULE_MAGIC], "file")?;
        let datatable = le_u32(raw, 4);
        if datatable != 0 {
            tracing::warn!("{:#x}: file datatable {:08x}", offset, datatable);
        }
        Ok(FileRecord {
            magic,
            datatable,
            section_list: le_u32(raw, 8),
            name: NameInfo::parse(&raw[12..24]),
            size: le_u32(raw, 24),
            attributes: le_u32(raw, 28),
            filetime: le_u64(raw, 32),
            reserved: le_u32(raw, 40),
            index_ptr: le_u32(raw, 44),
            index_size: le_u32(raw, 48),
        })
    }

    pub fn new(name: NameInfo, filetime: u64) -> Self {
        FileRecord {
            magic: FILE_MAGIC,
            datatable: 0,
            section_list: 0,
            name,
            size: 0,
            attributes: DEFAULT_ATTRIBUTES,
            filetime,
            reserved: 0,
            index_ptr: 0,
            index_size: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; DIRENT_SIZE as usize];
        put_u32(&mut out, 0, self.magic);
        put_u32(&mut out, 4, self.datatable);
        put_u32(&mut out, 8, self.section_list);
        out[12..24].copy_from_slice(&self.name.encode());
        put_u32(&mut out, 24, self.size);
        put_u32(&mut out, 28, self.attributes);
        put_u64(&mut out, 32, self.filetime);
        put_u32(&mut out, 40, self.reserved);
        put_u32(&mut out, 44, self.index_ptr);
        put_u32(&mut out, 48, self.index_size);
        out
    }

    pub fn is_module(&self) -> bool {
        self.magic == MODULE_MAGIC
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionRecord {
    pub datatable: u32,
    pub next: u32,
    pub name: NameInfo,
    pub size: u32,
    pub index_ptr: u32,
    pub index_size: u32,
}

impl SectionRecord {
    pub fn parse(raw: &[u8], offset: u64) -> Result<Self> {
        check_magic(raw, offset, &[SECTION_MAGIC], "section")?;
        if raw[36..52].iter().any(|&b| b != 0) {
            tracing::warn!("{:#x}: section record tail not zero", offset);
        }
        Ok(SectionRecord {
            datatable: le_u32(raw, 4),
            next: le_u32(raw, 8),
            name: NameInfo::parse(&raw[12..24]),
            size: le_u32(raw, 24),
            index_ptr: le_u32(raw, 28),
            index_size: le_u32(raw, 32),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; DIRENT_SIZE as usize];
        put_u32(&mut out, 0, SECTION_MAGIC);
        put_u32(&mut out, 4, self.datatable);
        put_u32(&mut out, 8, self.next);
        out[12..24].copy_from_slice(&self.name.encode());
        put_u32(&mut out, 24, self.size);
        put_u32(&mut out, 28, self.index_ptr);
        put_u32(&mut out, 32, self.index_size);
        out
    }
}

/// Decode an overflow name record holding `length` UTF-16 units.
pub fn parse_name_record(raw: &[u8], offset: u64, length: u16) -> Result<String> {
    check_magic(raw, offset, &[NAME_MAGIC], "name")?;
    let units = (length as usize).min(NAME_ENTRY_CHARS);
    Ok(decode_utf16le(&raw[4..4 + units * 2]))
}

pub fn encode_name_record(name: &str) -> Vec<u8> {
    let mut out = vec![0u8; DIRENT_SIZE as usize];
    put_u32(&mut out, 0, NAME_MAGIC);
    let raw = encode_utf16le(name);
    let n = raw.len().min(NAME_ENTRY_CHARS * 2);
    out[4..4 + n].copy_from_slice(&raw[..n]);
    out
}

/// One `(stored, full, ptr)` record of a chunk index table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexPiece {
    pub stored: u16,
    pub full: u16,
    pub ptr: u32,
}

/// Parse an index table. Records with any zero field are padding.
pub fn parse_index(raw: &[u8]) -> Vec<IndexPiece> {
    raw.chunks_exact(INDEX_RECORD)
        .map(|r| IndexPiece {
            stored: le_u16(r, 0),
            full: le_u16(r, 2),
            ptr: le_u32(r, 4),
        })
        .filter(|p| p.stored != 0 && p.full != 0 && p.ptr != 0)
        .collect()
}

pub fn encode_index(pieces: &[IndexPiece]) -> Vec<u8> {
    let mut out = vec![0u8; pieces.len() * INDEX_RECORD];
    for (i, p) in pieces.iter().enumerate() {
        put_u16(&mut out, i * INDEX_RECORD, p.stored);
        put_u16(&mut out, i * INDEX_RECORD + 2, p.full);
        put_u32(&mut out, i * INDEX_RECORD + 4, p.ptr);
    }
    out
}
