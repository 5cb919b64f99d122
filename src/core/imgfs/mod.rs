//! IMGFS directory filesystem
//!
//! Layout: a header block at offset 0, then a chain of directory blocks
//! starting at `block_size`. Each directory block begins with
//! `(DIRBLOCK_MAGIC, next)` and holds fixed 0x34-byte records. File data is
//! split into 4096-byte pieces, each compressed independently and referenced
//! from a chunk index table.
//!
//! Space is tracked in an [`AllocationMap`] over byte offsets (every run is
//! chunk aligned) and a [`SlotBitmap`] over directory record slots.

pub mod dirent;
pub mod header;

#[cfg(test)]
mod tests;

pub use header::{is_imgfs, ImgfsHeader, ImgfsParams, IMGFS_UUID};

use crate::allocator::{AllocationMap, OverlapPolicy, SlotBitmap};
use crate::compression::{compress_if_beneficial, expand_piece, SharedCodec};
use crate::error::{FlashError, Result};
use crate::filesystem::{
    filetime_now, filetime_to_datetime, EntryInfo, EntryKind, Filesystem, FsKind, FsStats,
    NameKey,
};
use crate::io::{MemoryStore, SharedStream, UndoLog};
use crate::module::{ExeBuilder, RomExeHeader, SectionSource, IMAGE_FILE_MACHINE_ARM};
use dirent::{
    encode_index, encode_name_record, parse_index, parse_name_record, FileRecord, IndexPiece,
    NameInfo, NameTier, SectionRecord, DIRBLOCK_MAGIC, FILE_MAGIC, FREE_MAGIC, MODULE_MAGIC,
    NAME_MAGIC, PIECE_SIZE, SECTION_MAGIC,
};
use header::{DIRBLOCK_HEADER, DIRENT_SIZE};
use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::sync::Arc;

/// Freed storage reads as erased flash
const ERASED: u8 = 0xff;

#[derive(Debug, Clone)]
struct SectionNode {
    address: u64,
    name: String,
    record: SectionRecord,
}

#[derive(Debug, Clone)]
struct FileNode {
    address: u64,
    name: String,
    record: FileRecord,
    sections: Vec<SectionNode>,
    stored_size: u64,
}

/// Undo state for a mutation
struct Snapshot {
    alloc: AllocationMap,
    slots: SlotBitmap,
    dir_blocks: Vec<u64>,
    files: BTreeMap<NameKey, FileNode>,
}

pub struct Imgfs {
    stream: SharedStream,
    header: ImgfsHeader,
    codec: SharedCodec,
    builder: Option<Arc<dyn ExeBuilder>>,
    alloc: AllocationMap,
    slots: SlotBitmap,
    /// Directory block offsets in chain order
    dir_blocks: Vec<u64>,
    files: BTreeMap<NameKey, FileNode>,
    cpu_type: u16,
    legacy_e32: bool,
    /// Prior bytes of the mutation in progress
    undo: Option<UndoLog>,
}

impl Imgfs {
    pub fn open(stream: SharedStream, codec: SharedCodec) -> Result<Self> {
        Self::open_with_policy(stream, codec, OverlapPolicy::default())
    }

    pub fn open_with_policy(
        stream: SharedStream,
        codec: SharedCodec,
        policy: OverlapPolicy,
    ) -> Result<Self> {
        let raw = stream.read_upto(0, ImgfsHeader::LEN)?;
        let header = ImgfsHeader::parse(&raw)?;
        tracing::debug!(
            "imgfs header: {:#x} byte blocks, {:#x} byte chunks, {}",
            header.bytes_per_block,
            header.chunk_size(),
            header.compression
        );

        let mut fs = Imgfs {
            stream,
            header,
            codec,
            builder: None,
            alloc: AllocationMap::with_policy(policy),
            slots: SlotBitmap::new(0),
            dir_blocks: Vec::new(),
            files: BTreeMap::new(),
            cpu_type: IMAGE_FILE_MACHINE_ARM,
            legacy_e32: false,
            undo: None,
        };
        fs.alloc.mark_used(0, fs.header.block_size(), "imgfs-header")?;
        fs.scan_dir_blocks()?;
        fs.scan_entries()?;

        tracing::info!(
            "imgfs: {} files, {} directory blocks, {:#x} bytes used",
            fs.files.len(),
            fs.dir_blocks.len(),
            fs.alloc.used_bytes()
        );
        Ok(fs)
    }

    /// Format an empty filesystem on `stream` and open it.
    pub fn create(stream: SharedStream, params: ImgfsParams, codec: SharedCodec) -> Result<Self> {
        let header = ImgfsHeader::from_params(&params)?;
        let bs = header.block_size();

        let mut block0 = vec![0u8; bs as usize];
        block0[..ImgfsHeader::LEN].copy_from_slice(&header.encode());
        stream.write_at(0, &block0)?;
        stream.write_at(bs, &empty_dir_block(bs))?;
        tracing::info!("formatted imgfs with {:#x}-byte blocks", bs);
        Self::open(stream, codec)
    }

    pub fn header(&self) -> &ImgfsHeader {
        &self.header
    }

    pub fn stream(&self) -> &SharedStream {
        &self.stream
    }

    pub fn allocation_map(&self) -> &AllocationMap {
        &self.alloc
    }

    pub fn set_exe_builder(&mut self, builder: Arc<dyn ExeBuilder>) {
        self.builder = Some(builder);
    }

    /// CPU type handed to the executable builder, normally taken from the XIP header.
    pub fn set_cpu_type(&mut self, cpu_type: u16) {
        tracing::debug!("imgfs: cputype={:04x}", cpu_type);
        self.cpu_type = cpu_type;
    }

    pub fn cpu_type(&self) -> u16 {
        self.cpu_type
    }

    pub fn set_legacy_e32(&mut self, legacy: bool) {
        self.legacy_e32 = legacy;
    }

    fn scan_dir_blocks(&mut self) -> Result<()> {
        let bs = self.header.block_size();
        let mut seen = HashSet::new();
        let mut ofs = bs;
        while ofs != 0 {
            if !seen.insert(ofs) {
                return Err(FlashError::CorruptDirectory {
                    offset: ofs,
                    reason: "directory block chain loops".to_string(),
                });
            }
            if ofs % bs != 0 || ofs + bs > self.stream.size() {
                return Err(FlashError::CorruptDirectory {
                    offset: ofs,
                    reason: "directory block outside image".to_string(),
                });
            }
            let magic = self.stream.read_u32_at(ofs)?;
            if magic != DIRBLOCK_MAGIC {
                return Err(FlashError::CorruptDirectory {
                    offset: ofs,
                    reason: format!("invalid dirblock magic {:08x}", magic),
                });
            }
            self.alloc.mark_used(ofs, bs, "dirblock")?;
            self.dir_blocks.push(ofs);
            ofs = self.stream.read_u32_at(ofs + 4)? as u64;
        }
        self.slots = SlotBitmap::new(self.dir_blocks.len() * self.header.entries_per_block());
        Ok(())
    }

    fn scan_entries(&mut self) -> Result<()> {
        let bs = self.header.block_size();
        let epb = self.header.entries_per_block();
        for block in self.dir_blocks.clone() {
            let raw = self.stream.read_vec(block, bs as usize)?;
            for i in 0..epb {
                let at = DIRBLOCK_HEADER as usize + i * DIRENT_SIZE as usize;
                let rec = &raw[at..at + DIRENT_SIZE as usize];
                let address = block + at as u64;
                match u32::from_le_bytes([rec[0], rec[1], rec[2], rec[3]]) {
                    FILE_MAGIC | MODULE_MAGIC => {
                        let node = match self.load_file(address, rec) {
                            Ok(node) => node,
                            Err(e) if e.is_entry_local() => {
                                tracing::warn!("skipping entry at {:#x}: {}", address, e);
                                continue;
                            }
                            Err(e) => return Err(e),
                        };
                        let key = NameKey::new(&node.name);
                        if self.files.contains_key(&key) {
                            tracing::warn!("duplicate name: {}", node.name);
                        } else {
                            self.files.insert(key, node);
                        }
                    }
                    // claimed through the referencing file
                    SECTION_MAGIC | NAME_MAGIC | FREE_MAGIC | 0 => {}
                    magic => {
                        return Err(FlashError::CorruptDirectory {
                            offset: address,
                            reason: format!("unrecognized entry magic {:08x}", magic),
                        })
                    }
                }
            }
        }
        Ok(())
    }

    fn load_file(&mut self, address: u64, raw: &[u8]) -> Result<FileNode> {
        let record = FileRecord::parse(raw, address)?;
        self.claim_slot(address)?;
        let name = self.load_name(&record.name)?;
        let mut stored_size = self.claim_data(record.index_ptr, record.index_size, "filedata")?;

        let mut sections = Vec::new();
        let mut next = record.section_list as u64;
        let mut seen = HashSet::new();
        while next != 0 {
            if !seen.insert(next) {
                return Err(FlashError::CorruptDirectory {
                    offset: next,
                    reason: format!("section chain of {} loops", name),
                });
            }
            let raw = self.stream.read_vec(next, DIRENT_SIZE as usize)?;
            let sec = SectionRecord::parse(&raw, next)?;
            self.claim_slot(next)?;
            let sec_name = self.load_name(&sec.name)?;
            stored_size += self.claim_data(sec.index_ptr, sec.index_size, "sectiondata")?;
            let following = sec.next as u64;
            sections.push(SectionNode {
                address: next,
                name: sec_name,
                record: sec,
            });
            next = following;
        }

        Ok(FileNode {
            address,
            name,
            record,
            sections,
            stored_size,
        })
    }

    /// Resolve a name reference, claiming its storage.
    fn load_name(&mut self, info: &NameInfo) -> Result<String> {
        match info.tier() {
            NameTier::Inline => Ok(info.inline.clone()),
            NameTier::Entry => {
                let ptr = info.ptr as u64;
                let raw = self.stream.read_vec(ptr, DIRENT_SIZE as usize)?;
                let name = parse_name_record(&raw, ptr, info.length)?;
                self.claim_slot(ptr)?;
                Ok(name)
            }
            NameTier::Chunk => {
                let ptr = info.ptr as u64;
                let raw = self.stream.read_vec(ptr, info.chunk_bytes() as usize)?;
                self.claim_chunks(ptr, info.chunk_bytes(), "namechunk")?;
                Ok(crate::filesystem::decode_utf16le(&raw))
            }
        }
    }

    /// Claim an index table and its pieces; returns the stored byte count.
    fn claim_data(&mut self, index_ptr: u32, index_size: u32, tag: &str) -> Result<u64> {
        if index_ptr == 0 || index_size == 0 {
            return Ok(0);
        }
        let pieces = self.read_index(index_ptr, index_size)?;
        self.claim_chunks(index_ptr as u64, index_size as u64, "index")?;
        let mut stored = 0;
        for p in pieces {
            self.claim_chunks(p.ptr as u64, p.stored as u64, tag)?;
            stored += p.stored as u64;
        }
        Ok(stored)
    }

    fn claim_chunks(&mut self, ofs: u64, len: u64, tag: &str) -> Result<()> {
        let rounded = self.header.round_to_chunk(len);
        if ofs % self.header.chunk_size() != 0 {
            return Err(FlashError::CorruptDirectory {
                offset: ofs,
                reason: format!("unaligned {} chunk", tag),
            });
        }
        if ofs + len > self.stream.size() {
            return Err(FlashError::CorruptDirectory {
                offset: ofs,
                reason: format!(
                    "{} chunk {:#x}+{:#x} outside image of {:#x}",
                    tag,
                    ofs,
                    len,
                    self.stream.size()
                ),
            });
        }
        self.alloc.mark_used(ofs, rounded, tag)
    }

    fn claim_slot(&mut self, address: u64) -> Result<()> {
        let slot = self.slot_index(address)?;
        self.slots.set(slot);
        Ok(())
    }

    fn slot_index(&self, address: u64) -> Result<usize> {
        let bs = self.header.block_size();
        let block = address - address % bs;
        let within = address % bs;
        let misplaced = |reason: &str| FlashError::CorruptDirectory {
            offset: address,
            reason: reason.to_string(),
        };
        let ordinal = self
            .dir_blocks
            .iter()
            .position(|&b| b == block)
            .ok_or_else(|| misplaced("entry outside directory blocks"))?;
        if within < DIRBLOCK_HEADER || (within - DIRBLOCK_HEADER) % DIRENT_SIZE as u64 != 0 {
            return Err(misplaced("unaligned entry offset"));
        }
        let idx = ((within - DIRBLOCK_HEADER) / DIRENT_SIZE as u64) as usize;
        if idx >= self.header.entries_per_block() {
            return Err(misplaced("entry beyond end of directory block"));
        }
        Ok(ordinal * self.header.entries_per_block() + idx)
    }

    fn slot_address(&self, slot: usize) -> u64 {
        let epb = self.header.entries_per_block();
        self.dir_blocks[slot / epb] + DIRBLOCK_HEADER + (slot % epb) as u64 * DIRENT_SIZE as u64
    }

    fn read_index(&self, index_ptr: u32, index_size: u32) -> Result<Vec<IndexPiece>> {
        let raw = self.stream.read_vec(index_ptr as u64, index_size as usize)?;
        Ok(parse_index(&raw))
    }

    /// Concatenate the expanded pieces of one index table.
    fn read_data(&self, index_ptr: u32, index_size: u32, declared: u32, owner: u64) -> Result<Vec<u8>> {
        if index_ptr == 0 || index_size == 0 {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(declared as usize);
        for p in self.read_index(index_ptr, index_size)? {
            let stored = self.stream.read_vec(p.ptr as u64, p.stored as usize)?;
            let full = expand_piece(
                self.codec.as_ref(),
                self.header.compression,
                &stored,
                p.full as usize,
                p.ptr as u64,
            )?;
            out.extend_from_slice(&full);
        }
        if out.len() as u64 != declared as u64 {
            tracing::warn!(
                "{:#x}: index total {:#x}, entry size {:#x}",
                owner,
                out.len(),
                declared
            );
        }
        Ok(out)
    }

    fn node(&self, name: &str) -> Result<&FileNode> {
        self.files
            .get(&NameKey::new(name))
            .ok_or_else(|| FlashError::NotFound(name.to_string()))
    }

    fn info(node: &FileNode) -> EntryInfo {
        EntryInfo {
            name: node.name.clone(),
            kind: if node.record.is_module() {
                EntryKind::Module
            } else {
                EntryKind::File
            },
            size: node.record.size as u64,
            stored_size: node.stored_size,
            attributes: node.record.attributes,
            modified: filetime_to_datetime(node.record.filetime),
            address: node.address,
        }
    }

    /// Section data of a module, in chain order.
    pub fn module_sections(&self, name: &str) -> Result<Vec<SectionSource>> {
        let node = self.node(name)?;
        node.sections
            .iter()
            .map(|s| {
                let data = self.read_data(
                    s.record.index_ptr,
                    s.record.index_size,
                    s.record.size,
                    s.address,
                )?;
                Ok(SectionSource {
                    name: s.name.clone(),
                    size: data.len() as u64,
                    reader: SharedStream::new(MemoryStore::read_only(data)),
                })
            })
            .collect()
    }

    /// The e32/o32 header blob stored as a module's own data.
    pub fn module_header(&self, name: &str) -> Result<RomExeHeader> {
        let node = self.node(name)?;
        let blob = self.read_data(
            node.record.index_ptr,
            node.record.index_size,
            node.record.size,
            node.address,
        )?;
        RomExeHeader::parse(&blob, self.legacy_e32)
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            alloc: self.alloc.clone(),
            slots: self.slots.clone(),
            dir_blocks: self.dir_blocks.clone(),
            files: self.files.clone(),
        }
    }

    fn restore(&mut self, snap: Snapshot) {
        self.alloc = snap.alloc;
        self.slots = snap.slots;
        self.dir_blocks = snap.dir_blocks;
        self.files = snap.files;
    }

    fn transact<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let snap = self.snapshot();
        self.undo = Some(UndoLog::begin(&self.stream));
        let result = op(self);
        let undo = self.undo.take();
        match result {
            Ok(v) => Ok(v),
            Err(e) => {
                tracing::warn!("imgfs mutation rolled back: {}", e);
                if let Some(undo) = undo {
                    if let Err(re) = undo.rollback(&self.stream) {
                        tracing::warn!("imgfs: restoring overwritten bytes failed: {}", re);
                    }
                }
                self.restore(snap);
                Err(e)
            }
        }
    }

    /// Write through the undo log of the current mutation.
    fn put(&mut self, pos: u64, data: &[u8]) -> Result<()> {
        if let Some(undo) = self.undo.as_mut() {
            undo.record(&self.stream, pos, data.len() as u64)?;
        }
        self.stream.write_at(pos, data)
    }

    fn erase(&mut self, pos: u64, len: u64) -> Result<()> {
        if let Some(undo) = self.undo.as_mut() {
            undo.record(&self.stream, pos, len)?;
        }
        self.stream.fill_at(pos, len, ERASED)
    }

    fn alloc_chunks(&mut self, len: u64) -> Result<u64> {
        let rounded = self.header.round_to_chunk(len);
        let ofs = self.alloc.find_free_aligned(rounded, self.header.chunk_size())?;
        if ofs + rounded > u32::MAX as u64 {
            return Err(FlashError::AddressOverflow {
                offset: ofs,
                length: rounded,
            });
        }
        Ok(ofs)
    }

    /// Write `data` zero padded to whole chunks.
    fn write_chunks(&mut self, data: &[u8]) -> Result<u32> {
        let ofs = self.alloc_chunks(data.len() as u64)?;
        let mut padded = data.to_vec();
        padded.resize(self.header.round_to_chunk(data.len() as u64) as usize, 0);
        self.put(ofs, &padded)?;
        Ok(ofs as u32)
    }

    fn free_chunks(&mut self, ofs: u64, len: u64) -> Result<()> {
        if ofs == 0 || len == 0 {
            return Ok(());
        }
        let rounded = self.header.round_to_chunk(len);
        self.alloc.mark_free(ofs, rounded)?;
        self.erase(ofs, rounded)
    }

    fn alloc_slot(&mut self) -> Result<u64> {
        let slot = match self.slots.first_free() {
            Some(slot) => slot,
            None => {
                self.add_dir_block()?;
                self.slots.first_free().ok_or_else(|| {
                    FlashError::format("new directory block has no free entries")
                })?
            }
        };
        self.slots.set(slot);
        Ok(self.slot_address(slot))
    }

    fn add_dir_block(&mut self) -> Result<()> {
        let bs = self.header.block_size();
        let ofs = self.alloc.find_free_aligned(bs, bs)?;
        if ofs + bs > u32::MAX as u64 {
            return Err(FlashError::AddressOverflow {
                offset: ofs,
                length: bs,
            });
        }
        self.put(ofs, &empty_dir_block(bs))?;
        if let Some(&prev) = self.dir_blocks.last() {
            self.put(prev + 4, &(ofs as u32).to_le_bytes())?;
        }
        tracing::debug!(
            "added dir block [{:#x} -> {:#x}]",
            self.dir_blocks.last().copied().unwrap_or(0),
            ofs
        );
        self.dir_blocks.push(ofs);
        self.slots.grow(self.header.entries_per_block());
        Ok(())
    }

    fn free_slot(&mut self, address: u64) -> Result<()> {
        let slot = self.slot_index(address)?;
        self.slots.clear(slot);
        self.erase(address, DIRENT_SIZE as u64)
    }

    fn store_name(&mut self, name: &str) -> Result<NameInfo> {
        let units = name.encode_utf16().count();
        match NameTier::for_len(units) {
            NameTier::Inline => Ok(NameInfo::inline(name)),
            NameTier::Entry => {
                let ptr = self.alloc_slot()?;
                self.put(ptr, &encode_name_record(name))?;
                Ok(NameInfo::in_entry(name, ptr as u32))
            }
            NameTier::Chunk => {
                let ptr = self.write_chunks(&crate::filesystem::encode_utf16le(name))?;
                Ok(NameInfo::in_chunk(name, ptr))
            }
        }
    }

    fn free_name(&mut self, info: &NameInfo) -> Result<()> {
        match info.tier() {
            NameTier::Inline => Ok(()),
            NameTier::Entry => self.free_slot(info.ptr as u64),
            NameTier::Chunk => self.free_chunks(info.ptr as u64, info.chunk_bytes()),
        }
    }

    fn free_data(&mut self, index_ptr: u32, index_size: u32) -> Result<()> {
        if index_ptr == 0 || index_size == 0 {
            return Ok(());
        }
        for p in self.read_index(index_ptr, index_size)? {
            self.free_chunks(p.ptr as u64, p.stored as u64)?;
        }
        self.free_chunks(index_ptr as u64, index_size as u64)
    }

    fn remove_node(&mut self, node: &FileNode) -> Result<()> {
        for sec in &node.sections {
            self.free_name(&sec.record.name)?;
            self.free_data(sec.record.index_ptr, sec.record.index_size)?;
            self.free_slot(sec.address)?;
        }
        self.free_name(&node.record.name)?;
        self.free_data(node.record.index_ptr, node.record.index_size)?;
        self.free_slot(node.address)?;
        self.files.remove(&NameKey::new(&node.name));
        Ok(())
    }

    /// Compress `data` piecewise and write the pieces plus their index table.
    fn write_data(&mut self, data: &[u8]) -> Result<(u32, u32, u64)> {
        let mut pieces = Vec::new();
        let mut stored_total = 0;
        for chunk in data.chunks(PIECE_SIZE) {
            let (stored, _) =
                compress_if_beneficial(self.codec.as_ref(), self.header.compression, chunk)?;
            let ptr = self.write_chunks(&stored)?;
            stored_total += stored.len() as u64;
            pieces.push(IndexPiece {
                stored: stored.len() as u16,
                full: chunk.len() as u16,
                ptr,
            });
        }
        if pieces.is_empty() {
            return Ok((0, 0, 0));
        }
        let index = encode_index(&pieces);
        let index_size = self.header.round_to_chunk(index.len() as u64) as u32;
        let index_ptr = self.write_chunks(&index)?;
        Ok((index_ptr, index_size, stored_total))
    }

    fn add_file(&mut self, name: &str, data: &[u8]) -> Result<()> {
        if let Some(existing) = self.files.get(&NameKey::new(name)).cloned() {
            tracing::debug!("replacing {}", existing.name);
            self.remove_node(&existing)?;
        }
        let (index_ptr, index_size, stored_size) = self.write_data(data)?;

        let address = self.alloc_slot()?;
        let name_info = self.store_name(name)?;
        let mut record = FileRecord::new(name_info, filetime_now());
        record.size = data.len() as u32;
        record.index_ptr = index_ptr;
        record.index_size = index_size;
        self.put(address, &record.encode())?;

        self.files.insert(
            NameKey::new(name),
            FileNode {
                address,
                name: name.to_string(),
                record,
                sections: Vec::new(),
                stored_size,
            },
        );
        Ok(())
    }

    fn rename_file(&mut self, mut node: FileNode, to: &str) -> Result<()> {
        let old = node.record.name.clone();
        let new_units = to.encode_utf16().count();
        let new_tier = NameTier::for_len(new_units);

        node.record.name = match (old.tier(), new_tier) {
            (NameTier::Entry, NameTier::Entry) => {
                self.put(old.ptr as u64, &encode_name_record(to))?;
                NameInfo::in_entry(to, old.ptr)
            }
            (NameTier::Chunk, NameTier::Chunk)
                if self.header.round_to_chunk(old.chunk_bytes())
                    == self.header.round_to_chunk(new_units as u64 * 2) =>
            {
                let mut raw = crate::filesystem::encode_utf16le(to);
                raw.resize(self.header.round_to_chunk(raw.len() as u64) as usize, 0);
                self.put(old.ptr as u64, &raw)?;
                NameInfo::in_chunk(to, old.ptr)
            }
            _ => {
                self.free_name(&old)?;
                self.store_name(to)?
            }
        };
        self.put(node.address, &node.record.encode())?;

        self.files.remove(&NameKey::new(&node.name));
        node.name = to.to_string();
        self.files.insert(NameKey::new(to), node);
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    let units = name.encode_utf16().count();
    if units == 0 || units >= 0x10000 || name.contains('\0') {
        return Err(FlashError::Unsupported(format!(
            "invalid imgfs name {:?}",
            name
        )));
    }
    Ok(())
}

fn empty_dir_block(block_size: u64) -> Vec<u8> {
    let mut block = vec![ERASED; block_size as usize];
    block[..4].copy_from_slice(&DIRBLOCK_MAGIC.to_le_bytes());
    block[4..8].copy_from_slice(&0u32.to_le_bytes());
    block
}

impl Filesystem for Imgfs {
    fn kind(&self) -> FsKind {
        FsKind::Imgfs
    }

    fn entries(&self) -> Vec<EntryInfo> {
        self.files.values().map(Self::info).collect()
    }

    fn stat(&self, name: &str) -> Result<EntryInfo> {
        self.node(name).map(Self::info)
    }

    fn contains(&self, name: &str) -> bool {
        self.files.contains_key(&NameKey::new(name))
    }

    fn extract(&self, name: &str) -> Result<Vec<u8>> {
        let node = self.node(name)?;
        if !node.record.is_module() {
            return self.read_data(
                node.record.index_ptr,
                node.record.index_size,
                node.record.size,
                node.address,
            );
        }
        let builder = self.builder.clone().ok_or_else(|| {
            FlashError::Unsupported(format!("{} is a module and no exe builder is set", name))
        })?;
        let header = self.module_header(name)?;
        let sections = self.module_sections(name)?;
        builder
            .reconstruct(&header.module_header(self.cpu_type), &sections)
            .map_err(|e| match e {
                FlashError::Reconstruction(_) => e,
                other => FlashError::Reconstruction(format!("{}: {}", name, other)),
            })
    }

    fn add(&mut self, name: &str, data: &mut dyn Read) -> Result<()> {
        validate_name(name)?;
        let mut buf = Vec::new();
        data.read_to_end(&mut buf)?;
        if buf.len() as u64 > u32::MAX as u64 {
            return Err(FlashError::AddressOverflow {
                offset: 0,
                length: buf.len() as u64,
            });
        }
        self.transact(|fs| fs.add_file(name, &buf))?;
        tracing::info!("imgfs: added {} ({} bytes)", name, buf.len());
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        validate_name(to)?;
        let node = self.node(from)?.clone();
        if NameKey::new(from) != NameKey::new(to) && self.contains(to) {
            return Err(FlashError::AlreadyExists(to.to_string()));
        }
        self.transact(|fs| fs.rename_file(node, to))?;
        tracing::info!("imgfs: renamed {} -> {}", from, to);
        Ok(())
    }

    fn delete(&mut self, name: &str) -> Result<()> {
        let node = self.node(name)?.clone();
        self.transact(|fs| fs.remove_node(&node))?;
        tracing::info!("imgfs: deleted {}", name);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        // records are written through immediately
        Ok(())
    }

    fn stats(&self) -> FsStats {
        let modules = self
            .files
            .values()
            .filter(|n| n.record.is_module())
            .count();
        FsStats {
            files: self.files.len() - modules,
            modules,
            used_bytes: self.alloc.used_bytes(),
            directory_blocks: self.dir_blocks.len(),
            entry_slots: self.slots.total(),
            used_slots: self.slots.used(),
        }
    }
}
