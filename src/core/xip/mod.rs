//! XIP region filesystem
//!
//! Everything in an XIP region is addressed by RVA. The stream handed to
//! [`Xip::open`] starts at the region, so stream offset `rva - rva_base`
//! holds the byte at `rva`. An [`AllocationMap`] over RVA space tracks the
//! jump block, ROM header, module and file lists, names, e32/o32 headers and
//! section or file data.
//!
//! Entries are stored as contiguous lists behind the ROM header. The first
//! mutation zeroes and frees that header; [`Filesystem::flush`] writes a new
//! one at a freshly allocated RVA and repoints the `ECEC` record.

pub mod entry;
pub mod header;

#[cfg(test)]
mod tests;

pub use entry::{FileEntry, TocEntry, XipEntry};
pub use header::{is_xip, RomHeader, XipLocation, ECEC_SIGNATURE};

use crate::allocator::{AllocationMap, OverlapPolicy};
use crate::compression::{compress_if_beneficial, expand_piece, Algorithm, SharedCodec};
use crate::error::{FlashError, Result};
use crate::filesystem::{
    filetime_now, filetime_to_datetime, round_up, EntryInfo, EntryKind, Filesystem, FsKind,
    FsStats, NameKey,
};
use crate::io::{SharedStream, UndoLog};
use crate::module::{E32Rom, ExeBuilder, RomExeHeader, SectionSource, O32_SIZE};
use crate::transform::RangeView;
use entry::{name_storage_len, ATTR_COMPRESSED, MAX_NAME_LEN};
use header::{COPY_ENTRY_LEN, ECEC_OFFSET, ECEC_RECORD_LEN, FIRST_BLOCK_LEN};
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

/// How to interpret an XIP region
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XipOptions {
    /// Forced RVA base for regions whose ECEC record has no header offset
    pub rva_base: Option<u32>,
    /// Older layout: e32 without timestamp and no reserved first block
    pub legacy_layout: bool,
    pub overlap_policy: OverlapPolicy,
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    entry: XipEntry,
    /// RVA of the list record, 0 until the next flush for new entries
    address: u32,
    /// e32/o32 of a module
    exe: Option<RomExeHeader>,
}

pub struct Xip {
    stream: SharedStream,
    location: XipLocation,
    header: RomHeader,
    codec: SharedCodec,
    builder: Option<Arc<dyn ExeBuilder>>,
    options: XipOptions,
    alloc: AllocationMap,
    files: BTreeMap<NameKey, Node>,
    /// The on-image header was cleared and must be rewritten
    header_cleared: bool,
    /// Prior bytes of the mutation in progress
    undo: Option<UndoLog>,
}

impl Xip {
    pub fn open(stream: SharedStream, codec: SharedCodec) -> Result<Self> {
        Self::open_with(stream, codec, XipOptions::default())
    }

    pub fn open_with(stream: SharedStream, codec: SharedCodec, options: XipOptions) -> Result<Self> {
        let location = XipLocation::read(&stream, options.rva_base)?;
        let mut alloc = AllocationMap::with_policy(options.overlap_policy)
            .with_floor(location.rva_base as u64);
        if options.legacy_layout {
            let ecec = location.rva_base as u64 + ECEC_OFFSET;
            alloc.mark_used(ecec, ECEC_RECORD_LEN, "ecec")?;
        } else {
            alloc.mark_used(location.rva_base as u64, FIRST_BLOCK_LEN, "firstblock")?;
        }

        let hdr_end = location.header_offset as u64 + RomHeader::LEN as u64;
        if hdr_end >= stream.size() {
            return Err(FlashError::format(format!(
                "invalid romhdr offset {:#x}",
                location.header_offset
            )));
        }
        let raw = stream.read_vec(location.header_offset as u64, RomHeader::LEN)?;
        let header = RomHeader::parse(&raw)?;
        tracing::debug!(
            "{:08x}: romhdr dll:{:08x}-{:08x}, phys:{:08x}-{:08x}, {} modules, {} files",
            location.header_rva,
            header.dll_first,
            header.dll_last,
            header.phys_first,
            header.phys_last,
            header.num_mods,
            header.num_files
        );

        let mut xip = Xip {
            stream,
            location,
            header,
            codec,
            builder: None,
            options,
            alloc,
            files: BTreeMap::new(),
            header_cleared: false,
            undo: None,
        };
        if location.header_offset as u64 + xip.table_len() > xip.stream.size() {
            return Err(FlashError::format(format!(
                "xip lists of {} modules and {} files run past the region",
                xip.header.num_mods, xip.header.num_files
            )));
        }
        xip.alloc
            .mark_used(location.header_rva as u64, RomHeader::LEN as u64, "romhdr")?;
        xip.alloc.mark_used(
            xip.header.copy_offset as u64,
            xip.header.copy_entries as u64 * COPY_ENTRY_LEN,
            "copylist",
        )?;
        let mod_list = xip.module_list_rva();
        xip.alloc.mark_used(
            mod_list,
            xip.header.num_mods as u64 * TocEntry::LEN as u64,
            "modlist",
        )?;
        xip.alloc.mark_used(
            xip.file_list_rva(),
            xip.header.num_files as u64 * FileEntry::LEN as u64,
            "filelist",
        )?;
        xip.load_entries()?;

        tracing::info!(
            "xip at rva {:08x}: {} modules, {} files",
            xip.location.rva_base,
            xip.header.num_mods,
            xip.header.num_files
        );
        Ok(xip)
    }

    pub fn header(&self) -> &RomHeader {
        &self.header
    }

    pub fn location(&self) -> XipLocation {
        self.location
    }

    pub fn rva_base(&self) -> u32 {
        self.location.rva_base
    }

    pub fn cpu_type(&self) -> u16 {
        self.header.cpu_type
    }

    pub fn allocation_map(&self) -> &AllocationMap {
        &self.alloc
    }

    pub fn stream(&self) -> &SharedStream {
        &self.stream
    }

    pub fn set_exe_builder(&mut self, builder: Arc<dyn ExeBuilder>) {
        self.builder = Some(builder);
    }

    fn module_list_rva(&self) -> u64 {
        self.location.header_rva as u64 + RomHeader::LEN as u64
    }

    fn file_list_rva(&self) -> u64 {
        self.module_list_rva() + self.header.num_mods as u64 * TocEntry::LEN as u64
    }

    fn table_len(&self) -> u64 {
        RomHeader::LEN as u64
            + self.header.num_mods as u64 * TocEntry::LEN as u64
            + self.header.num_files as u64 * FileEntry::LEN as u64
    }

    fn offset_of(&self, rva: u64) -> Result<u64> {
        rva.checked_sub(self.location.rva_base as u64)
            .ok_or(FlashError::OutOfRange {
                pos: rva,
                limit: self.location.rva_base as u64,
            })
    }

    fn read_rva(&self, rva: u64, len: usize) -> Result<Vec<u8>> {
        self.stream.read_vec(self.offset_of(rva)?, len)
    }

    /// Save the bytes about to be overwritten by the current mutation.
    fn record_undo(&mut self, pos: u64, len: u64) -> Result<()> {
        match self.undo.as_mut() {
            Some(undo) => undo.record(&self.stream, pos, len),
            None => Ok(()),
        }
    }

    fn write_at(&mut self, pos: u64, data: &[u8]) -> Result<()> {
        self.record_undo(pos, data.len() as u64)?;
        self.stream.write_at(pos, data)
    }

    fn write_rva(&mut self, rva: u64, data: &[u8]) -> Result<()> {
        let pos = self.offset_of(rva)?;
        self.write_at(pos, data)
    }

    fn zero_rva(&mut self, rva: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let pos = self.offset_of(rva)?;
        self.record_undo(pos, len)?;
        self.stream.fill_at(pos, len, 0)
    }

    fn read_name(&self, rva: u32) -> Result<String> {
        if rva == 0 {
            return Ok(String::new());
        }
        let raw = self.stream.read_upto(self.offset_of(rva as u64)?, MAX_NAME_LEN)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    fn load_entries(&mut self) -> Result<()> {
        let list_len = self.table_len() - RomHeader::LEN as u64;
        let raw = self.read_rva(self.module_list_rva(), list_len as usize)?;
        let (mods, files) = raw.split_at(self.header.num_mods as usize * TocEntry::LEN);

        for (i, rec) in mods.chunks_exact(TocEntry::LEN).enumerate() {
            let address = (self.module_list_rva() + (i * TocEntry::LEN) as u64) as u32;
            let toc = TocEntry::parse(rec);
            let name = self.read_name(toc.name_rva)?;
            let exe = self.read_exe_header(&toc)?;
            self.mark_module(&name, &toc, &exe)?;
            self.insert_loaded(Node {
                name,
                entry: XipEntry::Module(toc),
                address,
                exe: Some(exe),
            });
        }
        for (i, rec) in files.chunks_exact(FileEntry::LEN).enumerate() {
            let address = (self.file_list_rva() + (i * FileEntry::LEN) as u64) as u32;
            let file = FileEntry::parse(rec);
            let name = self.read_name(file.name_rva)?;
            self.alloc
                .mark_used(file.name_rva as u64, name_storage_len(&name), "filename")?;
            self.alloc.mark_used(
                file.load_rva as u64,
                round_up(file.compressed_size as u64, 4),
                "filedata",
            )?;
            self.insert_loaded(Node {
                name,
                entry: XipEntry::File(file),
                address,
                exe: None,
            });
        }
        Ok(())
    }

    fn insert_loaded(&mut self, node: Node) {
        let key = NameKey::new(&node.name);
        if self.files.contains_key(&key) {
            tracing::warn!("duplicate name: {}", node.name);
            return;
        }
        self.files.insert(key, node);
    }

    fn read_exe_header(&self, toc: &TocEntry) -> Result<RomExeHeader> {
        let legacy = self.options.legacy_layout;
        let e32_raw = self.read_rva(toc.e32_rva as u64, E32Rom::size(legacy))?;
        let e32 = E32Rom::parse(&e32_raw, legacy)?;
        let o32_raw = self.read_rva(toc.o32_rva as u64, e32.object_count as usize * O32_SIZE)?;
        RomExeHeader::with_objects(e32, &o32_raw)
    }

    fn mark_module(&mut self, name: &str, toc: &TocEntry, exe: &RomExeHeader) -> Result<()> {
        let legacy = self.options.legacy_layout;
        self.alloc
            .mark_used(toc.name_rva as u64, name_storage_len(name), "modname")?;
        self.alloc
            .mark_used(toc.e32_rva as u64, E32Rom::size(legacy) as u64, "e32hdr")?;
        self.alloc.mark_used(
            toc.o32_rva as u64,
            (exe.o32.len() * O32_SIZE) as u64,
            "o32hdr",
        )?;
        for o32 in &exe.o32 {
            self.alloc.mark_used(
                o32.dataptr as u64,
                round_up(o32.data_size() as u64, 4),
                "objdata",
            )?;
        }
        Ok(())
    }

    fn node(&self, name: &str) -> Result<&Node> {
        self.files
            .get(&NameKey::new(name))
            .ok_or_else(|| FlashError::NotFound(name.to_string()))
    }

    fn info(node: &Node) -> EntryInfo {
        let (kind, stored_size) = match &node.entry {
            XipEntry::Module(_) => (
                EntryKind::Module,
                node.exe
                    .as_ref()
                    .map(|exe| exe.o32.iter().map(|o| o.data_size() as u64).sum::<u64>())
                    .unwrap_or(0),
            ),
            XipEntry::File(f) => (EntryKind::File, f.compressed_size as u64),
        };
        EntryInfo {
            name: node.name.clone(),
            kind,
            size: node.entry.size() as u64,
            stored_size,
            attributes: node.entry.attributes(),
            modified: filetime_to_datetime(node.entry.filetime()),
            address: node.address as u64,
        }
    }

    /// Section data of a module, compressed sections expanded.
    pub fn module_sections(&self, name: &str) -> Result<Vec<SectionSource>> {
        let node = self.node(name)?;
        let exe = node
            .exe
            .as_ref()
            .ok_or_else(|| FlashError::Unsupported(format!("{} is not a module", name)))?;
        let mut sections = Vec::with_capacity(exe.o32.len());
        for (i, o32) in exe.o32.iter().enumerate() {
            let ofs = self.offset_of(o32.dataptr as u64)?;
            let stored = o32.data_size() as u64;
            let reader = if o32.is_compressed() {
                let comp = self.stream.read_vec(ofs, stored as usize)?;
                let full = expand_piece(
                    self.codec.as_ref(),
                    Algorithm::Rom4,
                    &comp,
                    o32.vsize as usize,
                    o32.dataptr as u64,
                )?;
                SharedStream::new(crate::io::MemoryStore::read_only(full))
            } else {
                SharedStream::new(RangeView::new(self.stream.clone(), ofs, stored)?)
            };
            sections.push(SectionSource {
                name: format!("S{:03}", i),
                size: reader.size(),
                reader,
            });
        }
        Ok(sections)
    }

    /// Zero and free the ROM header and entry lists once per flush cycle.
    fn clear_rom_header(&mut self) -> Result<()> {
        if self.header_cleared {
            return Ok(());
        }
        let rva = self.location.header_rva as u64;
        let len = self.table_len();
        self.alloc.mark_free(rva, len)?;
        self.zero_rva(rva, len)?;
        self.header_cleared = true;
        tracing::debug!("xip: cleared romhdr at {:08x}", rva);
        Ok(())
    }

    fn transact<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let alloc = self.alloc.clone();
        let files = self.files.clone();
        let (header, location) = (self.header.clone(), self.location);
        self.undo = Some(UndoLog::begin(&self.stream));
        let result = op(self);
        let undo = self.undo.take();
        match result {
            Ok(v) => Ok(v),
            Err(e) => {
                tracing::warn!("xip mutation rolled back: {}", e);
                if let Some(undo) = undo {
                    if let Err(re) = undo.rollback(&self.stream) {
                        tracing::warn!("xip: restoring overwritten bytes failed: {}", re);
                    }
                }
                self.alloc = alloc;
                self.files = files;
                self.header = header;
                self.location = location;
                Err(e)
            }
        }
    }

    fn store_name(&mut self, name: &str) -> Result<u32> {
        let len = name_storage_len(name);
        let rva = self.alloc.find_free(len)?;
        let mut raw = name.as_bytes().to_vec();
        raw.resize(len as usize, 0);
        self.write_rva(rva, &raw)?;
        Ok(rva as u32)
    }

    fn free_name(&mut self, rva: u32, name: &str) -> Result<()> {
        if rva == 0 {
            return Ok(());
        }
        let len = name_storage_len(name);
        self.alloc.mark_free(rva as u64, len)?;
        self.zero_rva(rva as u64, len)
    }

    fn free_region(&mut self, rva: u64, len: u64) -> Result<()> {
        self.alloc.mark_free(rva, len)?;
        self.zero_rva(rva, len)
    }

    fn remove_node(&mut self, node: &Node) -> Result<()> {
        self.free_name(node.entry.name_rva(), &node.name)?;
        match &node.entry {
            XipEntry::File(f) => {
                self.free_region(f.load_rva as u64, round_up(f.compressed_size as u64, 4))?;
            }
            XipEntry::Module(toc) => {
                let legacy = self.options.legacy_layout;
                self.free_region(toc.e32_rva as u64, E32Rom::size(legacy) as u64)?;
                if let Some(exe) = &node.exe {
                    self.free_region(toc.o32_rva as u64, (exe.o32.len() * O32_SIZE) as u64)?;
                    for o32 in &exe.o32 {
                        self.free_region(o32.dataptr as u64, round_up(o32.data_size() as u64, 4))?;
                    }
                }
            }
        }
        self.files.remove(&NameKey::new(&node.name));
        Ok(())
    }

    fn add_file(&mut self, name: &str, data: &[u8]) -> Result<()> {
        if let Some(existing) = self.files.get(&NameKey::new(name)).cloned() {
            tracing::debug!("replacing {}", existing.name);
            self.remove_node(&existing)?;
        }
        let mut file = FileEntry::new(filetime_now());
        file.name_rva = self.store_name(name)?;

        let (stored, compressed) =
            compress_if_beneficial(self.codec.as_ref(), Algorithm::Rom4, data)?;
        if compressed {
            file.attributes |= ATTR_COMPRESSED;
        }
        file.size = data.len() as u32;
        file.compressed_size = stored.len() as u32;

        let padded_len = round_up(stored.len() as u64, 4);
        let rva = self.alloc.find_free(padded_len)?;
        let mut padded = stored;
        padded.resize(padded_len as usize, 0);
        self.write_rva(rva, &padded)?;
        file.load_rva = rva as u32;

        self.files.insert(
            NameKey::new(name),
            Node {
                name: name.to_string(),
                entry: XipEntry::File(file),
                address: 0,
                exe: None,
            },
        );
        Ok(())
    }

    fn rename_node(&mut self, mut node: Node, to: &str) -> Result<()> {
        self.free_name(node.entry.name_rva(), &node.name)?;
        let rva = self.store_name(to)?;
        node.entry.set_name_rva(rva);
        self.files.remove(&NameKey::new(&node.name));
        node.name = to.to_string();
        self.files.insert(NameKey::new(to), node);
        Ok(())
    }

    /// Write the ROM header, module list and file list to a fresh RVA.
    fn write_rom_header(&mut self) -> Result<()> {
        let (mods, files): (Vec<&Node>, Vec<&Node>) =
            self.files.values().partition(|n| n.entry.is_module());
        let mut header = self.header.clone();
        header.num_mods = mods.len() as u32;
        header.num_files = files.len() as u32;

        let mut table = header.encode().to_vec();
        for node in mods.iter().chain(files.iter()) {
            table.extend(node.entry.encode());
        }

        let order: Vec<NameKey> = mods
            .iter()
            .chain(files.iter())
            .map(|n| NameKey::new(&n.name))
            .collect();
        let table_rva = self.alloc.find_free(table.len() as u64)?;
        let offset = u32::try_from(self.offset_of(table_rva)?).map_err(|_| {
            FlashError::AddressOverflow {
                offset: table_rva,
                length: table.len() as u64,
            }
        })?;
        self.write_rva(table_rva, &table)?;
        let rva = table_rva as u32;
        let mut pointer = [0u8; 8];
        pointer[..4].copy_from_slice(&rva.to_le_bytes());
        pointer[4..].copy_from_slice(&offset.to_le_bytes());
        self.write_at(ECEC_OFFSET + 4, &pointer)?;

        let mut address = rva as u64 + RomHeader::LEN as u64;
        for key in order {
            if let Some(node) = self.files.get_mut(&key) {
                node.address = address as u32;
                let len = if node.entry.is_module() {
                    TocEntry::LEN
                } else {
                    FileEntry::LEN
                };
                address += len as u64;
            }
        }

        tracing::info!(
            "xip: wrote romhdr at {:08x} ({} modules, {} files)",
            rva,
            header.num_mods,
            header.num_files
        );
        self.header = header;
        self.location.header_rva = rva;
        self.location.header_offset = offset;
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() >= MAX_NAME_LEN || name.contains('\0') || !name.is_ascii() {
        return Err(FlashError::Unsupported(format!("invalid xip name {:?}", name)));
    }
    Ok(())
}

impl Filesystem for Xip {
    fn kind(&self) -> FsKind {
        FsKind::Xip
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
        match &node.entry {
            XipEntry::File(f) => {
                let stored = self.read_rva(f.load_rva as u64, f.compressed_size as usize)?;
                expand_piece(
                    self.codec.as_ref(),
                    Algorithm::Rom4,
                    &stored,
                    f.size as usize,
                    f.load_rva as u64,
                )
            }
            XipEntry::Module(_) => {
                let builder = self.builder.clone().ok_or_else(|| {
                    FlashError::Unsupported(format!(
                        "{} is a module and no exe builder is set",
                        name
                    ))
                })?;
                let header = node.exe.as_ref().ok_or_else(|| {
                    FlashError::Reconstruction(format!("{}: missing e32 header", name))
                })?;
                let sections = self.module_sections(name)?;
                builder
                    .reconstruct(&header.module_header(self.header.cpu_type), &sections)
                    .map_err(|e| match e {
                        FlashError::Reconstruction(_) => e,
                        other => FlashError::Reconstruction(format!("{}: {}", name, other)),
                    })
            }
        }
    }

    fn add(&mut self, name: &str, data: &mut dyn Read) -> Result<()> {
        validate_name(name)?;
        if self
            .files
            .get(&NameKey::new(name))
            .map_or(false, |n| n.entry.is_module())
        {
            return Err(FlashError::Unsupported(format!(
                "{} is a module; module import is not supported",
                name
            )));
        }
        let mut buf = Vec::new();
        data.read_to_end(&mut buf)?;
        if buf.len() as u64 > u32::MAX as u64 {
            return Err(FlashError::AddressOverflow {
                offset: 0,
                length: buf.len() as u64,
            });
        }
        self.clear_rom_header()?;
        self.transact(|xip| xip.add_file(name, &buf))?;
        tracing::info!("xip: added {} ({} bytes)", name, buf.len());
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        validate_name(to)?;
        let node = self.node(from)?.clone();
        if NameKey::new(from) != NameKey::new(to) && self.contains(to) {
            return Err(FlashError::AlreadyExists(to.to_string()));
        }
        self.clear_rom_header()?;
        self.transact(|xip| xip.rename_node(node, to))?;
        tracing::info!("xip: renamed {} -> {}", from, to);
        Ok(())
    }

    fn delete(&mut self, name: &str) -> Result<()> {
        let node = self.node(name)?.clone();
        self.clear_rom_header()?;
        self.transact(|xip| xip.remove_node(&node))?;
        tracing::info!("xip: deleted {}", name);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.header_cleared {
            return Ok(());
        }
        self.transact(|xip| xip.write_rom_header())?;
        self.header_cleared = false;
        Ok(())
    }

    fn stats(&self) -> FsStats {
        let modules = self.files.values().filter(|n| n.entry.is_module()).count();
        FsStats {
            files: self.files.len() - modules,
            modules,
            used_bytes: self.alloc.used_bytes(),
            directory_blocks: 0,
            entry_slots: self.files.len(),
            used_slots: self.files.len(),
        }
    }
}

impl Drop for Xip {
    fn drop(&mut self) {
        if self.header_cleared {
            if let Err(e) = self.flush() {
                tracing::warn!("xip: romhdr rewrite on drop failed: {}", e);
            }
        }
    }
}
