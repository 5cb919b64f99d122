//! Sector-tag flash translation layer ("FFFBFFFD")
//!
//! The physical store is a sequence of slots, each `block_size` data bytes
//! followed by an 8-byte `(block_number, tag)` trailer. Runs of slots with
//! consecutive block numbers and the same tag form an *area*; the logical
//! position of block `n` is `n * block_size`.
//!
//! Capacity of the areas is taken from the partition table stored in block 0,
//! so writes past an area's used extent can claim new slots up to the end
//! of the partition.

use crate::error::{FlashError, Result};
use crate::io::{put_u32, SharedStream, Stream};
use crate::partition::PartitionTable;
use serde::Serialize;
use std::collections::BTreeMap;

pub const SECTOR_TAG_MAGIC: u32 = 0xfffb_fffd;
const TRAILER_LEN: u64 = 8;
const ERASED: u32 = 0xffff_ffff;

/// True when a slot trailer carries a usable block number.
pub fn has_block_number(seq: u32, tag: u32) -> bool {
    if seq == ERASED {
        return false;
    }
    seq != 0 || (tag != ERASED && tag != 0)
}

/// Detect the slot data size from the trailers in the first 0x1000 bytes.
///
/// Returns 0x200, 0x400 or 0x800, or `None` when the store is not
/// sector-tagged.
pub fn find_block_size(store: &SharedStream, offset: u64) -> Option<u32> {
    let mut seq = Vec::with_capacity(18);
    let mut magic = Vec::with_capacity(18);
    for at in (0..=0x1000u64).step_by(0x200) {
        let raw = store.read_upto(offset + at, 16).ok()?;
        if raw.len() < 16 {
            return None;
        }
        for pair in raw.chunks_exact(8) {
            seq.push(u32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]));
            magic.push(u32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]));
        }
    }
    let tagged = |i: usize, n: u32| seq[i] == n && magic[i] == SECTOR_TAG_MAGIC;

    if tagged(2, 0) {
        return tagged(5, 1).then_some(0x200);
    }
    if tagged(4, 0) {
        return tagged(9, 1).then_some(0x400);
    }
    if tagged(8, 0) {
        return tagged(17, 1).then_some(0x800);
    }
    // erased layout whose block numbers start far into the store
    let erased = |i: usize| seq[i] == ERASED && magic[i] == ERASED;
    (erased(8) && erased(17)).then_some(0x800)
}

/// Run of contiguous slots
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagArea {
    pub file_offset: u64,
    /// Block number of the first slot; the raw trailer value for unnumbered runs
    pub first_block: u32,
    pub tag: u32,
    pub used_blocks: u32,
    /// Blocks this area may grow to, from the partition table
    pub capacity: u32,
    pub numbered: bool,
}

impl TagArea {
    /// Block number one past the last used slot
    pub fn end_block(&self) -> u64 {
        self.first_block as u64 + self.used_blocks as u64
    }
}

pub struct SectorTagView {
    inner: SharedStream,
    block_size: u32,
    /// All areas in file order
    areas: Vec<TagArea>,
    /// first block number -> index into `areas`, numbered areas only
    by_block: BTreeMap<u32, usize>,
    pos: u64,
}

impl SectorTagView {
    pub fn open(inner: SharedStream, block_size: u32) -> Result<Self> {
        if !block_size.is_power_of_two() {
            return Err(FlashError::format(format!(
                "sector-tag block size {:#x} not a power of two",
                block_size
            )));
        }
        let mut view = SectorTagView {
            inner,
            block_size,
            areas: Vec::new(),
            by_block: BTreeMap::new(),
            pos: 0,
        };
        view.scan()?;
        view.apply_partitions()?;
        tracing::info!(
            "sector-tag store: block size {:#x}, {} areas",
            block_size,
            view.areas.len()
        );
        Ok(view)
    }

    fn slot_len(&self) -> u64 {
        self.block_size as u64 + TRAILER_LEN
    }

    fn scan(&mut self) -> Result<()> {
        let slot = self.slot_len();
        let size = self.inner.size();
        let mut current: Option<TagArea> = None;
        let mut ofs = 0u64;
        while ofs + slot <= size {
            let trailer = self.inner.read_vec(ofs + self.block_size as u64, 8)?;
            let seq = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
            let tag = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]);
            let numbered = has_block_number(seq, tag);

            let extends = current.as_ref().map_or(false, |a| {
                a.tag == tag
                    && if numbered {
                        a.numbered && a.end_block() == seq as u64
                    } else {
                        !a.numbered && a.first_block == seq
                    }
            });
            if extends {
                if let Some(a) = current.as_mut() {
                    a.used_blocks += 1;
                }
            } else {
                if let Some(a) = current.take() {
                    self.register(a);
                }
                current = Some(TagArea {
                    file_offset: ofs,
                    first_block: seq,
                    tag,
                    used_blocks: 1,
                    capacity: 0,
                    numbered,
                });
            }
            ofs += slot;
        }
        if let Some(a) = current {
            self.register(a);
        }
        Ok(())
    }

    fn register(&mut self, mut area: TagArea) {
        area.capacity = area.used_blocks;
        if area.numbered {
            self.by_block.insert(area.first_block, self.areas.len());
        }
        tracing::debug!(
            "area at {:#x}: blocks {:#x}+{:#x} tag {:#x}",
            area.file_offset,
            area.first_block,
            area.used_blocks,
            area.tag
        );
        self.areas.push(area);
    }

    fn area_for_block(&self, block: u32) -> Option<usize> {
        self.by_block
            .range(..=block)
            .next_back()
            .map(|(_, &idx)| idx)
    }

    /// Derive area capacities from the partition table in block 0.
    fn apply_partitions(&mut self) -> Result<()> {
        let Some(&a0) = self.by_block.get(&0) else {
            tracing::debug!("sector-tag store has no block 0, capacities stay at used extent");
            return Ok(());
        };
        let sector = self.inner.read_upto(self.areas[a0].file_offset, 512)?;
        let table = match PartitionTable::parse(&sector, self.block_size as u64) {
            Ok(t) => t,
            Err(_) => {
                tracing::debug!("block 0 holds no partition table");
                return Ok(());
            }
        };

        // the last entry never bounds a tagged area
        for entry in table.entries().iter().take(3).filter(|e| !e.is_empty()) {
            let block = if entry.index == 0 {
                0
            } else {
                entry.start_sector
            };
            let Some(idx) = self.area_for_block(block) else {
                continue;
            };
            let area = &mut self.areas[idx];
            if block as u64 >= area.end_block() {
                tracing::debug!("partition block {:#x} not inside an area", block);
                continue;
            }
            let extra = if entry.index == 0 { 2 } else { 0 };
            let capacity = (entry.sector_count as u64 + extra + block as u64)
                .saturating_sub(area.first_block as u64);
            area.capacity = u32::try_from(capacity)
                .unwrap_or(u32::MAX)
                .max(area.capacity);
        }
        Ok(())
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn areas(&self) -> &[TagArea] {
        &self.areas
    }

    fn slot_offset(&self, area: &TagArea, block: u32) -> u64 {
        area.file_offset + (block - area.first_block) as u64 * self.slot_len()
    }

    /// Physical offset of logical `pos`. Reads of unclaimed blocks yield `None`;
    /// writes claim the missing slots up to the area's capacity.
    fn physical(&mut self, pos: u64, claim: bool) -> Result<Option<u64>> {
        let bs = self.block_size as u64;
        let block = u32::try_from(pos / bs).map_err(|_| FlashError::AddressOverflow {
            offset: pos,
            length: bs,
        })?;
        let within = pos % bs;
        let Some(idx) = self.area_for_block(block) else {
            return if claim {
                Err(FlashError::OutOfRange {
                    pos,
                    limit: self.size(),
                })
            } else {
                Ok(None)
            };
        };

        let area = self.areas[idx].clone();
        let rel = block - area.first_block;
        if rel < area.used_blocks {
            return Ok(Some(self.slot_offset(&area, block) + within));
        }
        if !claim {
            return Ok(None);
        }
        if rel >= area.capacity {
            return Err(FlashError::AreaFull {
                block: block as u64,
                area_start: area.first_block as u64,
            });
        }
        if self.inner.is_read_only() {
            return Err(FlashError::ReadOnlyViolation);
        }
        // claimed slots must not run into the next numbered area
        let last_slot = self.slot_offset(&area, block);
        let collides = self.areas.iter().any(|a| {
            a.numbered && a.file_offset > area.file_offset && a.file_offset <= last_slot
        });
        if collides {
            return Err(FlashError::AreaFull {
                block: block as u64,
                area_start: area.first_block as u64,
            });
        }

        let mut trailer = [0u8; 8];
        for b in area.end_block()..=block as u64 {
            put_u32(&mut trailer, 0, b as u32);
            put_u32(&mut trailer, 4, area.tag);
            self.inner
                .write_at(self.slot_offset(&area, b as u32) + bs, &trailer)?;
        }
        tracing::debug!(
            "claimed blocks {:#x}..={:#x} in area {:#x}",
            area.end_block(),
            block,
            area.first_block
        );
        self.areas[idx].used_blocks = rel + 1;
        Ok(Some(last_slot + within))
    }
}

impl Stream for SectorTagView {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let size = self.size();
        let bs = self.block_size as u64;
        let mut done = 0;
        while done < buf.len() && self.pos < size {
            let within = self.pos % bs;
            let n = (buf.len() - done)
                .min((bs - within) as usize)
                .min((size - self.pos) as usize);
            match self.physical(self.pos, false)? {
                Some(real) => {
                    let got = self.inner.read_at(real, &mut buf[done..done + n])?;
                    done += got;
                    self.pos += got as u64;
                    if got < n {
                        break;
                    }
                }
                None => {
                    buf[done..done + n].fill(0);
                    done += n;
                    self.pos += n as u64;
                }
            }
        }
        Ok(done)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let bs = self.block_size as u64;
        let mut done = 0;
        while done < buf.len() {
            let within = self.pos % bs;
            let n = (buf.len() - done).min((bs - within) as usize);
            let real = self
                .physical(self.pos, true)?
                .ok_or(FlashError::OutOfRange {
                    pos: self.pos,
                    limit: self.size(),
                })?;
            self.inner.write_at(real, &buf[done..done + n])?;
            done += n;
            self.pos += n as u64;
        }
        Ok(())
    }

    fn set_pos(&mut self, pos: u64) -> Result<()> {
        self.pos = pos;
        Ok(())
    }

    fn pos(&self) -> u64 {
        self.pos
    }

    fn truncate(&mut self, _len: u64) -> Result<()> {
        Err(FlashError::Unsupported(
            "truncating a sector-tag store".to_string(),
        ))
    }

    fn size(&self) -> u64 {
        let bs = self.block_size as u64;
        let slot = self.slot_len();
        let raw = self.inner.size();
        match self.by_block.iter().next_back() {
            None => (raw / slot) * bs,
            Some((_, &idx)) => {
                let last = &self.areas[idx];
                let end_block = raw.saturating_sub(last.file_offset) / slot + last.first_block as u64;
                end_block.max(last.first_block as u64 + last.capacity as u64) * bs
            }
        }
    }

    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }
}
