//! Checksummed block chain ("B000FF")
//!
//! **Layout**:
//! ```text
//! 0x00  "B000FF\n"
//! 0x07  image_start  u32
//! 0x0b  image_length u32
//! 0x0f  records: { address u32, length u32, checksum u32, data[length] }*
//!       terminator: { 0, entry_point, 0 }
//! ```
//!
//! The record table is discovered by scanning at open. The view exposes the
//! image as a flat stream whose position 0 is `image_start`; bytes not
//! covered by any record read as zero. Checksums are the byte sum of a
//! record's data and are recomputed at flush for every record written to.

use crate::error::{FlashError, Result};
use crate::io::{le_u32, put_u32, SharedStream, Stream};
use serde::Serialize;
use std::collections::BTreeMap;

pub const BLOCK_CHAIN_TAG: &[u8; 7] = b"B000FF\n";
const HEADER_LEN: u64 = 15;
const RECORD_LEN: u64 = 12;

/// Check for the 7-byte block-chain tag at `offset`.
pub fn is_block_chain(store: &SharedStream, offset: u64) -> bool {
    let mut tag = [0u8; 7];
    matches!(store.read_at(offset, &mut tag), Ok(7)) && &tag == BLOCK_CHAIN_TAG
}

/// Wrapping byte sum used as block checksum
pub fn byte_sum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
}

#[derive(Debug, Clone, Copy)]
struct ChainBlock {
    /// Physical offset of the record's data
    data_ofs: u64,
    address: u32,
    length: u32,
    modified: bool,
}

impl ChainBlock {
    fn end(&self) -> u64 {
        self.address as u64 + self.length as u64
    }
}

/// Block whose stored checksum disagrees with its data
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecksumMismatch {
    pub address: u32,
    pub stored: u32,
    pub computed: u32,
}

pub struct BlockChainView {
    inner: SharedStream,
    image_start: u32,
    image_length: u32,
    /// address -> block
    blocks: BTreeMap<u32, ChainBlock>,
    block_size: u32,
    entry_point: u32,
    /// Physical offset of the terminator record
    append_pos: u64,
    extended: bool,
    pos: u64,
}

impl BlockChainView {
    pub fn open(inner: SharedStream) -> Result<Self> {
        let mut header = [0u8; HEADER_LEN as usize];
        if inner.read_at(0, &mut header)? < header.len() || &header[..7] != BLOCK_CHAIN_TAG {
            return Err(FlashError::format("missing B000FF tag"));
        }
        let image_start = le_u32(&header, 7);
        let image_length = le_u32(&header, 11);

        let size = inner.size();
        let mut blocks = BTreeMap::new();
        let mut pos = HEADER_LEN;
        let mut entry_point = 0;
        let mut terminated = false;

        while pos + RECORD_LEN <= size {
            let rec = inner.read_vec(pos, RECORD_LEN as usize)?;
            let address = le_u32(&rec, 0);
            let length = le_u32(&rec, 4);
            let checksum = le_u32(&rec, 8);

            if address == 0 && checksum == 0 && !blocks.is_empty() {
                entry_point = length;
                terminated = true;
                break;
            }
            if address < image_start {
                return Err(FlashError::format(format!(
                    "block {:#x} below image start {:#x}",
                    address, image_start
                )));
            }
            let data_ofs = pos + RECORD_LEN;
            if data_ofs + length as u64 > size {
                tracing::warn!(
                    "B000FF block {:#x} truncated at {:#x}, ignoring rest of chain",
                    address,
                    pos
                );
                break;
            }
            blocks.insert(
                address,
                ChainBlock {
                    data_ofs,
                    address,
                    length,
                    modified: false,
                },
            );
            pos = data_ofs + length as u64;
        }

        if blocks.is_empty() {
            return Err(FlashError::format("B000FF container without blocks"));
        }
        if !terminated {
            tracing::debug!("B000FF chain ends without terminator at {:#x}", pos);
        }

        let block_size = most_common_length(blocks.values().map(|b| b.length));
        tracing::info!(
            "B000FF: {} blocks of {:#x}, image {:#x}+{:#x}, entry {:#x}",
            blocks.len(),
            block_size,
            image_start,
            image_length,
            entry_point
        );

        Ok(BlockChainView {
            inner,
            image_start,
            image_length,
            blocks,
            block_size,
            entry_point,
            append_pos: pos,
            extended: false,
            pos: 0,
        })
    }

    pub fn image_start(&self) -> u32 {
        self.image_start
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn entry_point(&self) -> u32 {
        self.entry_point
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// `(address, length)` of every record in address order
    pub fn blocks(&self) -> Vec<(u32, u32)> {
        self.blocks.values().map(|b| (b.address, b.length)).collect()
    }

    /// Compare every stored checksum with the data it covers.
    pub fn verify(&self) -> Result<Vec<ChecksumMismatch>> {
        let mut bad = Vec::new();
        for b in self.blocks.values() {
            let stored = self.inner.read_u32_at(b.data_ofs - 4)?;
            let computed = byte_sum(&self.inner.read_vec(b.data_ofs, b.length as usize)?);
            if stored != computed {
                tracing::warn!(
                    "B000FF checksum mismatch in block {:#x}: stored {:#x}, computed {:#x}",
                    b.address,
                    stored,
                    computed
                );
                bad.push(ChecksumMismatch {
                    address: b.address,
                    stored,
                    computed,
                });
            }
        }
        Ok(bad)
    }

    fn address_of(&self, pos: u64) -> Result<u64> {
        let addr = self.image_start as u64 + pos;
        if addr > u32::MAX as u64 {
            return Err(FlashError::AddressOverflow {
                offset: self.image_start as u64,
                length: pos,
            });
        }
        Ok(addr)
    }

    fn block_containing(&self, addr: u64) -> Option<ChainBlock> {
        self.blocks
            .range(..=(addr as u32))
            .next_back()
            .map(|(_, b)| *b)
            .filter(|b| addr < b.end())
    }

    fn next_block_start(&self, addr: u64) -> Option<u64> {
        self.blocks
            .range((addr as u32).saturating_add(1)..)
            .next()
            .map(|(&a, _)| a as u64)
            .filter(|&a| a > addr)
    }

    /// Append a fresh record covering `addr`, aligned to the common block size
    /// relative to the end of the preceding block.
    fn allocate_block(&mut self, addr: u64) -> Result<ChainBlock> {
        let prev_end = self
            .blocks
            .range(..=(addr as u32))
            .next_back()
            .map_or(self.image_start as u64, |(_, b)| b.end());
        let bs = self.block_size.max(1) as u64;
        let start = prev_end + ((addr - prev_end) / bs) * bs;
        let mut length = bs;
        if let Some(next) = self.next_block_start(start) {
            length = length.min(next - start);
        }
        if start + length > u32::MAX as u64 + 1 {
            return Err(FlashError::AddressOverflow {
                offset: start,
                length,
            });
        }

        let mut record = vec![0u8; (RECORD_LEN + length) as usize];
        put_u32(&mut record, 0, start as u32);
        put_u32(&mut record, 4, length as u32);
        self.inner.write_at(self.append_pos, &record)?;

        let block = ChainBlock {
            data_ofs: self.append_pos + RECORD_LEN,
            address: start as u32,
            length: length as u32,
            modified: true,
        };
        tracing::debug!(
            "B000FF: new block {:#x}+{:#x} at {:#x}",
            start,
            length,
            self.append_pos
        );
        self.blocks.insert(block.address, block);
        self.append_pos += RECORD_LEN + length;
        self.extended = true;
        Ok(block)
    }

    fn end_address(&self) -> u64 {
        self.blocks.values().next_back().map_or(0, |b| b.end())
    }
}

/// Most frequent value; ties go to the first maximum in ascending order.
fn most_common_length(lengths: impl Iterator<Item = u32>) -> u32 {
    let mut counts: BTreeMap<u32, usize> = BTreeMap::new();
    for l in lengths {
        *counts.entry(l).or_default() += 1;
    }
    let mut best = (0u32, 0usize);
    for (len, n) in counts {
        if n > best.1 {
            best = (len, n);
        }
    }
    best.0
}

impl Stream for BlockChainView {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let size = self.size();
        let mut done = 0;
        while done < buf.len() && self.pos < size {
            let addr = self.address_of(self.pos)?;
            let remain = (buf.len() - done).min((size - self.pos) as usize);
            let n = match self.block_containing(addr) {
                Some(b) => {
                    let n = remain.min((b.end() - addr) as usize);
                    let got = self.inner.read_at(
                        b.data_ofs + (addr - b.address as u64),
                        &mut buf[done..done + n],
                    )?;
                    if got < n {
                        done += got;
                        self.pos += got as u64;
                        break;
                    }
                    n
                }
                None => {
                    let gap = self
                        .next_block_start(addr)
                        .map_or(remain, |next| remain.min((next - addr) as usize));
                    buf[done..done + gap].fill(0);
                    gap
                }
            };
            done += n;
            self.pos += n as u64;
        }
        Ok(done)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let addr = self.address_of(self.pos)?;
            let block = match self.block_containing(addr) {
                Some(b) => b,
                None => self.allocate_block(addr)?,
            };
            let n = (buf.len() - done).min((block.end() - addr) as usize);
            self.inner.write_at(
                block.data_ofs + (addr - block.address as u64),
                &buf[done..done + n],
            )?;
            if let Some(b) = self.blocks.get_mut(&block.address) {
                b.modified = true;
            }
            done += n;
            self.pos += n as u64;
        }
        Ok(())
    }

    fn set_pos(&mut self, pos: u64) -> Result<()> {
        self.address_of(pos)?;
        self.pos = pos;
        Ok(())
    }

    fn pos(&self) -> u64 {
        self.pos
    }

    /// The chain never shrinks.
    fn truncate(&mut self, _len: u64) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> u64 {
        let by_blocks = self
            .end_address()
            .saturating_sub(self.image_start as u64);
        by_blocks.max(self.image_length as u64)
    }

    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    fn flush(&mut self) -> Result<()> {
        let modified: Vec<ChainBlock> = self.blocks.values().filter(|b| b.modified).copied().collect();
        for b in &modified {
            let data = self.inner.read_vec(b.data_ofs, b.length as usize)?;
            self.inner.write_u32_at(b.data_ofs - 4, byte_sum(&data))?;
        }
        for b in self.blocks.values_mut() {
            b.modified = false;
        }
        if !modified.is_empty() {
            tracing::debug!("B000FF: updated {} checksums", modified.len());
        }

        if self.extended {
            let mut term = [0u8; RECORD_LEN as usize];
            put_u32(&mut term, 4, self.entry_point);
            self.inner.write_at(self.append_pos, &term)?;
            self.inner.truncate(self.append_pos + RECORD_LEN)?;
            self.extended = false;
        }
        Ok(())
    }
}

impl Drop for BlockChainView {
    fn drop(&mut self) {
        let dirty = self.extended || self.blocks.values().any(|b| b.modified);
        if dirty {
            if let Err(e) = Stream::flush(self) {
                tracing::warn!("B000FF flush on drop failed: {}", e);
            }
        }
    }
}

/// Pack a flat image into a block chain with records of `block_size`.
pub fn encode_block_chain(
    image: &[u8],
    image_start: u32,
    block_size: u32,
    entry_point: u32,
) -> Result<Vec<u8>> {
    if block_size == 0 {
        return Err(FlashError::format("block size must be non-zero"));
    }
    let length = u32::try_from(image.len()).map_err(|_| FlashError::AddressOverflow {
        offset: image_start as u64,
        length: image.len() as u64,
    })?;
    if image_start.checked_add(length).is_none() {
        return Err(FlashError::AddressOverflow {
            offset: image_start as u64,
            length: length as u64,
        });
    }

    let records = image.len().div_ceil(block_size as usize);
    let mut out = Vec::with_capacity(
        HEADER_LEN as usize + image.len() + (records + 1) * RECORD_LEN as usize,
    );
    out.extend_from_slice(BLOCK_CHAIN_TAG);
    out.extend_from_slice(&image_start.to_le_bytes());
    out.extend_from_slice(&length.to_le_bytes());
    for (i, chunk) in image.chunks(block_size as usize).enumerate() {
        let address = image_start + (i as u32) * block_size;
        out.extend_from_slice(&address.to_le_bytes());
        out.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
        out.extend_from_slice(&byte_sum(chunk).to_le_bytes());
        out.extend_from_slice(chunk);
    }
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&entry_point.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    Ok(out)
}
