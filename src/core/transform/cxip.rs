//! Compressed XIP region ("SRPX")
//!
//! ```text
//! 0x34  data_offset u32
//! 0x38  block_count u32
//! 0x3c  block_size  u32
//! 0x40  "SRPX"
//! 0x44  u16 compressed_size[block_count]
//! ```
//!
//! Blocks decompress to `block_size` bytes each. Decompressed blocks are kept
//! in an LRU cache; the first write switches the view to an in-memory copy
//! that is recompressed on flush.

use crate::compression::{compress_if_beneficial, expand_piece, Algorithm, SharedCodec};
use crate::error::{FlashError, Result};
use crate::io::{le_u16, le_u32, put_u16, put_u32, SharedStream, Stream};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;

pub const COMPRESSED_REGION_MAGIC: u32 = 0x5850_5253;
const HEADER_OFFSET: u64 = 0x34;
const SIZES_OFFSET: u64 = 0x44;
const MAX_REGION: u64 = 0x4000_0000;
/// Raw blocks must fit the u16 size table
const MAX_BLOCK_SIZE: u32 = 0x8000;

/// Check the SRPX header at `offset`.
pub fn is_compressed_region(store: &SharedStream, offset: u64) -> bool {
    let Ok(hdr) = store.read_vec(offset + HEADER_OFFSET, 16) else {
        return false;
    };
    let data_offset = le_u32(&hdr, 0) as u64;
    let block_count = le_u32(&hdr, 4) as u64;
    let block_size = le_u32(&hdr, 8);
    if block_count * 2 + SIZES_OFFSET > data_offset {
        return false;
    }
    if !block_size.is_power_of_two() || block_size as u64 * block_count > MAX_REGION {
        return false;
    }
    le_u32(&hdr, 12) == COMPRESSED_REGION_MAGIC
}

pub struct CompressedRegionView {
    inner: SharedStream,
    codec: SharedCodec,
    block_size: u32,
    /// (file offset, stored size) per block
    blocks: Vec<(u64, u32)>,
    cache: LruCache<usize, Arc<Vec<u8>>>,
    /// Whole decompressed region once written to
    memory: Option<Vec<u8>>,
    dirty: bool,
    pos: u64,
}

impl CompressedRegionView {
    pub fn open(inner: SharedStream, codec: SharedCodec, cache_blocks: usize) -> Result<Self> {
        if !is_compressed_region(&inner, 0) {
            return Err(FlashError::format("invalid compressed xip header"));
        }
        let hdr = inner.read_vec(HEADER_OFFSET, 12)?;
        let data_offset = le_u32(&hdr, 0) as u64;
        let block_count = le_u32(&hdr, 4) as usize;
        let block_size = le_u32(&hdr, 8);
        if block_size > MAX_BLOCK_SIZE {
            return Err(FlashError::format(format!(
                "compressed xip block size {:#x} too large",
                block_size
            )));
        }

        let sizes = inner.read_vec(SIZES_OFFSET, block_count * 2)?;
        let mut blocks = Vec::with_capacity(block_count);
        let mut ofs = data_offset;
        for i in 0..block_count {
            let stored = le_u16(&sizes, i * 2) as u32;
            blocks.push((ofs, stored));
            ofs += stored as u64;
        }
        tracing::info!(
            "compressed xip: {} blocks of {:#x}, {:#x} compressed bytes",
            block_count,
            block_size,
            ofs - data_offset
        );

        let capacity = NonZeroUsize::new(cache_blocks.max(1)).unwrap_or(NonZeroUsize::MIN);
        Ok(CompressedRegionView {
            inner,
            codec,
            block_size,
            blocks,
            cache: LruCache::new(capacity),
            memory: None,
            dirty: false,
            pos: 0,
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn block(&mut self, idx: usize) -> Result<Arc<Vec<u8>>> {
        if let Some(hit) = self.cache.get(&idx) {
            return Ok(hit.clone());
        }
        let (ofs, stored) = self.blocks[idx];
        let raw = self.inner.read_vec(ofs, stored as usize)?;
        let full = if stored == 0 {
            vec![0u8; self.block_size as usize]
        } else {
            expand_piece(
                self.codec.as_ref(),
                Algorithm::Xpr,
                &raw,
                self.block_size as usize,
                ofs,
            )?
        };
        let full = Arc::new(full);
        self.cache.put(idx, full.clone());
        Ok(full)
    }

    fn load_memory(&mut self) -> Result<()> {
        let mut all = Vec::with_capacity(self.size() as usize);
        for idx in 0..self.blocks.len() {
            all.extend_from_slice(&self.block(idx)?);
        }
        tracing::debug!("compressed xip: loaded {:#x} bytes for writing", all.len());
        self.memory = Some(all);
        self.cache.clear();
        Ok(())
    }
}

impl Stream for CompressedRegionView {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let size = self.size();
        if self.pos >= size {
            return Ok(0);
        }
        let want = buf.len().min((size - self.pos) as usize);
        if let Some(mem) = &self.memory {
            let start = self.pos as usize;
            buf[..want].copy_from_slice(&mem[start..start + want]);
            self.pos += want as u64;
            return Ok(want);
        }
        let bs = self.block_size as u64;
        let mut done = 0;
        while done < want {
            let idx = (self.pos / bs) as usize;
            let within = (self.pos % bs) as usize;
            let block = self.block(idx)?;
            let n = (want - done).min(block.len() - within);
            buf[done..done + n].copy_from_slice(&block[within..within + n]);
            done += n;
            self.pos += n as u64;
        }
        Ok(done)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        if self.inner.is_read_only() {
            return Err(FlashError::ReadOnlyViolation);
        }
        if self.memory.is_none() {
            self.load_memory()?;
        }
        let start = self.pos as usize;
        let end = start + buf.len();
        if let Some(mem) = self.memory.as_mut() {
            if end > mem.len() {
                mem.resize(end, 0);
            }
            mem[start..end].copy_from_slice(buf);
        }
        self.pos = end as u64;
        self.dirty = true;
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
            "truncating a compressed xip region".to_string(),
        ))
    }

    fn size(&self) -> u64 {
        match &self.memory {
            Some(mem) => mem.len() as u64,
            None => self.blocks.len() as u64 * self.block_size as u64,
        }
    }

    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let Some(mut mem) = self.memory.take() else {
            return Ok(());
        };
        let bs = self.block_size as usize;
        mem.resize(mem.len().div_ceil(bs) * bs, 0);

        let mut sizes = Vec::new();
        let mut data = Vec::new();
        for chunk in mem.chunks(self.block_size as usize) {
            let (stored, _) = compress_if_beneficial(self.codec.as_ref(), Algorithm::Xpr, chunk)?;
            if stored.len() > u16::MAX as usize {
                return Err(FlashError::format(format!(
                    "compressed xip block of {:#x} bytes does not fit the size table",
                    stored.len()
                )));
            }
            sizes.push(stored.len() as u32);
            data.extend_from_slice(&stored);
        }

        let data_offset = SIZES_OFFSET + 2 * sizes.len() as u64;
        let mut header = vec![0u8; 16 + 2 * sizes.len()];
        put_u32(&mut header, 0, data_offset as u32);
        put_u32(&mut header, 4, sizes.len() as u32);
        put_u32(&mut header, 8, self.block_size);
        put_u32(&mut header, 12, COMPRESSED_REGION_MAGIC);
        for (i, &s) in sizes.iter().enumerate() {
            put_u16(&mut header, 16 + i * 2, s as u16);
        }
        self.inner.write_at(HEADER_OFFSET, &header)?;
        self.inner.write_at(data_offset, &data)?;
        self.inner.truncate(data_offset + data.len() as u64)?;
        tracing::info!(
            "updated compressed xip: {} blocks (full {:#x}, compressed {:#x})",
            sizes.len(),
            mem.len(),
            data.len()
        );

        let mut ofs = data_offset;
        self.blocks = sizes
            .into_iter()
            .map(|s| {
                let entry = (ofs, s);
                ofs += s as u64;
                entry
            })
            .collect();
        self.dirty = false;
        Ok(())
    }
}

impl Drop for CompressedRegionView {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = Stream::flush(self) {
                tracing::warn!("compressed xip flush on drop failed: {}", e);
            }
        }
    }
}
