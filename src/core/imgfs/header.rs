//! IMGFS header block

use crate::compression::Algorithm;
use crate::error::{FlashError, Result};
use crate::io::{le_u32, put_u32, SharedStream};
use serde::{Deserialize, Serialize};

pub const IMGFS_UUID: [u8; 16] = [
    0xf8, 0xac, 0x2c, 0x9d, 0xe3, 0xd4, 0x2b, 0x4d, 0xbd, 0x30, 0x91, 0x6e, 0xd8, 0x4f, 0x31, 0xdc,
];
pub const DIRENT_SIZE: u32 = 0x34;
/// Bytes at the start of a directory block before the first entry
pub const DIRBLOCK_HEADER: u64 = 8;

/// Check for the IMGFS UUID at `offset`.
pub fn is_imgfs(store: &SharedStream, offset: u64) -> bool {
    let mut sig = [0u8; 16];
    matches!(store.read_at(offset, &mut sig), Ok(16)) && sig == IMGFS_UUID
}

/// Geometry used when formatting a new IMGFS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImgfsParams {
    pub chunk_size: u32,
    pub block_size: u32,
    pub compression: Algorithm,
}

impl Default for ImgfsParams {
    fn default() -> Self {
        ImgfsParams {
            chunk_size: 0x200,
            block_size: 0x1000,
            compression: Algorithm::Xpr,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImgfsHeader {
    pub dirent_size: u32,
    pub chunks_per_block: u32,
    pub bytes_per_block: u32,
    pub compression: Algorithm,
    pub free_sector_count: u32,
    pub hidden_sector_count: u32,
}

impl ImgfsHeader {
    pub const LEN: usize = 0x38;

    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < Self::LEN || raw[..16] != IMGFS_UUID {
            return Err(FlashError::format("missing IMGFS uuid"));
        }
        let dirent_size = le_u32(raw, 0x1c);
        let chunks_per_block = le_u32(raw, 0x20);
        let bytes_per_block = le_u32(raw, 0x24);
        let tag = le_u32(raw, 0x2c);

        if dirent_size != DIRENT_SIZE {
            return Err(FlashError::format(format!(
                "unsupported dirent size {:#x}",
                dirent_size
            )));
        }
        let compression = Algorithm::from_imgfs_tag(tag)
            .ok_or_else(|| FlashError::format(format!("unsupported compression: {:08x}", tag)))?;
        validate_geometry(chunks_per_block, bytes_per_block)?;

        Ok(ImgfsHeader {
            dirent_size,
            chunks_per_block,
            bytes_per_block,
            compression,
            free_sector_count: le_u32(raw, 0x30),
            hidden_sector_count: le_u32(raw, 0x34),
        })
    }

    pub fn from_params(params: &ImgfsParams) -> Result<Self> {
        if params.chunk_size == 0 || params.block_size % params.chunk_size != 0 {
            return Err(FlashError::format(format!(
                "block size {:#x} is not a multiple of chunk size {:#x}",
                params.block_size, params.chunk_size
            )));
        }
        if params.compression.imgfs_tag().is_none() {
            return Err(FlashError::format(format!(
                "{} cannot be used for IMGFS",
                params.compression
            )));
        }
        let chunks_per_block = params.block_size / params.chunk_size;
        validate_geometry(chunks_per_block, params.block_size)?;
        Ok(ImgfsHeader {
            dirent_size: DIRENT_SIZE,
            chunks_per_block,
            bytes_per_block: params.block_size,
            compression: params.compression,
            free_sector_count: 0,
            hidden_sector_count: 0,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; Self::LEN];
        out[..16].copy_from_slice(&IMGFS_UUID);
        put_u32(&mut out, 0x10, 1);
        put_u32(&mut out, 0x14, 1);
        put_u32(&mut out, 0x18, 1);
        put_u32(&mut out, 0x1c, self.dirent_size);
        put_u32(&mut out, 0x20, self.chunks_per_block);
        put_u32(&mut out, 0x24, self.bytes_per_block);
        put_u32(&mut out, 0x28, 0x1000);
        put_u32(&mut out, 0x2c, self.compression.imgfs_tag().unwrap_or(0));
        put_u32(&mut out, 0x30, self.free_sector_count);
        put_u32(&mut out, 0x34, self.hidden_sector_count);
        out
    }

    pub fn chunk_size(&self) -> u64 {
        (self.bytes_per_block / self.chunks_per_block) as u64
    }

    pub fn block_size(&self) -> u64 {
        self.bytes_per_block as u64
    }

    pub fn entries_per_block(&self) -> usize {
        ((self.bytes_per_block as u64 - DIRBLOCK_HEADER) / self.dirent_size as u64) as usize
    }

    pub fn round_to_chunk(&self, len: u64) -> u64 {
        crate::filesystem::round_up(len, self.chunk_size())
    }
}

fn validate_geometry(chunks_per_block: u32, bytes_per_block: u32) -> Result<()> {
    if chunks_per_block == 0
        || !bytes_per_block.is_power_of_two()
        || !chunks_per_block.is_power_of_two()
        || chunks_per_block > bytes_per_block
    {
        return Err(FlashError::format(format!(
            "bad imgfs geometry: {:#x} chunks per {:#x}-byte block",
            chunks_per_block, bytes_per_block
        )));
    }
    if (bytes_per_block as u64) < DIRBLOCK_HEADER + DIRENT_SIZE as u64 {
        return Err(FlashError::format(format!(
            "imgfs block of {:#x} bytes holds no directory entries",
            bytes_per_block
        )));
    }
    Ok(())
}
