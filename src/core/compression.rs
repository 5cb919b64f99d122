//! Compression collaborator
//!
//! The vendor algorithms (XPR, XPH, LZX for containers; ROM3/ROM4 for XIP
//! regions) are not implemented here. The engine only sees the [`Codec`]
//! trait, injected into filesystem and transform constructors.
//!
//! **Fallback rules**:
//! - Writing: if the codec is unavailable, or the output is not smaller than
//!   the input, the data is stored uncompressed.
//! - Reading: data stored compressed needs a working codec; an unavailable
//!   backend is a hard error for that read.

use crate::error::{FlashError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Compression algorithm identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    Xpr,
    Xph,
    Lzx,
    Rom3,
    Rom4,
}

impl Algorithm {
    /// Decode the compression tag stored in an IMGFS header.
    pub fn from_imgfs_tag(tag: u32) -> Option<Self> {
        match tag {
            0x0052_5058 => Some(Algorithm::Xpr),
            0x0048_5058 => Some(Algorithm::Xph),
            0x0058_5a4c => Some(Algorithm::Lzx),
            _ => None,
        }
    }

    /// IMGFS header tag. ROM algorithms have none.
    pub fn imgfs_tag(self) -> Option<u32> {
        match self {
            Algorithm::Xpr => Some(0x0052_5058),
            Algorithm::Xph => Some(0x0048_5058),
            Algorithm::Lzx => Some(0x0058_5a4c),
            Algorithm::Rom3 | Algorithm::Rom4 => None,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Algorithm::Xpr => "XPR",
            Algorithm::Xph => "XPH",
            Algorithm::Lzx => "LZX",
            Algorithm::Rom3 => "ROM3",
            Algorithm::Rom4 => "ROM4",
        };
        f.write_str(name)
    }
}

/// Compression backend.
pub trait Codec: Send + Sync {
    fn compress(&self, algorithm: Algorithm, input: &[u8]) -> Result<Vec<u8>>;
    fn decompress(&self, algorithm: Algorithm, input: &[u8], expected_size: usize)
        -> Result<Vec<u8>>;
}

pub type SharedCodec = Arc<dyn Codec>;

/// Backend used when no vendor library is present. Every call fails with
/// [`FlashError::Unavailable`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableCodec;

impl Codec for UnavailableCodec {
    fn compress(&self, algorithm: Algorithm, _input: &[u8]) -> Result<Vec<u8>> {
        Err(FlashError::Unavailable(algorithm))
    }

    fn decompress(&self, algorithm: Algorithm, _input: &[u8], _expected: usize) -> Result<Vec<u8>> {
        Err(FlashError::Unavailable(algorithm))
    }
}

/// LZ4 block codec answering for every algorithm id.
///
/// Output is not readable by devices. Useful for images that are both
/// written and read by this crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortableCodec;

impl Codec for PortableCodec {
    fn compress(&self, _algorithm: Algorithm, input: &[u8]) -> Result<Vec<u8>> {
        Ok(lz4_flex::compress(input))
    }

    fn decompress(&self, algorithm: Algorithm, input: &[u8], expected: usize) -> Result<Vec<u8>> {
        let out = lz4_flex::decompress(input, expected)
            .map_err(|e| FlashError::Codec(format!("{} decompression failed: {}", algorithm, e)))?;
        if out.len() != expected {
            return Err(FlashError::Codec(format!(
                "{} decompressed to {} bytes, expected {}",
                algorithm,
                out.len(),
                expected
            )));
        }
        Ok(out)
    }
}

/// Compress `data`, falling back to the raw bytes when the backend is
/// unavailable or the result is not smaller. Returns `(bytes, compressed)`.
pub fn compress_if_beneficial(
    codec: &dyn Codec,
    algorithm: Algorithm,
    data: &[u8],
) -> Result<(Vec<u8>, bool)> {
    if data.is_empty() {
        return Ok((Vec::new(), false));
    }
    match codec.compress(algorithm, data) {
        Ok(compressed) if compressed.len() < data.len() => Ok((compressed, true)),
        Ok(_) => Ok((data.to_vec(), false)),
        Err(FlashError::Unavailable(alg)) => {
            tracing::debug!("{} unavailable, storing {} bytes raw", alg, data.len());
            Ok((data.to_vec(), false))
        }
        Err(e) => Err(e),
    }
}

/// Expand a stored piece: raw when sizes match, decompressed when smaller.
///
/// A stored size above the full size cannot be produced by any writer and is
/// reported as index corruption.
pub fn expand_piece(
    codec: &dyn Codec,
    algorithm: Algorithm,
    stored: &[u8],
    full_size: usize,
    offset: u64,
) -> Result<Vec<u8>> {
    if stored.len() == full_size {
        return Ok(stored.to_vec());
    }
    if stored.len() > full_size {
        return Err(FlashError::IndexCorruption {
            offset,
            reason: format!(
                "compressed size {:#x} exceeds full size {:#x}",
                stored.len(),
                full_size
            ),
        });
    }
    codec.decompress(algorithm, stored, full_size)
}
