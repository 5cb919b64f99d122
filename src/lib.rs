//! # flashfs - Firmware Image Storage Engine
//!
//! `flashfs` opens block-addressed handheld firmware images and exposes the
//! filesystems inside them as named entries:
//!
//! - **Stream transforms** that undo physical framing: checksummed block
//!   chains, signed blocks, sector-tagged flash, sector interleaving,
//!   partitions and compressed regions
//! - **IMGFS**, a chunk-indexed directory filesystem with compressed data
//! - **XIP**, an RVA-addressed module and file table
//! - An **interval allocation map** shared by both filesystems
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flashfs::{Image, Result};
//!
//! # fn main() -> Result<()> {
//! let mut image = Image::open("rom.nb")?;
//! for name in image.filesystem_names() {
//!     println!("{}", name);
//! }
//! if let Some(imgfs) = image.filesystem("imgfs") {
//!     let data = imgfs.as_fs().extract("boot.hv")?;
//!     println!("{} bytes", data.len());
//! }
//! image.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Building a filesystem
//!
//! ```rust
//! use flashfs::{Filesystem, Imgfs, ImgfsParams, MemoryStore, PortableCodec, SharedStream};
//! use std::sync::Arc;
//!
//! # fn main() -> flashfs::Result<()> {
//! let stream = SharedStream::new(MemoryStore::new());
//! let mut fs = Imgfs::create(stream, ImgfsParams::default(), Arc::new(PortableCodec))?;
//! fs.add("hello.txt", &mut &b"hello"[..])?;
//! assert_eq!(fs.extract("HELLO.TXT")?, b"hello");
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use crate::core::{
    allocator, compression, config, error, filesystem, htc, image, imgfs, io, module, partition,
    transform, xip,
};

// Re-export the types users need
pub use crate::core::{
    allocator::{AllocationMap, Interval, OverlapPolicy, SlotBitmap},
    compression::{
        compress_if_beneficial, Algorithm, Codec, PortableCodec, SharedCodec, UnavailableCodec,
    },
    config::EngineConfig,
    error::{FlashError, Result},
    filesystem::{EntryInfo, EntryKind, Filesystem, FsKind, FsStats},
    htc::{is_htc_image, HtcImage, HtcSection},
    image::{
        recognize, BatchFailure, BatchReport, Container, Image, ImageBuilder, ImageReport, Layer,
        Mounted,
    },
    imgfs::{is_imgfs, Imgfs, ImgfsHeader, ImgfsParams},
    io::{FileStore, MemoryStore, MmapStore, SharedStream, Stream, UndoLog},
    module::{ExeBuilder, ModuleHeader, RomExeHeader, SectionSource},
    partition::{FlashLayout, PartitionEntry, PartitionTable},
    transform::{
        encode_block_chain, BlockChainView, BlockSigner, CompressedRegionView, OffsetView,
        RangeView, SectorTagView, SignedBlockView, StrideView,
    },
    xip::{is_xip, Xip, XipOptions},
};
