//! Stream transforms
//!
//! Each transform wraps a [`SharedStream`](crate::io::SharedStream) and
//! presents a logical byte space over it. Transforms stack: a sector-tag
//! view may sit inside a signed container inside a block chain.

pub mod blockchain;
pub mod cxip;
pub mod range;
pub mod sectortag;
pub mod signed;
pub mod stride;

pub use blockchain::{
    byte_sum, encode_block_chain, is_block_chain, BlockChainView, ChecksumMismatch,
    BLOCK_CHAIN_TAG,
};
pub use cxip::{is_compressed_region, CompressedRegionView, COMPRESSED_REGION_MAGIC};
pub use range::{OffsetView, RangeView};
pub use sectortag::{find_block_size, has_block_number, SectorTagView, TagArea, SECTOR_TAG_MAGIC};
pub use signed::{is_signed_blocks, BlockSigner, SignedBlockView, SIGNED_TAG};
pub use stride::{StrideView, HIMA_LOGICAL_PERIOD, HIMA_PHYSICAL_PERIOD};
