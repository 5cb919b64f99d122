//! Malformed images: tolerated anomalies, strict mode, and per-entry failures

mod common;

use common::*;
use flashfs::core::imgfs::dirent::FileRecord;
use flashfs::{
    encode_block_chain, BlockChainView, Filesystem, ImageBuilder, Imgfs, OverlapPolicy,
    UnavailableCodec,
};
use std::sync::Arc;

/// Second file entry in a region built by `xip_region`
const SECOND_FILE_ENTRY: usize = 0x1054 + 0x1c;

#[test]
fn test_overlap_tolerated_by_default_rejected_when_strict() {
    let mut raw = xip_region(&[("a.bin", &[1u8; 16]), ("b.bin", &[2u8; 16])]);
    // point b.bin's data at a.bin's
    raw[SECOND_FILE_ENTRY + 0x18..SECOND_FILE_ENTRY + 0x1c]
        .copy_from_slice(&(XIP_BASE + 0x1400).to_le_bytes());

    let lenient = open(raw.clone());
    let xip = lenient.filesystem("xip").unwrap().as_fs();
    assert_eq!(xip.extract("b.bin").unwrap(), vec![1u8; 16]);

    let strict = ImageBuilder::new()
        .codec(codec())
        .overlap_policy(OverlapPolicy::Strict)
        .open_store(store(raw))
        .unwrap();
    assert!(strict.filesystem("xip").is_none());
}

#[test]
fn test_corrupt_imgfs_is_skipped() {
    let mut raw = imgfs_image(&[("a.txt", b"a")]);
    raw[0x1000..0x1004].copy_from_slice(&[0, 0, 0, 0]);
    let image = open(raw);
    assert!(image.filesystem_names().is_empty());
    assert_eq!(image.readers().len(), 1);
}

#[test]
fn test_partition_beyond_image_is_clamped() {
    let mut raw = partitioned(&[(0x25, imgfs_image(&[("a.txt", b"inside")]))]);
    let count_at = 0x1be + 12;
    raw[count_at..count_at + 4].copy_from_slice(&0x1000u32.to_le_bytes());

    let image = open(raw.clone());
    let part = image.reader("part25").unwrap();
    assert_eq!(part.size(), raw.len() as u64 - 0x800);
    let fs = image.filesystem("imgfs").unwrap().as_fs();
    assert_eq!(fs.extract("a.txt").unwrap(), b"inside");
}

#[test]
fn test_batch_continues_past_failing_entry() {
    let mut raw = xip_region(&[("plain.txt", b"plain text"), ("packed.bin", &[9u8; 32])]);
    let attrs_at = SECOND_FILE_ENTRY..SECOND_FILE_ENTRY + 4;
    let attrs = u32::from_le_bytes(raw[attrs_at.clone()].try_into().unwrap());
    raw[attrs_at].copy_from_slice(&(attrs | 0x800).to_le_bytes());
    raw[SECOND_FILE_ENTRY + 0x10..SECOND_FILE_ENTRY + 0x14].copy_from_slice(&8u32.to_le_bytes());

    let image = ImageBuilder::new()
        .codec(Arc::new(UnavailableCodec))
        .open_store(store(raw))
        .unwrap();
    let report = image.extract_all("xip", |_, _| Ok(())).unwrap();
    assert_eq!(report.succeeded, vec!["plain.txt"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].name, "packed.bin");
    assert!(report.failed[0].error.contains("unavailable"));
}

#[test]
fn test_block_chain_checksum_mismatch_still_opens() {
    let flat = imgfs_image(&[("a.txt", b"payload")]);
    let mut chain = encode_block_chain(&flat, 0, 0x1000, 0).unwrap();
    // first record: offset(4) size(4) checksum(4) at 15, data at 27
    chain[27 + 0x800] ^= 0xff;

    let root = store(chain);
    let view = BlockChainView::open(root.clone()).unwrap();
    assert_eq!(view.verify().unwrap().len(), 1);
    drop(view);

    let image = ImageBuilder::new()
        .codec(codec())
        .read_only(true)
        .open_store(root)
        .unwrap();
    assert!(image.filesystem("imgfs").is_some());
}

/// Offset of the index table of `name` in a flat IMGFS image
fn index_ptr_of(raw: &[u8], name: &str) -> usize {
    let fs = Imgfs::open(store(raw.to_vec()), codec()).unwrap();
    let address = fs.stat(name).unwrap().address as usize;
    let record = FileRecord::parse(&raw[address..address + 0x34], address as u64).unwrap();
    record.index_ptr as usize
}

#[test]
fn test_bad_index_pointer_skips_entry() {
    let mut raw = imgfs_image(&[("first.bin", &noise(600, 1)), ("second.bin", &noise(600, 2))]);
    let index = index_ptr_of(&raw, "second.bin");
    raw[index + 4..index + 8].copy_from_slice(&0x7fff_fe00u32.to_le_bytes());

    let image = open(raw);
    let fs = image.filesystem("imgfs").unwrap().as_fs();
    assert!(!fs.contains("second.bin"));
    assert_eq!(fs.extract("first.bin").unwrap(), noise(600, 1));
}

#[test]
fn test_inconsistent_piece_fails_one_entry() {
    let mut raw = imgfs_image(&[("first.bin", &noise(600, 1)), ("second.bin", &noise(600, 2))]);
    let index = index_ptr_of(&raw, "second.bin");
    // full size below the stored size
    raw[index + 2..index + 4].copy_from_slice(&100u16.to_le_bytes());

    let image = open(raw);
    let report = image.extract_all("imgfs", |_, _| Ok(())).unwrap();
    assert_eq!(report.succeeded, vec!["first.bin"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].name, "second.bin");
}
