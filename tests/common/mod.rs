//! Image builders shared by the integration tests

#![allow(dead_code)]

use flashfs::core::xip::{FileEntry, RomHeader, ECEC_SIGNATURE};
use flashfs::{
    Filesystem, Image, ImageBuilder, Imgfs, ImgfsParams, MemoryStore, PortableCodec, SharedCodec,
    SharedStream,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

pub const XIP_BASE: u32 = 0x8000_0000;
pub const XIP_CPU: u16 = 0x01c2;

pub fn codec() -> SharedCodec {
    Arc::new(PortableCodec)
}

/// Incompressible payload
pub fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill(&mut data[..]);
    data
}

pub fn store(raw: Vec<u8>) -> SharedStream {
    SharedStream::new(MemoryStore::from_vec(raw))
}

pub fn contents(stream: &SharedStream) -> Vec<u8> {
    stream.read_vec(0, stream.size() as usize).unwrap()
}

/// A flat IMGFS image holding `files`
pub fn imgfs_image(files: &[(&str, &[u8])]) -> Vec<u8> {
    let stream = SharedStream::new(MemoryStore::new());
    let mut fs = Imgfs::create(stream.clone(), ImgfsParams::default(), codec()).unwrap();
    for (name, data) in files {
        fs.add(name, &mut &data[..]).unwrap();
    }
    drop(fs);
    contents(&stream)
}

/// A 0x2000-byte XIP region with uncompressed files and no modules
pub fn xip_region(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut img = vec![0u8; 0x2000];
    img[0x40..0x44].copy_from_slice(&ECEC_SIGNATURE.to_le_bytes());
    img[0x44..0x48].copy_from_slice(&(XIP_BASE + 0x1000).to_le_bytes());
    img[0x48..0x4c].copy_from_slice(&0x1000u32.to_le_bytes());

    let hdr = RomHeader {
        phys_first: XIP_BASE,
        phys_last: XIP_BASE + 0x2000,
        num_files: files.len() as u32,
        cpu_type: XIP_CPU,
        ..RomHeader::default()
    };
    img[0x1000..0x1000 + RomHeader::LEN].copy_from_slice(&hdr.encode());

    let mut list = 0x1000 + RomHeader::LEN;
    let mut names = 0x1200;
    let mut data = 0x1400;
    for (name, payload) in files {
        img[names..names + name.len()].copy_from_slice(name.as_bytes());
        img[data..data + payload.len()].copy_from_slice(payload);
        let entry = FileEntry {
            attributes: 7,
            filetime: 0,
            size: payload.len() as u32,
            compressed_size: payload.len() as u32,
            name_rva: XIP_BASE + names as u32,
            load_rva: XIP_BASE + data as u32,
        };
        img[list..list + FileEntry::LEN].copy_from_slice(&entry.encode());
        list += FileEntry::LEN;
        names += (name.len() + 4) & !3;
        data += (payload.len() + 3) & !3;
    }
    img
}

/// MBR sector with `(kind, start_sector, sector_count)` entries
pub fn mbr(entries: &[(u8, u32, u32)]) -> Vec<u8> {
    let mut sector = vec![0u8; 512];
    for (i, &(kind, start, count)) in entries.iter().enumerate() {
        let ofs = 0x1be + i * 16;
        sector[ofs + 4] = kind;
        sector[ofs + 8..ofs + 12].copy_from_slice(&start.to_le_bytes());
        sector[ofs + 12..ofs + 16].copy_from_slice(&count.to_le_bytes());
    }
    sector[510] = 0x55;
    sector[511] = 0xaa;
    sector
}

/// Place `parts` at consecutive 0x800-byte sectors behind an MBR at sector 0.
pub fn partitioned(parts: &[(u8, Vec<u8>)]) -> Vec<u8> {
    let mut entries = Vec::new();
    let mut body = Vec::new();
    let mut sector = 1u32;
    for (kind, data) in parts {
        let count = (data.len() as u32).div_ceil(0x800);
        entries.push((*kind, sector, count));
        let mut padded = data.clone();
        padded.resize(count as usize * 0x800, 0);
        body.extend_from_slice(&padded);
        sector += count;
    }
    let mut raw = mbr(&entries);
    raw.resize(0x800, 0);
    raw.extend_from_slice(&body);
    raw
}

pub fn open(raw: Vec<u8>) -> Image {
    ImageBuilder::new().codec(codec()).open_store(store(raw)).unwrap()
}
