use super::*;
use crate::compression::{Codec, PortableCodec, UnavailableCodec};
use crate::io::{put_u32, MemoryStore};
use crate::module::tests::{sample_e32, ConcatBuilder};
use crate::module::{O32Rom, IMAGE_SCN_COMPRESSED};

const BASE: u32 = 0x8000_0000;

struct Sample {
    stream: SharedStream,
    raw_section: Vec<u8>,
    full_section: Vec<u8>,
    readme: Vec<u8>,
    packed: Vec<u8>,
}

fn codec() -> SharedCodec {
    Arc::new(PortableCodec)
}

fn put_name(img: &mut [u8], at: usize, name: &str) {
    img[at..at + name.len()].copy_from_slice(name.as_bytes());
}

/// One module (two sections, the second compressed) and two files.
fn sample(legacy: bool) -> Sample {
    let lz = PortableCodec;
    let mut img = vec![0u8; 0x2000];
    put_u32(&mut img, 0x40, ECEC_SIGNATURE);
    put_u32(&mut img, 0x44, BASE + 0x1000);
    put_u32(&mut img, 0x48, if legacy { 0 } else { 0x1000 });

    let hdr = RomHeader {
        phys_first: BASE,
        phys_last: BASE + 0x2000,
        num_mods: 1,
        num_files: 2,
        cpu_type: 0x01c2,
        ..RomHeader::default()
    };
    img[0x1000..0x1054].copy_from_slice(&hdr.encode());

    let e32_len = E32Rom::size(legacy);
    let toc = TocEntry {
        attributes: 7,
        filetime: 0,
        size: 0x5000,
        name_rva: BASE + 0x1100,
        e32_rva: BASE + 0x1200,
        o32_rva: BASE + 0x1200 + e32_len as u32,
        load_rva: 0x1000_0000,
    };
    img[0x1054..0x1074].copy_from_slice(&toc.encode());

    let readme: Vec<u8> = (0..100u8).collect();
    let packed = vec![0x55u8; 2000];
    let packed_comp = lz.compress(Algorithm::Rom4, &packed).unwrap();
    assert!(packed_comp.len() < 0x300);
    let files = [
        FileEntry {
            attributes: 7,
            filetime: 0,
            size: 100,
            compressed_size: 100,
            name_rva: BASE + 0x1110,
            load_rva: BASE + 0x1400,
        },
        FileEntry {
            attributes: 7 | entry::ATTR_COMPRESSED,
            filetime: 0,
            size: 2000,
            compressed_size: packed_comp.len() as u32,
            name_rva: BASE + 0x1120,
            load_rva: BASE + 0x1500,
        },
    ];
    img[0x1074..0x1090].copy_from_slice(&files[0].encode());
    img[0x1090..0x10ac].copy_from_slice(&files[1].encode());

    put_name(&mut img, 0x1100, "nk.exe");
    put_name(&mut img, 0x1110, "readme.txt");
    put_name(&mut img, 0x1120, "packed.bin");

    let raw_section: Vec<u8> = (0..=255u8).collect();
    let full_section = vec![0xaau8; 0x400];
    let sec_comp = lz.compress(Algorithm::Rom4, &full_section).unwrap();
    let o32 = [
        O32Rom {
            vsize: 0x100,
            rva: 0x1000,
            psize: 0x100,
            dataptr: BASE + 0x1300,
            realaddr: 0,
            flags: 0x6000_0020,
        },
        O32Rom {
            vsize: 0x400,
            rva: 0x2000,
            psize: sec_comp.len() as u32,
            dataptr: BASE + 0x1800,
            realaddr: 0,
            flags: 0xc000_0040 | IMAGE_SCN_COMPRESSED,
        },
    ];
    img[0x1200..0x1200 + e32_len].copy_from_slice(&sample_e32(2).encode(legacy));
    let o32_at = 0x1200 + e32_len;
    img[o32_at..o32_at + 0x18].copy_from_slice(&o32[0].encode());
    img[o32_at + 0x18..o32_at + 0x30].copy_from_slice(&o32[1].encode());

    img[0x1300..0x1400].copy_from_slice(&raw_section);
    img[0x1400..0x1464].copy_from_slice(&readme);
    img[0x1500..0x1500 + packed_comp.len()].copy_from_slice(&packed_comp);
    img[0x1800..0x1800 + sec_comp.len()].copy_from_slice(&sec_comp);

    Sample {
        stream: SharedStream::new(MemoryStore::from_vec(img)),
        raw_section,
        full_section,
        readme,
        packed,
    }
}

fn open(s: &Sample) -> Xip {
    Xip::open(s.stream.clone(), codec()).unwrap()
}

#[test]
fn test_lists_entries() {
    let s = sample(false);
    let xip = open(&s);
    assert_eq!(xip.rva_base(), BASE);
    assert_eq!(xip.cpu_type(), 0x01c2);

    let names: Vec<String> = xip.entries().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["nk.exe", "packed.bin", "readme.txt"]);

    let nk = xip.stat("NK.EXE").unwrap();
    assert_eq!(nk.kind, EntryKind::Module);
    assert_eq!(nk.address, (BASE + 0x1054) as u64);
    let readme = xip.stat("readme.txt").unwrap();
    assert_eq!(readme.size, 100);
    assert_eq!(readme.address, (BASE + 0x1074) as u64);

    let stats = xip.stats();
    assert_eq!((stats.files, stats.modules), (2, 1));
    xip.allocation_map().check_invariants().unwrap();
}

#[test]
fn test_extract_files() {
    let s = sample(false);
    let xip = open(&s);
    assert_eq!(xip.extract("readme.txt").unwrap(), s.readme);
    assert_eq!(xip.extract("packed.bin").unwrap(), s.packed);
    assert!(matches!(xip.extract("missing"), Err(FlashError::NotFound(_))));
}

#[test]
fn test_compressed_file_needs_codec() {
    let s = sample(false);
    let xip = Xip::open(s.stream.clone(), Arc::new(UnavailableCodec)).unwrap();
    assert_eq!(xip.extract("readme.txt").unwrap(), s.readme);
    let err = xip.extract("packed.bin").unwrap_err();
    assert!(matches!(err, FlashError::Unavailable(Algorithm::Rom4)));
    assert!(err.is_entry_local());
}

#[test]
fn test_module_extraction() {
    let s = sample(false);
    let mut xip = open(&s);
    assert!(matches!(
        xip.extract("nk.exe"),
        Err(FlashError::Unsupported(_))
    ));

    let sections = xip.module_sections("nk.exe").unwrap();
    assert_eq!(sections[0].name, "S000");
    assert_eq!(sections[1].size, 0x400);

    let builder = Arc::new(ConcatBuilder::default());
    xip.set_exe_builder(builder.clone());
    let out = xip.extract("nk.exe").unwrap();
    assert_eq!(out, [s.raw_section.clone(), s.full_section.clone()].concat());

    let seen = builder.seen.lock();
    assert_eq!(seen[0].0.cpu_type, 0x01c2);
    assert_eq!(seen[0].0.base_rva, 0x1000_0000);
    assert_eq!(seen[0].1, vec!["S000".to_string(), "S001".to_string()]);
}

#[test]
fn test_legacy_layout_with_forced_base() {
    let s = sample(true);
    assert!(Xip::open(s.stream.clone(), codec()).is_err());

    let options = XipOptions {
        rva_base: Some(BASE),
        legacy_layout: true,
        ..XipOptions::default()
    };
    let mut xip = Xip::open_with(s.stream.clone(), codec(), options).unwrap();
    assert_eq!(xip.location().header_offset, 0x1000);
    assert!(!xip.allocation_map().is_used(BASE as u64));

    let builder = Arc::new(ConcatBuilder::default());
    xip.set_exe_builder(builder.clone());
    xip.extract("nk.exe").unwrap();
    assert_eq!(builder.seen.lock()[0].0.timestamp, 0);
}

#[test]
fn test_add_flush_reopen() {
    let s = sample(false);
    let mut xip = open(&s);
    let log = vec![b'x'; 3000];
    xip.add("log.txt", &mut &log[..]).unwrap();
    let info = xip.stat("log.txt").unwrap();
    assert_eq!(info.attributes, 0x807);
    assert!(info.stored_size < 3000);
    xip.flush().unwrap();
    // second flush has nothing to do
    let hdr = xip.location();
    xip.flush().unwrap();
    assert_eq!(xip.location(), hdr);
    drop(xip);

    let xip = open(&s);
    assert_eq!(xip.entries().len(), 4);
    assert_eq!(xip.header().num_files, 3);
    assert_eq!(xip.extract("log.txt").unwrap(), log);
    assert_eq!(xip.extract("readme.txt").unwrap(), s.readme);
    assert!(is_xip(&s.stream, None));
}

#[test]
fn test_add_incompressible_is_stored_raw() {
    let s = sample(false);
    let mut xip = open(&s);
    let data: Vec<u8> = (0..64u8).collect();
    xip.add("raw.bin", &mut &data[..]).unwrap();
    let info = xip.stat("raw.bin").unwrap();
    assert_eq!(info.attributes, 0x7);
    assert_eq!(info.stored_size, 64);
    assert_eq!(xip.extract("raw.bin").unwrap(), data);
}

#[test]
fn test_drop_rewrites_header() {
    let s = sample(false);
    {
        let mut xip = open(&s);
        xip.add("late.txt", &mut &b"written on drop"[..]).unwrap();
    }
    let xip = open(&s);
    assert_eq!(xip.extract("late.txt").unwrap(), b"written on drop");
}

#[test]
fn test_rename_and_back_leaks_nothing() {
    let s = sample(false);
    let mut xip = open(&s);
    let baseline = xip.allocation_map().used_bytes();

    let long = "a_much_longer_name_for_the_readme_file.txt";
    xip.rename("readme.txt", long).unwrap();
    assert!(xip.contains(long));
    assert!(!xip.contains("readme.txt"));
    xip.rename(long, "readme.txt").unwrap();
    xip.flush().unwrap();
    assert_eq!(xip.allocation_map().used_bytes(), baseline);
    drop(xip);

    let xip = open(&s);
    assert_eq!(xip.extract("readme.txt").unwrap(), s.readme);
    assert_eq!(xip.allocation_map().used_bytes(), baseline);
}

#[test]
fn test_rename_conflicts() {
    let s = sample(false);
    let mut xip = open(&s);
    assert!(matches!(
        xip.rename("readme.txt", "PACKED.BIN"),
        Err(FlashError::AlreadyExists(_))
    ));
    assert!(matches!(
        xip.rename("nothing", "else"),
        Err(FlashError::NotFound(_))
    ));
    xip.rename("readme.txt", "README.TXT").unwrap();
    assert_eq!(xip.stat("readme.txt").unwrap().name, "README.TXT");
}

#[test]
fn test_delete_zeroes_and_frees() {
    let s = sample(false);
    let mut xip = open(&s);
    xip.delete("readme.txt").unwrap();
    assert!(!xip.contains("readme.txt"));
    assert!(!xip.allocation_map().is_used((BASE + 0x1400) as u64));
    assert!(s.stream.read_vec(0x1400, 100).unwrap().iter().all(|&b| b == 0));
    assert!(matches!(
        xip.delete("readme.txt"),
        Err(FlashError::NotFound(_))
    ));
    xip.flush().unwrap();
    drop(xip);

    let xip = open(&s);
    assert_eq!(xip.entries().len(), 2);
    assert_eq!(xip.extract("packed.bin").unwrap(), s.packed);
}

#[test]
fn test_delete_module_frees_sections() {
    let s = sample(false);
    let mut xip = open(&s);
    xip.delete("nk.exe").unwrap();
    assert!(!xip.allocation_map().is_used((BASE + 0x1300) as u64));
    assert!(!xip.allocation_map().is_used((BASE + 0x1200) as u64));
    xip.flush().unwrap();
    assert_eq!(open(&s).stats().modules, 0);
}

#[test]
fn test_module_cannot_be_replaced() {
    let s = sample(false);
    let mut xip = open(&s);
    assert!(matches!(
        xip.add("nk.exe", &mut &b"MZ"[..]),
        Err(FlashError::Unsupported(_))
    ));
    assert!(xip.stat("nk.exe").is_ok());
}

#[test]
fn test_strict_policy_rejects_overlap() {
    let s = sample(false);
    // point readme.txt's data into the first section
    put_u32_in(&s.stream, 0x1074 + 0x18, BASE + 0x1380);

    assert!(Xip::open(s.stream.clone(), codec()).is_ok());
    let strict = XipOptions {
        overlap_policy: OverlapPolicy::Strict,
        ..XipOptions::default()
    };
    assert!(matches!(
        Xip::open_with(s.stream.clone(), codec(), strict),
        Err(FlashError::Overlap { .. })
    ));
}

#[test]
fn test_truncated_lists_are_rejected() {
    let s = sample(false);
    put_u32_in(&s.stream, 0x1000 + 0x30, 0x1000);
    assert!(Xip::open(s.stream.clone(), codec()).err().unwrap().is_format());
}

#[test]
fn test_legacy_delete_all_then_flush() {
    let s = sample(true);
    let options = XipOptions {
        rva_base: Some(BASE),
        legacy_layout: true,
        ..XipOptions::default()
    };
    let mut xip = Xip::open_with(s.stream.clone(), codec(), options).unwrap();
    for name in ["nk.exe", "readme.txt", "packed.bin"] {
        xip.delete(name).unwrap();
    }
    xip.flush().unwrap();
    assert!(xip.location().header_rva >= BASE + ECEC_OFFSET as u32 + 12);
    drop(xip);

    let mut xip = Xip::open_with(s.stream.clone(), codec(), options).unwrap();
    assert!(xip.entries().is_empty());
    assert_eq!(xip.header().num_files, 0);
    xip.add("again.txt", &mut &b"back"[..]).unwrap();
    xip.flush().unwrap();
    drop(xip);
    let xip = Xip::open_with(s.stream.clone(), codec(), options).unwrap();
    assert_eq!(xip.extract("again.txt").unwrap(), b"back");
}

#[test]
fn test_failed_replace_keeps_old_contents() {
    use rand::{Rng, SeedableRng};

    let s = sample(false);
    let window = SharedStream::new(
        crate::transform::RangeView::new(s.stream.clone(), 0, 0x2000).unwrap(),
    );
    let mut xip = Xip::open(window.clone(), codec()).unwrap();
    let used = xip.allocation_map().used_bytes();

    let mut big = vec![0u8; 0x3000];
    rand::rngs::StdRng::seed_from_u64(3).fill(&mut big[..]);
    assert!(xip.add("readme.txt", &mut &big[..]).is_err());
    assert_eq!(window.read_vec(0x1400, 100).unwrap(), s.readme);
    assert_eq!(xip.extract("readme.txt").unwrap(), s.readme);
    assert_eq!(xip.allocation_map().used_bytes() + xip.table_len(), used);

    xip.flush().unwrap();
    drop(xip);
    let xip = open(&s);
    assert_eq!(xip.extract("readme.txt").unwrap(), s.readme);
    assert_eq!(xip.extract("packed.bin").unwrap(), s.packed);
}

fn put_u32_in(stream: &SharedStream, at: u64, value: u32) {
    stream.write_u32_at(at, value).unwrap();
}
