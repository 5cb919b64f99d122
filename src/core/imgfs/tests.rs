use super::*;
use crate::compression::{PortableCodec, UnavailableCodec};
use crate::module::tests::{sample_e32, ConcatBuilder};
use crate::module::O32Rom;
use crate::transform::RangeView;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const CS: usize = 0x200;

fn codec() -> SharedCodec {
    Arc::new(PortableCodec)
}

fn fresh() -> Imgfs {
    let stream = SharedStream::new(MemoryStore::new());
    Imgfs::create(stream, ImgfsParams::default(), codec()).unwrap()
}

fn reopen(fs: &Imgfs) -> Imgfs {
    Imgfs::open(fs.stream().clone(), codec()).unwrap()
}

fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill(&mut data[..]);
    data
}

fn add(fs: &mut Imgfs, name: &str, data: &[u8]) {
    fs.add(name, &mut &data[..]).unwrap();
}

/// Write a module record by hand: header blob as file data plus a section chain.
fn write_module(fs: &mut Imgfs, name: &str, header: &[u8], sections: &[(&str, &[u8])]) {
    let mut next = 0u32;
    for (sname, data) in sections.iter().rev() {
        let (index_ptr, index_size, _) = fs.write_data(data).unwrap();
        let address = fs.alloc_slot().unwrap();
        let rec = SectionRecord {
            datatable: 0,
            next,
            name: fs.store_name(sname).unwrap(),
            size: data.len() as u32,
            index_ptr,
            index_size,
        };
        fs.stream.write_at(address, &rec.encode()).unwrap();
        next = address as u32;
    }
    let (index_ptr, index_size, _) = fs.write_data(header).unwrap();
    let address = fs.alloc_slot().unwrap();
    let mut rec = FileRecord::new(fs.store_name(name).unwrap(), 0);
    rec.magic = MODULE_MAGIC;
    rec.section_list = next;
    rec.size = header.len() as u32;
    rec.index_ptr = index_ptr;
    rec.index_size = index_size;
    fs.stream.write_at(address, &rec.encode()).unwrap();
}

#[test]
fn test_create_empty() {
    let fs = fresh();
    let stats = fs.stats();
    assert_eq!(stats.files, 0);
    assert_eq!(stats.directory_blocks, 1);
    assert_eq!(stats.entry_slots, fs.header().entries_per_block());
    assert_eq!(stats.used_bytes, 0x2000);

    let again = reopen(&fs);
    assert!(again.entries().is_empty());
}

#[test]
fn test_round_trip_sizes() {
    let mut fs = fresh();
    let sizes = [0, 1, CS - 1, CS, CS + 1, 10 * CS, PIECE_SIZE * 3 + 17];
    for (i, &size) in sizes.iter().enumerate() {
        let data = noise(size, i as u64);
        add(&mut fs, &format!("file{}.bin", i), &data);
    }

    let fs = reopen(&fs);
    for (i, &size) in sizes.iter().enumerate() {
        let name = format!("file{}.bin", i);
        assert_eq!(fs.extract(&name).unwrap(), noise(size, i as u64), "{}", name);
        assert_eq!(fs.stat(&name).unwrap().size, size as u64);
    }
    fs.allocation_map().check_invariants().unwrap();
}

#[test]
fn test_compressible_data_is_stored_smaller() {
    let mut fs = fresh();
    let data = vec![0x41u8; 3 * PIECE_SIZE];
    add(&mut fs, "zeros.dat", &data);
    let info = fs.stat("zeros.dat").unwrap();
    assert!(info.stored_size < info.size);
    assert_eq!(reopen(&fs).extract("zeros.dat").unwrap(), data);
}

#[test]
fn test_without_codec_data_is_stored_raw() {
    let stream = SharedStream::new(MemoryStore::new());
    let mut fs = Imgfs::create(stream, ImgfsParams::default(), Arc::new(UnavailableCodec)).unwrap();
    let data = vec![7u8; 5000];
    add(&mut fs, "raw.bin", &data);
    assert_eq!(fs.stat("raw.bin").unwrap().stored_size, 5000);
    assert_eq!(fs.extract("raw.bin").unwrap(), data);
}

#[test]
fn test_delete_then_add_reuses_space() {
    let mut fs = fresh();
    add(&mut fs, "keep.bin", &noise(CS * 3, 1));
    let baseline = fs.allocation_map().used_bytes();

    add(&mut fs, "temp.bin", &noise(CS * 5, 2));
    let grown = fs.stream().size();
    fs.delete("temp.bin").unwrap();
    assert_eq!(fs.allocation_map().used_bytes(), baseline);
    assert!(!fs.contains("temp.bin"));

    add(&mut fs, "again.bin", &noise(CS * 5, 3));
    assert_eq!(fs.stream().size(), grown);
    assert_eq!(fs.stats().used_slots, 4);

    let fs = reopen(&fs);
    assert_eq!(fs.extract("again.bin").unwrap(), noise(CS * 5, 3));
    assert_eq!(fs.extract("keep.bin").unwrap(), noise(CS * 3, 1));
}

#[test]
fn test_freed_chunks_read_erased() {
    let mut fs = fresh();
    add(&mut fs, "gone.bin", &noise(CS, 4));
    fs.delete("gone.bin").unwrap();
    let tail = fs.stream().read_vec(0x2000, CS).unwrap();
    assert!(tail.iter().all(|&b| b == 0xff));
}

#[test]
fn test_add_replaces_existing() {
    let mut fs = fresh();
    add(&mut fs, "cfg.txt", b"first");
    add(&mut fs, "CFG.TXT", b"second version");
    assert_eq!(fs.entries().len(), 1);
    assert_eq!(fs.extract("cfg.txt").unwrap(), b"second version");
}

#[test]
fn test_delete_missing() {
    let mut fs = fresh();
    assert!(matches!(fs.delete("nope"), Err(FlashError::NotFound(_))));
}

#[test]
fn test_rename_across_name_tiers() {
    let mut fs = fresh();
    let data = noise(1234, 9);
    add(&mut fs, "abc", &data);
    let used = fs.allocation_map().used_bytes();
    let slots = fs.stats().used_slots;

    let long = "a_rather_long_file_name_over_24.txt";
    for name in ["hello_world.txt", "hello_there.txt", long, "x", "abc"] {
        let from = fs.entries()[0].name.clone();
        fs.rename(&from, name).unwrap();
        let again = reopen(&fs);
        assert_eq!(again.entries()[0].name, name);
        assert_eq!(again.extract(name).unwrap(), data);
    }
    assert_eq!(fs.allocation_map().used_bytes(), used);
    assert_eq!(fs.stats().used_slots, slots);
}

#[test]
fn test_rename_conflicts() {
    let mut fs = fresh();
    add(&mut fs, "a.txt", b"a");
    add(&mut fs, "b.txt", b"b");
    assert!(matches!(
        fs.rename("a.txt", "B.TXT"),
        Err(FlashError::AlreadyExists(_))
    ));
    assert!(matches!(
        fs.rename("c.txt", "d.txt"),
        Err(FlashError::NotFound(_))
    ));

    fs.rename("a.txt", "A.TXT").unwrap();
    assert_eq!(reopen(&fs).stat("a.txt").unwrap().name, "A.TXT");
}

#[test]
fn test_directory_grows_blocks() {
    let mut fs = fresh();
    let per_block = fs.header().entries_per_block();
    for i in 0..per_block + 2 {
        add(&mut fs, &format!("f{:03}", i), &[i as u8]);
    }
    assert_eq!(fs.stats().directory_blocks, 2);

    let fs = reopen(&fs);
    assert_eq!(fs.stats().files, per_block + 2);
    assert_eq!(fs.extract("f001").unwrap(), vec![1]);
}

#[test]
fn test_failed_add_rolls_back() {
    let inner = SharedStream::new(MemoryStore::from_vec(vec![0xff; 0x3000]));
    let window = SharedStream::new(RangeView::new(inner, 0, 0x3000).unwrap());
    let mut fs = Imgfs::create(window, ImgfsParams::default(), codec()).unwrap();
    add(&mut fs, "tiny", b"fits");
    let used = fs.allocation_map().used_bytes();

    let big = noise(0x4000, 5);
    assert!(fs.add("big.bin", &mut &big[..]).is_err());
    assert!(!fs.contains("big.bin"));
    assert_eq!(fs.allocation_map().used_bytes(), used);
    assert_eq!(fs.stats().used_slots, 1);
    assert_eq!(fs.extract("tiny").unwrap(), b"fits");
}

#[test]
fn test_failed_replace_keeps_old_contents() {
    let inner = SharedStream::new(MemoryStore::from_vec(vec![0xff; 0x3000]));
    let window = SharedStream::new(RangeView::new(inner, 0, 0x3000).unwrap());
    let mut fs = Imgfs::create(window.clone(), ImgfsParams::default(), codec()).unwrap();
    let keep = noise(0x300, 8);
    add(&mut fs, "keep.bin", &keep);
    let before = window.read_vec(0, 0x3000).unwrap();

    let big = noise(0x4000, 9);
    assert!(fs.add("keep.bin", &mut &big[..]).is_err());
    assert_eq!(window.read_vec(0, 0x3000).unwrap(), before);
    assert_eq!(fs.extract("keep.bin").unwrap(), keep);

    let fs = Imgfs::open(window, codec()).unwrap();
    assert!(fs.contains("keep.bin"));
    assert_eq!(fs.extract("keep.bin").unwrap(), keep);
}

#[test]
fn test_rejects_bad_names() {
    let mut fs = fresh();
    assert!(fs.add("", &mut &b"x"[..]).is_err());
    assert!(fs.add("a\0b", &mut &b"x"[..]).is_err());
}

#[test]
fn test_bad_entry_magic_is_corrupt() {
    let mut fs = fresh();
    add(&mut fs, "a.txt", b"hello");
    fs.stream()
        .write_u32_at(0x1000 + 8 + 0x34, 0x1234_5678)
        .unwrap();
    let err = Imgfs::open(fs.stream().clone(), codec()).err().unwrap();
    assert!(matches!(
        err,
        FlashError::CorruptDirectory { offset: 0x103c, .. }
    ));
}

#[test]
fn test_bad_dirblock_magic_is_corrupt() {
    let fs = fresh();
    fs.stream().write_u32_at(0x1000, 0).unwrap();
    assert!(matches!(
        Imgfs::open(fs.stream().clone(), codec()),
        Err(FlashError::CorruptDirectory { offset: 0x1000, .. })
    ));
}

#[test]
fn test_dirblock_loop_is_corrupt() {
    let fs = fresh();
    fs.stream().write_u32_at(0x1004, 0x1000).unwrap();
    assert!(matches!(
        Imgfs::open(fs.stream().clone(), codec()),
        Err(FlashError::CorruptDirectory { .. })
    ));
}

#[test]
fn test_not_an_imgfs() {
    let stream = SharedStream::new(MemoryStore::from_vec(vec![0u8; 0x2000]));
    assert!(Imgfs::open(stream, codec()).err().unwrap().is_format());
}

fn module_header_blob() -> Vec<u8> {
    let mut blob = sample_e32(2).encode(false);
    for rva in [0x1000u32, 0x3000] {
        let o32 = O32Rom {
            vsize: 0x100,
            rva,
            psize: 0x100,
            dataptr: 0,
            realaddr: 0x1000_0000 + rva,
            flags: 0x6000_0020,
        };
        blob.extend_from_slice(&o32.encode());
    }
    blob
}

#[test]
fn test_module_extraction() {
    let mut fs = fresh();
    let text = noise(0x100, 10);
    let data = noise(0x80, 11);
    write_module(
        &mut fs,
        "coredll.dll",
        &module_header_blob(),
        &[(".text", &text), (".data", &data)],
    );

    let mut fs = reopen(&fs);
    let info = fs.stat("coredll.dll").unwrap();
    assert_eq!(info.kind, EntryKind::Module);
    assert_eq!(fs.stats().modules, 1);
    assert!(matches!(
        fs.extract("coredll.dll"),
        Err(FlashError::Unsupported(_))
    ));

    let builder = Arc::new(ConcatBuilder::default());
    fs.set_exe_builder(builder.clone());
    fs.set_cpu_type(0x01c2);
    let out = fs.extract("coredll.dll").unwrap();
    assert_eq!(out, [text, data].concat());

    let seen = builder.seen.lock();
    assert_eq!(seen[0].0.cpu_type, 0x01c2);
    assert_eq!(seen[0].0.entry_rva, 0x1234);
    assert_eq!(seen[0].1, vec![".text".to_string(), ".data".to_string()]);
}

#[test]
fn test_module_delete_frees_sections() {
    let mut fs = fresh();
    let baseline = fs.allocation_map().used_bytes();
    write_module(
        &mut fs,
        "nk.exe",
        &module_header_blob(),
        &[(".text", &noise(0x300, 12))],
    );
    let mut fs = reopen(&fs);
    fs.delete("nk.exe").unwrap();
    assert_eq!(fs.allocation_map().used_bytes(), baseline);
    assert_eq!(fs.stats().used_slots, 0);
}
