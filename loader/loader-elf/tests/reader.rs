use loader_elf::{ElfClass, Image, ImageError};
use std::path::PathBuf;
use std::{fs, process};

const PT_LOAD: u32 = 1;
const PT_NOTE: u32 = 4;

/// (type, offset, vaddr, filesz, memsz, flags)
type Phdr = (u32, u32, u32, u32, u32, u32);

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("loader-elf-{}-{name}", process::id()))
}

fn elf32(entry: u32, phdrs: &[Phdr]) -> Vec<u8> {
    let mut b = vec![0x7F, b'E', b'L', b'F', 1, 1, 1];
    b.resize(16, 0);
    b.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    b.extend_from_slice(&3u16.to_le_bytes()); // EM_386
    b.extend_from_slice(&1u32.to_le_bytes());
    b.extend_from_slice(&entry.to_le_bytes());
    b.extend_from_slice(&52u32.to_le_bytes()); // e_phoff
    b.extend_from_slice(&0u32.to_le_bytes());
    b.extend_from_slice(&0u32.to_le_bytes());
    b.extend_from_slice(&52u16.to_le_bytes());
    b.extend_from_slice(&32u16.to_le_bytes());
    b.extend_from_slice(&u16::try_from(phdrs.len()).unwrap().to_le_bytes());
    b.extend_from_slice(&[0; 6]);
    assert_eq!(b.len(), 52);

    for &(ty, offset, vaddr, filesz, memsz, flags) in phdrs {
        for v in [ty, offset, vaddr, vaddr, filesz, memsz, flags, 0x1000] {
            b.extend_from_slice(&v.to_le_bytes());
        }
    }
    b
}

#[test]
fn reads_loadable_segments_in_file_order() {
    let path = temp_path("ordered");
    let bytes = elf32(
        0x0804_8054,
        &[
            (PT_LOAD, 0, 0x0804_8000, 0x200, 0x200, 0x5),
            (PT_NOTE, 0x100, 0x0804_8100, 0x20, 0x20, 0x4),
            (PT_LOAD, 0x1000, 0x0804_9000, 0x40, 0x1000, 0x6),
        ],
    );
    fs::write(&path, bytes).unwrap();

    let image = Image::open(&path).unwrap();
    assert_eq!(image.class(), ElfClass::Elf32);
    assert_eq!(image.header().entry.as_u64(), 0x0804_8054);
    assert_eq!(image.header().phnum, 3);

    let segs = image.segments().as_slice();
    assert_eq!(segs.len(), 2);
    assert_eq!(segs[0].vaddr.as_u64(), 0x0804_8000);
    assert!(segs[0].flags.execute());
    assert_eq!(segs[1].vaddr.as_u64(), 0x0804_9000);
    assert_eq!(segs[1].offset, 0x1000);
    assert_eq!(segs[1].filesz, 0x40);
    assert_eq!(segs[1].memsz, 0x1000);
    assert!(segs[1].flags.write());

    let hit = image
        .segments()
        .resolve(loader_addresses::VirtualAddress::new(0x0804_9800))
        .unwrap();
    assert_eq!(hit.index, 1);

    fs::remove_file(&path).ok();
}

#[test]
fn missing_file_is_open_error() {
    let err = Image::open(temp_path("does-not-exist")).unwrap_err();
    assert!(matches!(err, ImageError::Open { .. }));
    assert!(err.to_string().contains("does-not-exist"));
}

#[test]
fn truncated_header() {
    let path = temp_path("short-header");
    let mut bytes = elf32(0, &[]);
    bytes.truncate(40);
    fs::write(&path, bytes).unwrap();

    let err = Image::open(&path).unwrap_err();
    assert!(matches!(err, ImageError::TruncatedHeader));
    fs::remove_file(&path).ok();
}

#[test]
fn truncated_segment_table() {
    let path = temp_path("short-table");
    let mut bytes = elf32(0, &[(PT_LOAD, 0, 0x1_0000, 0x10, 0x10, 0x5); 2]);
    bytes.truncate(52 + 32 + 10);
    fs::write(&path, bytes).unwrap();

    let err = Image::open(&path).unwrap_err();
    assert!(matches!(err, ImageError::TruncatedSegmentTable));
    fs::remove_file(&path).ok();
}

#[test]
fn undersized_entries_are_rejected() {
    let path = temp_path("entry-size");
    let mut bytes = elf32(0, &[(PT_LOAD, 0, 0x1_0000, 0x10, 0x10, 0x5)]);
    bytes[42..44].copy_from_slice(&16u16.to_le_bytes());
    fs::write(&path, bytes).unwrap();

    let err = Image::open(&path).unwrap_err();
    assert!(matches!(
        err,
        ImageError::SegmentEntrySize {
            declared: 16,
            expected: 32
        }
    ));
    fs::remove_file(&path).ok();
}
