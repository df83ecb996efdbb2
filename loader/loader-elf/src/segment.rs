//! # Program Headers and the Segment Index

use crate::header::{BinaryHeader, ElfClass, read_exact_or};
use crate::image::ImageError;
use core::mem::size_of;
use core::ptr::read_unaligned;
use loader_addresses::VirtualAddress;
use std::io::{Read, Seek, SeekFrom};

const PT_LOAD: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(clippy::struct_field_names)]
struct Elf32Phdr {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_paddr: u32,
    p_filesz: u32,
    p_memsz: u32,
    p_flags: u32,
    p_align: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(clippy::struct_field_names)]
struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

impl ElfClass {
    /// Size in bytes of one program header record for this class.
    #[must_use]
    pub const fn segment_entry_size(self) -> usize {
        match self {
            Self::Elf32 => size_of::<Elf32Phdr>(),
            Self::Elf64 => size_of::<Elf64Phdr>(),
        }
    }
}

/// A loadable (`PT_LOAD`) segment.
///
/// `memsz >= filesz`; the bytes past `filesz` are zero in memory and have no
/// backing in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: VirtualAddress,
    pub offset: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub flags: PFlags,
    pub align: u64,
}

impl Segment {
    /// Whether `addr` lies in `[vaddr, vaddr + memsz)`.
    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: VirtualAddress) -> bool {
        let start = self.vaddr.as_u64();
        let addr = addr.as_u64();
        addr >= start && addr - start < self.memsz
    }

    /// Exclusive end of the in-memory range, saturating at the top of the
    /// address space.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.vaddr.as_u64().saturating_add(self.memsz))
    }

    /// Exclusive end of the file-backed part of the segment.
    #[inline]
    #[must_use]
    pub const fn file_end(&self) -> VirtualAddress {
        VirtualAddress::new(self.vaddr.as_u64().saturating_add(self.filesz))
    }
}

/// A resolved segment: its position in the table and a borrow of it.
#[derive(Debug, Clone, Copy)]
pub struct SegmentRef<'a> {
    pub index: usize,
    pub segment: &'a Segment,
}

/// The loadable segments of an image in file order.
///
/// Segment counts are small (a handful for a static executable), so lookups
/// are a linear scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentTable {
    segments: Vec<Segment>,
}

impl SegmentTable {
    #[must_use]
    pub const fn new(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    /// Read the program header table described by `header` and keep the
    /// `PT_LOAD` entries.
    pub(crate) fn read<R: Read + Seek>(
        reader: &mut R,
        header: &BinaryHeader,
    ) -> Result<Self, ImageError> {
        let entry_size = usize::from(header.phentsize);
        let expected = header.class.segment_entry_size();
        if header.phnum > 0 && entry_size < expected {
            return Err(ImageError::SegmentEntrySize {
                declared: header.phentsize,
                expected,
            });
        }

        reader.seek(SeekFrom::Start(header.phoff))?;
        let mut table = vec![0u8; header.segment_table_size()];
        read_exact_or(reader, &mut table, || ImageError::TruncatedSegmentTable)?;

        let segments = table
            .chunks_exact(entry_size.max(1))
            .take(usize::from(header.phnum))
            .filter_map(|raw| decode_phdr(header.class, raw))
            .collect();

        Ok(Self { segments })
    }

    /// Find the segment owning `addr`: the first whose half-open range
    /// contains it.
    #[must_use]
    pub fn resolve(&self, addr: VirtualAddress) -> Option<SegmentRef<'_>> {
        self.segments
            .iter()
            .enumerate()
            .find(|(_, segment)| segment.contains(addr))
            .map(|(index, segment)| SegmentRef { index, segment })
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Segment] {
        &self.segments
    }

    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Decode one program header record; `None` for anything but `PT_LOAD`.
fn decode_phdr(class: ElfClass, raw: &[u8]) -> Option<Segment> {
    let segment = match class {
        ElfClass::Elf32 => {
            // SAFETY: entry size was checked against size_of::<Elf32Phdr>().
            let ph = unsafe { read_unaligned(raw.as_ptr().cast::<Elf32Phdr>()) };
            if ph.p_type != PT_LOAD {
                return None;
            }
            Segment {
                vaddr: VirtualAddress::from(ph.p_vaddr),
                offset: u64::from(ph.p_offset),
                filesz: u64::from(ph.p_filesz),
                memsz: u64::from(ph.p_memsz),
                flags: PFlags::from_bits(ph.p_flags),
                align: u64::from(ph.p_align),
            }
        }
        ElfClass::Elf64 => {
            // SAFETY: entry size was checked against size_of::<Elf64Phdr>().
            let ph = unsafe { read_unaligned(raw.as_ptr().cast::<Elf64Phdr>()) };
            if ph.p_type != PT_LOAD {
                return None;
            }
            Segment {
                vaddr: VirtualAddress::new(ph.p_vaddr),
                offset: ph.p_offset,
                filesz: ph.p_filesz,
                memsz: ph.p_memsz,
                flags: PFlags::from_bits(ph.p_flags),
                align: ph.p_align,
            }
        }
    };
    Some(segment)
}

/// Bitfield wrapper for `p_flags` (32-bit)
///
/// Layout (LSB→MSB):
/// - bit 0: execute
/// - bit 1: write
/// - bit 2: read
/// - bits 3..31: reserved / OS and processor specific
#[bitfield_struct::bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PFlags {
    #[bits(1)]
    pub execute: bool,
    #[bits(1)]
    pub write: bool,
    #[bits(1)]
    pub read: bool,
    #[bits(29)]
    __: u32,
}

impl PFlags {
    /// `r-x` style rendering for diagnostics.
    #[must_use]
    pub fn as_rwx(self) -> [char; 3] {
        [
            if self.read() { 'r' } else { '-' },
            if self.write() { 'w' } else { '-' },
            if self.execute() { 'x' } else { '-' },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(vaddr: u64, memsz: u64) -> Segment {
        Segment {
            vaddr: VirtualAddress::new(vaddr),
            offset: 0,
            filesz: 0,
            memsz,
            flags: PFlags::new().with_read(true),
            align: 0x1000,
        }
    }

    #[test]
    fn phdr_sizes() {
        assert_eq!(ElfClass::Elf32.segment_entry_size(), 32);
        assert_eq!(ElfClass::Elf64.segment_entry_size(), 56);
    }

    #[test]
    fn contains_is_half_open() {
        let s = segment(0x1_0000, 0x100);
        assert!(!s.contains(VirtualAddress::new(0xFFFF)));
        assert!(s.contains(VirtualAddress::new(0x1_0000)));
        assert!(s.contains(VirtualAddress::new(0x1_00FF)));
        assert!(!s.contains(VirtualAddress::new(0x1_0100)));
    }

    #[test]
    fn empty_segment_contains_nothing() {
        let s = segment(0x1_0000, 0);
        assert!(!s.contains(VirtualAddress::new(0x1_0000)));
    }

    #[test]
    fn contains_does_not_overflow() {
        let s = segment(u64::MAX - 0x10, 0x100);
        assert!(s.contains(VirtualAddress::new(u64::MAX)));
        assert_eq!(s.end().as_u64(), u64::MAX);
    }

    #[test]
    fn resolve_picks_owning_segment() {
        let table = SegmentTable::new(vec![segment(0x1_0000, 0x1000), segment(0x2_0000, 0x10)]);
        let hit = table.resolve(VirtualAddress::new(0x2_0008)).unwrap();
        assert_eq!(hit.index, 1);
        assert_eq!(hit.segment.vaddr.as_u64(), 0x2_0000);
        assert!(table.resolve(VirtualAddress::new(0x2_0010)).is_none());
        assert!(table.resolve(VirtualAddress::new(0x1_5000)).is_none());
    }

    #[test]
    fn resolve_is_idempotent() {
        let table = SegmentTable::new(vec![segment(0x1_0000, 0x1000)]);
        let addr = VirtualAddress::new(0x1_0123);
        let a = table.resolve(addr).unwrap();
        let b = table.resolve(addr).unwrap();
        assert_eq!(a.index, b.index);
        assert!(core::ptr::eq(a.segment, b.segment));
    }

    #[test]
    fn flags_render() {
        let f = PFlags::from_bits(0x5);
        assert!(f.read() && f.execute() && !f.write());
        assert_eq!(f.as_rwx(), ['r', '-', 'x']);
    }
}
