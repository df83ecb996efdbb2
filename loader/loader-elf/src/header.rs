//! # ELF Header Parsing

use crate::image::ImageError;
use core::mem::size_of;
use core::ptr::read_unaligned;
use loader_addresses::VirtualAddress;
use std::io::{self, Read};

const EI_NIDENT: usize = 16;
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;

const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(clippy::struct_field_names)]
struct Elf32Ehdr {
    e_ident: [u8; EI_NIDENT],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u32,
    e_phoff: u32,
    e_shoff: u32,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(clippy::struct_field_names)]
struct Elf64Ehdr {
    e_ident: [u8; EI_NIDENT],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

/// ELF file class (address width of the image).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfClass {
    Elf32,
    Elf64,
}

impl ElfClass {
    /// Size in bytes of the file header for this class.
    #[must_use]
    pub const fn header_size(self) -> usize {
        match self {
            Self::Elf32 => size_of::<Elf32Ehdr>(),
            Self::Elf64 => size_of::<Elf64Ehdr>(),
        }
    }

    /// Pointer width in bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Self::Elf32 => 32,
            Self::Elf64 => 64,
        }
    }

    /// Whether images of this class can run natively in this process.
    #[must_use]
    pub const fn matches_host(self) -> bool {
        self.bits() == usize::BITS
    }
}

/// The parts of the ELF file header the loader needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryHeader {
    pub class: ElfClass,
    pub machine: u16,
    pub entry: VirtualAddress,
    pub phoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
}

impl BinaryHeader {
    const EI_MAGIC_BYTES: [u8; 4] = [0x7F, b'E', b'L', b'F'];

    /// Read the file header from the current position of `reader`.
    ///
    /// Only the magic, the class and the data encoding are checked.
    pub(crate) fn read<R: Read>(reader: &mut R) -> Result<Self, ImageError> {
        let mut bytes = [0u8; size_of::<Elf64Ehdr>()];
        read_exact_or(reader, &mut bytes[..EI_NIDENT], || {
            ImageError::TruncatedHeader
        })?;

        if bytes[0..4] != Self::EI_MAGIC_BYTES {
            return Err(ImageError::BadMagic);
        }

        let class = match bytes[EI_CLASS] {
            ELFCLASS32 => ElfClass::Elf32,
            ELFCLASS64 => ElfClass::Elf64,
            other => return Err(ImageError::UnsupportedClass(other)),
        };

        if bytes[EI_DATA] != ELFDATA2LSB {
            return Err(ImageError::UnsupportedEncoding(bytes[EI_DATA]));
        }

        let size = class.header_size();
        read_exact_or(reader, &mut bytes[EI_NIDENT..size], || {
            ImageError::TruncatedHeader
        })?;

        Ok(Self::decode(class, &bytes))
    }

    fn decode(class: ElfClass, bytes: &[u8; size_of::<Elf64Ehdr>()]) -> Self {
        match class {
            ElfClass::Elf32 => {
                // SAFETY: the buffer is larger than Elf32Ehdr; unaligned read.
                let ehdr = unsafe { read_unaligned(bytes.as_ptr().cast::<Elf32Ehdr>()) };
                Self {
                    class,
                    machine: ehdr.e_machine,
                    entry: VirtualAddress::from(ehdr.e_entry),
                    phoff: u64::from(ehdr.e_phoff),
                    phentsize: ehdr.e_phentsize,
                    phnum: ehdr.e_phnum,
                }
            }
            ElfClass::Elf64 => {
                // SAFETY: the buffer is exactly one Elf64Ehdr; unaligned read.
                let ehdr = unsafe { read_unaligned(bytes.as_ptr().cast::<Elf64Ehdr>()) };
                Self {
                    class,
                    machine: ehdr.e_machine,
                    entry: VirtualAddress::new(ehdr.e_entry),
                    phoff: ehdr.e_phoff,
                    phentsize: ehdr.e_phentsize,
                    phnum: ehdr.e_phnum,
                }
            }
        }
    }

    /// Size in bytes of the program header table as declared by the header.
    #[must_use]
    pub fn segment_table_size(&self) -> usize {
        usize::from(self.phentsize) * usize::from(self.phnum)
    }
}

/// `read_exact`, but a short read turns into the caller's error.
pub(crate) fn read_exact_or<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    truncated: impl FnOnce() -> ImageError,
) -> Result<(), ImageError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(truncated()),
        Err(e) => Err(ImageError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn ident(class: u8) -> Vec<u8> {
        let mut v = vec![0x7F, b'E', b'L', b'F', class, 1, 1];
        v.resize(EI_NIDENT, 0);
        v
    }

    #[test]
    fn header_sizes() {
        assert_eq!(ElfClass::Elf32.header_size(), 52);
        assert_eq!(ElfClass::Elf64.header_size(), 64);
    }

    #[test]
    fn decodes_elf32_fields() {
        let mut bytes = ident(ELFCLASS32);
        bytes.extend_from_slice(&2u16.to_le_bytes()); // e_type
        bytes.extend_from_slice(&3u16.to_le_bytes()); // e_machine
        bytes.extend_from_slice(&1u32.to_le_bytes()); // e_version
        bytes.extend_from_slice(&0x0804_8000u32.to_le_bytes()); // e_entry
        bytes.extend_from_slice(&52u32.to_le_bytes()); // e_phoff
        bytes.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
        bytes.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        bytes.extend_from_slice(&52u16.to_le_bytes()); // e_ehsize
        bytes.extend_from_slice(&32u16.to_le_bytes()); // e_phentsize
        bytes.extend_from_slice(&2u16.to_le_bytes()); // e_phnum
        bytes.extend_from_slice(&[0; 6]);

        let hdr = BinaryHeader::read(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(hdr.class, ElfClass::Elf32);
        assert_eq!(hdr.machine, 3);
        assert_eq!(hdr.entry.as_u64(), 0x0804_8000);
        assert_eq!(hdr.phoff, 52);
        assert_eq!(hdr.phentsize, 32);
        assert_eq!(hdr.phnum, 2);
        assert_eq!(hdr.segment_table_size(), 64);
    }

    #[test]
    fn short_ident_is_truncated() {
        let err = BinaryHeader::read(&mut Cursor::new(vec![0x7F, b'E'])).unwrap_err();
        assert!(matches!(err, ImageError::TruncatedHeader));
    }

    #[test]
    fn short_body_is_truncated() {
        let mut bytes = ident(ELFCLASS64);
        bytes.extend_from_slice(&[0; 20]);
        let err = BinaryHeader::read(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, ImageError::TruncatedHeader));
    }

    #[test]
    fn wrong_magic() {
        let err = BinaryHeader::read(&mut Cursor::new(vec![0u8; 64])).unwrap_err();
        assert!(matches!(err, ImageError::BadMagic));
    }

    #[test]
    fn unknown_class() {
        let mut bytes = ident(7);
        bytes.resize(64, 0);
        let err = BinaryHeader::read(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, ImageError::UnsupportedClass(7)));
    }

    #[test]
    fn big_endian_rejected() {
        let mut bytes = ident(ELFCLASS32);
        bytes[EI_DATA] = 2;
        bytes.resize(64, 0);
        let err = BinaryHeader::read(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, ImageError::UnsupportedEncoding(2)));
    }
}
